//! Persistence
//!
//! A persistent binds one reactive entity to a storage key and a set of
//! registered backends. After a successful setup, initial loading runs: a
//! stored value overwrites the in-memory one; a miss pushes the in-memory
//! value into the backends instead. From then on a side effect mirrors
//! every commit to all configured backends, fire-and-forget.
//!
//! A persistent whose key or backend list cannot be resolved stays
//! not-ready: every load/save/remove on it is a logged no-op.
//!
//! # Collection Recursion
//!
//! Persisting a collection persists a flag under the collection's own key
//! (boolean `true`), the default group's key list under
//! `"_{collectionKey}_group_{groupKey}"`, and every item individually under
//! `"_{collectionKey}_item_{itemKey}"`. The patterns are stable; persisted
//! data must survive re-implementation, so they are reproduced exactly.

use std::sync::{Arc, Weak};

use crate::collection::collection::{Collection, CollectionCore, DEFAULT_GROUP_KEY};
use crate::collection::group::AddMethod;
use crate::collection::item::{Item, ItemKey};
use crate::error::ConfigError;
use crate::reactive::job::JobConfig;
use crate::reactive::state::{State, StateCore, StateValue};
use crate::storage::backend::{Storage, StorageRegistry};

/// Name of the side effect mirroring commits into storage.
pub(crate) const SIDE_EFFECT_STORAGE: &str = "rebuildStorage";

/// Storage key of one persisted item.
pub(crate) fn item_storage_key(collection_key: &str, item_key: &ItemKey) -> String {
    format!("_{}_item_{}", collection_key, item_key)
}

/// Storage key of one persisted group.
pub(crate) fn group_storage_key(collection_key: &str, group_key: &str) -> String {
    format!("_{}_group_{}", collection_key, group_key)
}

/// Configuration for `persist` calls.
#[derive(Debug, Clone, Default)]
pub struct PersistConfig {
    /// Explicit storage key; defaults to the entity's own key.
    pub key: Option<String>,

    /// Backend names to mirror into; defaults to the registered default
    /// backend.
    pub storage_keys: Vec<String>,
}

impl PersistConfig {
    /// Config with just an explicit storage key.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Key and backend resolution shared by every persistent flavor.
pub(crate) struct PersistentBase {
    key: String,
    storages: Vec<Arc<Storage>>,
    storage_keys: Vec<String>,
    ready: bool,
}

impl PersistentBase {
    /// Resolve the storage key (explicit, else the entity's own key) and
    /// the backend list (explicit names, else the default backend). Any
    /// failure leaves the base not-ready.
    fn resolve(
        registry: &StorageRegistry,
        explicit_key: Option<String>,
        fallback_key: Option<String>,
        storage_keys: Vec<String>,
    ) -> Self {
        let Some(key) = explicit_key.or(fallback_key) else {
            tracing::error!(err = %ConfigError::MissingKey, "persist aborted");
            return Self {
                key: String::new(),
                storages: Vec::new(),
                storage_keys,
                ready: false,
            };
        };

        let storages = registry.resolve(&storage_keys);
        let ready = !storages.is_empty();
        if !ready {
            tracing::error!(
                key = %key,
                err = %ConfigError::NoDefaultStorage,
                "persist aborted"
            );
        }

        Self {
            key,
            storages,
            storage_keys,
            ready,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn ready(&self) -> bool {
        self.ready
    }

    /// Load from the first backend holding the key.
    fn load_value(&self, key: &str) -> Option<serde_json::Value> {
        if !self.ready {
            tracing::debug!(key, "persistent not ready, load skipped");
            return None;
        }
        self.storages.iter().find_map(|storage| storage.get(key))
    }

    /// Mirror into every backend, fire-and-forget.
    fn save_value(&self, key: &str, value: &serde_json::Value) {
        if !self.ready {
            tracing::debug!(key, "persistent not ready, save skipped");
            return;
        }
        for storage in &self.storages {
            storage.set(key, value);
        }
    }

    /// Remove from every backend, fire-and-forget.
    fn remove_value(&self, key: &str) {
        if !self.ready {
            tracing::debug!(key, "persistent not ready, remove skipped");
            return;
        }
        for storage in &self.storages {
            storage.remove(key);
        }
    }
}

/// Bidirectional sync between one state and the configured backends.
pub struct StatePersistent<V: StateValue> {
    base: PersistentBase,
    state: Weak<StateCore<V>>,
}

impl<V: StateValue> StatePersistent<V> {
    /// Resolve the key and backends, run initial loading, and attach the
    /// commit mirror.
    pub(crate) fn attach(state: &State<V>, config: PersistConfig) -> Option<Arc<Self>> {
        let registry = state.core().pulse().storages().clone();
        let base = PersistentBase::resolve(&registry, config.key, state.key(), config.storage_keys);

        let persistent = Arc::new(Self {
            base,
            state: Arc::downgrade(state.core()),
        });

        if !persistent.base.ready() {
            return Some(persistent);
        }

        persistent.initial_loading(state);

        let mirror = Arc::clone(&persistent);
        state.add_side_effect(SIDE_EFFECT_STORAGE, 100, move |config| {
            if config.storage {
                mirror.save_current();
            }
        });

        Some(persistent)
    }

    /// Whether key and backends resolved successfully.
    pub fn ready(&self) -> bool {
        self.base.ready()
    }

    /// The resolved storage key.
    pub fn key(&self) -> &str {
        self.base.key()
    }

    /// Load hit: the stored value overwrites memory (without mirroring
    /// straight back). Miss: the in-memory value seeds the backends.
    fn initial_loading(&self, state: &State<V>) {
        match self.base.load_value(self.base.key()) {
            Some(json) => match serde_json::from_value::<V>(json) {
                Ok(value) => {
                    state.core().ingest_value(value, JobConfig::from_storage());
                }
                Err(err) => {
                    tracing::warn!(
                        key = %self.base.key(),
                        %err,
                        "stored value no longer deserializes, overwriting"
                    );
                    self.save_current();
                }
            },
            None => self.save_current(),
        }
    }

    fn save_current(&self) {
        let Some(core) = self.state.upgrade() else {
            return;
        };
        match serde_json::to_value(core.committed_value()) {
            Ok(json) => self.base.save_value(self.base.key(), &json),
            Err(err) => {
                tracing::warn!(key = %self.base.key(), %err, "value has no JSON form")
            }
        }
    }
}

/// Bidirectional sync between a collection and the configured backends.
///
/// Recurses over the collection: its flag key, the default group's key
/// list, and one entry per item.
pub struct CollectionPersistent<V: StateValue> {
    base: PersistentBase,
    collection: Weak<CollectionCore<V>>,
}

impl<V: StateValue> CollectionPersistent<V> {
    pub(crate) fn attach(collection: &Collection<V>, config: PersistConfig) -> Option<Arc<Self>> {
        let registry = collection.core().pulse().storages().clone();
        let base =
            PersistentBase::resolve(&registry, config.key, collection.key(), config.storage_keys);

        let persistent = Arc::new(Self {
            base,
            collection: Arc::downgrade(collection.core()),
        });

        if !persistent.base.ready() {
            return Some(persistent);
        }

        let flagged = matches!(
            persistent.base.load_value(persistent.base.key()),
            Some(serde_json::Value::Bool(true))
        );
        if flagged {
            persistent.load_values(collection);
        }
        persistent.persist_values(collection);

        Some(persistent)
    }

    /// Whether key and backends resolved successfully.
    pub fn ready(&self) -> bool {
        self.base.ready()
    }

    /// The resolved storage key.
    pub fn key(&self) -> &str {
        self.base.key()
    }

    /// Partial load: the stored default-group list drives per-item loads;
    /// entries that fail to load stay not-found in the group.
    fn load_values(&self, collection: &Collection<V>) {
        let collection_key = self.base.key().to_string();

        let keys: Vec<ItemKey> = self
            .base
            .load_value(&group_storage_key(&collection_key, DEFAULT_GROUP_KEY))
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or_default();

        for item_key in &keys {
            let Some(json) = self
                .base
                .load_value(&item_storage_key(&collection_key, item_key))
            else {
                tracing::warn!(key = %item_key, "persisted item entry is missing");
                continue;
            };
            match serde_json::from_value::<V>(json) {
                Ok(value) => {
                    collection.collect_inner(
                        vec![value],
                        &[],
                        AddMethod::Push,
                        JobConfig::from_storage(),
                    );
                }
                Err(err) => {
                    tracing::warn!(key = %item_key, %err, "persisted item no longer deserializes");
                }
            }
        }

        // Restore the stored ordering, missing entries included (they show
        // up as not-found keys).
        collection.default_group().set_from_storage(keys);
    }

    /// Write the flag, persist the default group's key list, and persist
    /// every item.
    fn persist_values(&self, collection: &Collection<V>) {
        self.base
            .save_value(self.base.key(), &serde_json::Value::Bool(true));

        collection
            .default_group()
            .state()
            .persist_with_config(PersistConfig {
                key: Some(group_storage_key(self.base.key(), DEFAULT_GROUP_KEY)),
                storage_keys: self.base.storage_keys.clone(),
            });

        for item in collection.get_all_items() {
            self.persist_item(&item);
        }
    }

    /// Persist one item under its derived key. Called for every newly
    /// collected item while the collection is persisted.
    pub(crate) fn persist_item(&self, item: &Item<V>) {
        if !self.base.ready() {
            return;
        }
        item.state().persist_with_config(PersistConfig {
            key: Some(item_storage_key(self.base.key(), &item.key())),
            storage_keys: self.base.storage_keys.clone(),
        });
    }

    /// Remove one item's persisted entry and detach its mirror.
    pub(crate) fn remove_item(&self, item_key: &ItemKey, item: Option<&Item<V>>) {
        if !self.base.ready() {
            return;
        }
        self.base
            .remove_value(&item_storage_key(self.base.key(), item_key));
        if let Some(item) = item {
            item.state().remove_side_effect(SIDE_EFFECT_STORAGE);
            item.state().core().set_persistent(None);
        }
    }

    /// Migrate an item's persisted entry after a rename.
    pub(crate) fn rename_item(&self, old_key: &ItemKey, item: &Item<V>) {
        if !self.base.ready() {
            return;
        }
        self.remove_item(old_key, Some(item));
        self.persist_item(item);
    }

    /// Remove the flag key, the default group's entry, and every item
    /// entry.
    pub(crate) fn remove_persisted_value(&self, collection: &Collection<V>) {
        if !self.base.ready() {
            return;
        }

        self.base.remove_value(self.base.key());
        self.base
            .remove_value(&group_storage_key(self.base.key(), DEFAULT_GROUP_KEY));

        let group = collection.default_group();
        group.state().remove_side_effect(SIDE_EFFECT_STORAGE);
        group.state().core().set_persistent(None);

        for item in collection.get_all_items() {
            self.remove_item(&item.key(), Some(&item));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Pulse, PulseConfig};
    use crate::reactive::state::StateConfig;
    use crate::storage::backend::{MemoryStorage, Storage, StorageBackend};

    fn pulse_with_memory() -> (Pulse, Arc<MemoryStorage>) {
        let pulse = Pulse::new(PulseConfig::default());
        let backend = MemoryStorage::new();
        pulse.register_storage(Storage::new("memory", backend.clone()), false);
        (pulse, backend)
    }

    #[test]
    fn storage_key_patterns_are_stable() {
        assert_eq!(
            item_storage_key("users", &ItemKey::from(1u64)),
            "_users_item_1"
        );
        assert_eq!(
            group_storage_key("users", DEFAULT_GROUP_KEY),
            "_users_group_default"
        );
    }

    #[test]
    fn state_persist_round_trip() {
        let (pulse, backend) = pulse_with_memory();

        let state = State::new_with_config(&pulse, 0, StateConfig::keyed("counter"));
        state.persist();
        state.set(42);

        assert_eq!(backend.get("counter").unwrap(), Some(serde_json::json!(42)));

        // A fresh state under the same key loads the stored value.
        let restored = State::new_with_config(&pulse, 0, StateConfig::keyed("counter"));
        restored.persist();
        assert_eq!(restored.get(), 42);
    }

    #[test]
    fn loaded_value_is_not_mirrored_back() {
        let (pulse, backend) = pulse_with_memory();
        backend.set("flagged", &serde_json::json!(7)).unwrap();

        let state = State::new_with_config(&pulse, 0, StateConfig::keyed("flagged"));
        state.persist();

        assert_eq!(state.get(), 7);
        // Still exactly what the backend held, written once by the seed.
        assert_eq!(backend.get("flagged").unwrap(), Some(serde_json::json!(7)));
    }

    #[test]
    fn missing_key_leaves_persistent_not_ready() {
        let (pulse, backend) = pulse_with_memory();

        let state = State::new(&pulse, 5);
        state.persist();

        state.set(6);
        assert!(backend.is_empty());
    }

    #[test]
    fn missing_backend_leaves_persistent_not_ready() {
        let pulse = Pulse::new(PulseConfig::default());

        let state = State::new_with_config(&pulse, 5, StateConfig::keyed("orphan"));
        state.persist();
        // No storage registered; set must not panic and nothing persists.
        state.set(6);
        assert_eq!(state.get(), 6);
    }
}
