//! Collections
//!
//! A collection owns a keyed set of items plus the groups and selectors
//! built over it: one owning arena. Members never hold ownership pointers
//! at each other: groups and selectors reference items by key, resolved
//! through the collection's maps, and member-to-collection back-references
//! are non-owning weak handles.
//!
//! Every collection carries a `default` group holding every collected key
//! in insertion order.
//!
//! # Invariants
//!
//! - Every key referenced by a group or selector either resolves to an
//!   entry in `data` or is marked not-found / backed by a placeholder.
//! - Removing an item removes its key from every group that references it
//!   and placeholder-izes any selector pointed at it.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::group::{AddConfig, AddMethod, Group};
use super::item::{Item, ItemKey};
use super::selector::{SelectConfig, Selector};
use crate::core::Pulse;
use crate::error::ConfigError;
use crate::reactive::job::JobConfig;
use crate::storage::persistent::{CollectionPersistent, PersistConfig};
use crate::reactive::state::StateValue;

/// Key of the group holding every collected key in insertion order.
pub const DEFAULT_GROUP_KEY: &str = "default";

/// Name of the item side effect that re-derives the outputs of every group
/// referencing the item's key.
pub(crate) const SIDE_EFFECT_REBUILD_GROUPS: &str = "rebuildGroups";

/// Configuration for creating a collection.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Optional key identifying the collection (also the fallback
    /// persistence key).
    pub key: Option<String>,

    /// Name of the record field holding the item key.
    pub primary_key: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            key: None,
            primary_key: "id".to_string(),
        }
    }
}

impl CollectionConfig {
    /// Config with just a key.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Configuration for [`Collection::collect_with_config`].
#[derive(Debug, Clone, Default)]
pub struct CollectConfig {
    /// Placement of new keys within the target groups.
    pub method: AddMethod,

    /// Commit without notifying subscribers.
    pub background: bool,
}

/// Configuration for [`Collection::update_with_config`].
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Insert properties the current record does not have yet.
    pub add_new_properties: bool,

    /// Commit without notifying subscribers.
    pub background: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            add_new_properties: true,
            background: false,
        }
    }
}

pub(crate) struct CollectionCore<V: StateValue> {
    pulse: Pulse,
    key: RwLock<Option<String>>,
    primary_key: String,

    data: RwLock<IndexMap<ItemKey, Item<V>>>,
    groups: RwLock<IndexMap<String, Group<V>>>,
    selectors: RwLock<IndexMap<String, Selector<V>>>,

    persistent: RwLock<Option<Arc<CollectionPersistent<V>>>>,
}

impl<V: StateValue> CollectionCore<V> {
    pub(crate) fn pulse(&self) -> &Pulse {
        &self.pulse
    }

    pub(crate) fn key(&self) -> Option<String> {
        self.key.read().clone()
    }

    pub(crate) fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Resolve an item's record value; `None` for absent keys and
    /// placeholders.
    pub(crate) fn item_value(&self, key: &ItemKey) -> Option<V> {
        self.data.read().get(key).and_then(|item| item.value())
    }

    /// Resolve an item handle, placeholders included.
    pub(crate) fn item_ref(&self, key: &ItemKey) -> Option<Item<V>> {
        self.data.read().get(key).cloned()
    }

    /// Resolve an item handle, creating a placeholder when the key has no
    /// item yet.
    pub(crate) fn item_with_reference(self: &Arc<Self>, key: &ItemKey) -> Item<V> {
        if let Some(item) = self.item_ref(key) {
            return item;
        }
        let item = Item::new(self, key.clone(), None);
        self.data.write().insert(key.clone(), item.clone());
        item
    }

    /// Drop an item that is only a placeholder. Real items are untouched.
    pub(crate) fn drop_placeholder_item(&self, key: &ItemKey) {
        let mut data = self.data.write();
        if data.get(key).map(Item::is_placeholder).unwrap_or(false) {
            data.shift_remove(key);
        }
    }

    /// Re-derive the output of every group referencing `key`. Called from
    /// the item commit side effect.
    pub(crate) fn rebuild_groups_containing(&self, key: &ItemKey, config: &JobConfig) {
        let groups: Vec<Group<V>> = self
            .groups
            .read()
            .values()
            .filter(|group| group.has(key))
            .cloned()
            .collect();
        for group in groups {
            group.ingest_update(key, config);
        }
    }

    /// Extract the item key from a record's primary-key field.
    pub(crate) fn extract_key(&self, value: &V) -> Result<ItemKey, ConfigError> {
        serde_json::to_value(value)
            .ok()
            .as_ref()
            .and_then(|json| json.get(&self.primary_key))
            .and_then(ItemKey::from_json)
            .ok_or_else(|| ConfigError::MissingPrimaryKey(self.primary_key.clone()))
    }

    /// Rename an item, re-pointing every reference. Renaming onto an
    /// occupied key is rejected.
    fn update_item_key(&self, old: &ItemKey, new: &ItemKey, job: &JobConfig) -> bool {
        {
            let mut data = self.data.write();
            if data.contains_key(new) {
                tracing::error!(
                    err = %ConfigError::KeyCollision(new.to_string()),
                    "item rename rejected"
                );
                return false;
            }
            if !data.contains_key(old) {
                tracing::warn!(key = %old, "no item to rename");
                return false;
            }
            let rebuilt: IndexMap<ItemKey, Item<V>> = data
                .drain(..)
                .map(|(key, item)| {
                    if &key == old {
                        (new.clone(), item)
                    } else {
                        (key, item)
                    }
                })
                .collect();
            *data = rebuilt;
        }

        let item = self.item_ref(new);
        if let Some(item) = &item {
            item.set_key(new.clone());
        }

        let groups: Vec<Group<V>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.replace_key(old, new, job.clone());
        }

        let selectors: Vec<Selector<V>> = self.selectors.read().values().cloned().collect();
        for selector in selectors {
            if selector.item_key().as_ref() == Some(old) {
                selector.select_with_config(
                    new.clone(),
                    SelectConfig {
                        force: true,
                        background: job.background,
                    },
                );
            }
        }

        if let (Some(persistent), Some(item)) = (self.persistent.read().clone(), &item) {
            persistent.rename_item(old, item);
        }
        true
    }

    pub(crate) fn persistent(&self) -> Option<Arc<CollectionPersistent<V>>> {
        self.persistent.read().clone()
    }
}

/// An indexed, ordered, reactively-updated view over a set of keyed
/// records.
///
/// # Example
///
/// ```rust,ignore
/// let users: Collection<User> = pulse.collection(CollectionConfig::default());
///
/// users.collect(User { id: 1, name: "a".into() });
/// users.collect_into(User { id: 2, name: "b".into() }, &["admins"]);
///
/// assert_eq!(users.default_group().output().len(), 2);
/// ```
pub struct Collection<V: StateValue> {
    core: Arc<CollectionCore<V>>,
}

impl<V: StateValue> Collection<V> {
    /// Create a collection. The `default` group is created along with it.
    pub fn new(pulse: &Pulse, config: CollectionConfig) -> Self {
        let core = Arc::new(CollectionCore {
            pulse: pulse.clone(),
            key: RwLock::new(config.key),
            primary_key: config.primary_key,
            data: RwLock::new(IndexMap::new()),
            groups: RwLock::new(IndexMap::new()),
            selectors: RwLock::new(IndexMap::new()),
            persistent: RwLock::new(None),
        });

        let default_group = Group::new(&core, DEFAULT_GROUP_KEY, Vec::new(), false);
        core.groups
            .write()
            .insert(DEFAULT_GROUP_KEY.to_string(), default_group);

        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<CollectionCore<V>> {
        &self.core
    }

    /// The collection's key, if one was assigned.
    pub fn key(&self) -> Option<String> {
        self.core.key()
    }

    /// Assign or replace the collection's key.
    pub fn set_key(&self, key: impl Into<String>) -> &Self {
        *self.core.key.write() = Some(key.into());
        self
    }

    /// The configured primary-key field name.
    pub fn primary_key(&self) -> &str {
        self.core.primary_key()
    }

    // ------------------------------------------------------------------
    // Collecting
    // ------------------------------------------------------------------

    /// Collect one record into the default group.
    pub fn collect(&self, value: V) -> &Self {
        self.collect_with_config(vec![value], &[], CollectConfig::default())
    }

    /// Collect one record into the default group and the named groups.
    pub fn collect_into(&self, value: V, group_keys: &[&str]) -> &Self {
        self.collect_with_config(vec![value], group_keys, CollectConfig::default())
    }

    /// Collect several records into the default group.
    pub fn collect_many(&self, values: Vec<V>) -> &Self {
        self.collect_with_config(values, &[], CollectConfig::default())
    }

    /// Collect records with an explicit config.
    ///
    /// Records without a usable primary-key field are rejected with a
    /// logged configuration error and skipped.
    pub fn collect_with_config(
        &self,
        values: Vec<V>,
        group_keys: &[&str],
        config: CollectConfig,
    ) -> &Self {
        let job = if config.background {
            JobConfig::background()
        } else {
            JobConfig::default()
        };
        self.collect_inner(values, group_keys, config.method, job)
    }

    pub(crate) fn collect_inner(
        &self,
        values: Vec<V>,
        group_keys: &[&str],
        method: AddMethod,
        job: JobConfig,
    ) -> &Self {
        // Materialize target groups up front so every record lands in them.
        for group_key in group_keys {
            let existing = self.core.groups.read().get(*group_key).cloned();
            match existing {
                Some(group) if group.is_placeholder() => group.materialize(Vec::new()),
                Some(_) => {}
                None => {
                    let group = Group::new(&self.core, group_key, Vec::new(), false);
                    self.core
                        .groups
                        .write()
                        .insert(group_key.to_string(), group);
                }
            }
        }

        for value in values {
            let key = match self.core.extract_key(&value) {
                Ok(key) => key,
                Err(err) => {
                    tracing::error!(%err, "record rejected");
                    continue;
                }
            };

            let existing = self.core.item_ref(&key);
            let item = match existing {
                Some(item) => {
                    // Overwrite; also turns a placeholder into a real item.
                    item.set_with_config(value, job.clone());
                    item
                }
                None => {
                    let item = Item::new(&self.core, key.clone(), Some(value));
                    self.core.data.write().insert(key.clone(), item.clone());
                    // Groups may already reference this key as not-found.
                    self.core.rebuild_groups_containing(&key, &job);
                    item
                }
            };

            let add_config = AddConfig {
                method,
                overwrite: false,
                background: job.background,
            };
            let mut targets = vec![self.default_group()];
            for group_key in group_keys {
                if let Some(group) = self.core.groups.read().get(*group_key).cloned() {
                    targets.push(group);
                }
            }
            for group in targets {
                group.add([key.clone()], add_config.clone());
            }

            if let Some(persistent) = self.core.persistent() {
                persistent.persist_item(&item);
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // Updating
    // ------------------------------------------------------------------

    /// Merge a partial JSON object into the record at `key`.
    ///
    /// A different value at the primary-key field renames the item,
    /// re-pointing every group and selector reference; renaming onto an
    /// occupied key is rejected with a logged error.
    pub fn update(&self, key: impl Into<ItemKey>, changes: serde_json::Value) -> Option<Item<V>> {
        self.update_with_config(key, changes, UpdateConfig::default())
    }

    /// Update with an explicit config.
    pub fn update_with_config(
        &self,
        key: impl Into<ItemKey>,
        changes: serde_json::Value,
        config: UpdateConfig,
    ) -> Option<Item<V>> {
        let key = key.into();
        let Some(item) = self.core.item_ref(&key) else {
            tracing::warn!(key = %key, "no item to update");
            return None;
        };

        let job = if config.background {
            JobConfig::background()
        } else {
            JobConfig::default()
        };

        if let Some(new_key) = changes
            .get(self.core.primary_key())
            .and_then(ItemKey::from_json)
        {
            if new_key != key && !self.core.update_item_key(&key, &new_key, &job) {
                return None;
            }
        }

        item.apply_changes(&changes, config.add_new_properties, job);
        Some(item)
    }

    // ------------------------------------------------------------------
    // Removing
    // ------------------------------------------------------------------

    /// Start a removal of the given keys; finish with
    /// [`Remover::everywhere`] or [`Remover::from_groups`].
    pub fn remove<K: Into<ItemKey>>(&self, keys: impl IntoIterator<Item = K>) -> Remover<V> {
        Remover {
            core: Arc::clone(&self.core),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    fn remove_items(&self, keys: &[ItemKey]) {
        for key in keys {
            let item = self.core.data.write().shift_remove(key);
            let Some(item) = item else {
                tracing::warn!(key = %key, "no item to remove");
                continue;
            };

            let groups: Vec<Group<V>> = self
                .core
                .groups
                .read()
                .values()
                .filter(|group| group.has(key))
                .cloned()
                .collect();
            for group in groups {
                group.remove([key.clone()]);
            }

            // A selector pointed at the removed key keeps observing it
            // through a fresh placeholder.
            let selectors: Vec<Selector<V>> =
                self.core.selectors.read().values().cloned().collect();
            for selector in selectors {
                if selector.item_key().as_ref() == Some(key) {
                    selector.select_with_config(
                        key.clone(),
                        SelectConfig {
                            force: true,
                            background: false,
                        },
                    );
                }
            }

            if let Some(persistent) = self.core.persistent() {
                persistent.remove_item(key, Some(&item));
            }
        }
    }

    fn remove_from_groups(&self, keys: &[ItemKey], group_keys: &[&str]) {
        for group_key in group_keys {
            let Some(group) = self.core.groups.read().get(*group_key).cloned() else {
                tracing::warn!(group = %group_key, "no group to remove from");
                continue;
            };
            group.remove(keys.iter().cloned());
        }
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group over the given initial keys. Creating an existing
    /// group returns it unchanged (a placeholder group is materialized).
    pub fn create_group(&self, key: &str, initial: Vec<ItemKey>) -> Group<V> {
        let existing = self.core.groups.read().get(key).cloned();
        if let Some(group) = existing {
            if group.is_placeholder() {
                group.materialize(initial);
            } else {
                tracing::warn!(group = %key, "group already exists");
            }
            return group;
        }

        let group = Group::new(&self.core, key, initial, false);
        self.core
            .groups
            .write()
            .insert(key.to_string(), group.clone());
        group
    }

    /// Look up a group. Placeholder groups are not returned.
    pub fn get_group(&self, key: &str) -> Option<Group<V>> {
        self.core
            .groups
            .read()
            .get(key)
            .filter(|group| !group.is_placeholder())
            .cloned()
    }

    /// Look up a group, creating an empty placeholder when absent.
    pub fn get_group_with_reference(&self, key: &str) -> Group<V> {
        if let Some(group) = self.core.groups.read().get(key).cloned() {
            return group;
        }
        let group = Group::new(&self.core, key, Vec::new(), true);
        self.core
            .groups
            .write()
            .insert(key.to_string(), group.clone());
        group
    }

    /// The `default` group holding every collected key.
    pub fn default_group(&self) -> Group<V> {
        self.core
            .groups
            .read()
            .get(DEFAULT_GROUP_KEY)
            .cloned()
            .expect("collection always owns its default group")
    }

    /// Remove a group. The default group cannot be removed.
    pub fn remove_group(&self, key: &str) -> &Self {
        if key == DEFAULT_GROUP_KEY {
            tracing::error!("the default group cannot be removed");
            return self;
        }
        if self.core.groups.write().shift_remove(key).is_none() {
            tracing::warn!(group = %key, "no group to remove");
        }
        self
    }

    /// Number of groups, the default group included.
    pub fn group_count(&self) -> usize {
        self.core.groups.read().len()
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    /// Create a selector pointed at `item_key`. Creating an existing
    /// selector returns it unchanged.
    pub fn create_selector(
        &self,
        selector_key: &str,
        item_key: impl Into<ItemKey>,
    ) -> Selector<V> {
        if let Some(selector) = self.core.selectors.read().get(selector_key).cloned() {
            tracing::warn!(selector = %selector_key, "selector already exists");
            return selector;
        }

        let selector = Selector::new(&self.core, selector_key, Some(item_key.into()));
        self.core
            .selectors
            .write()
            .insert(selector_key.to_string(), selector.clone());
        selector
    }

    /// Look up a selector.
    pub fn get_selector(&self, key: &str) -> Option<Selector<V>> {
        self.core.selectors.read().get(key).cloned()
    }

    /// Remove a selector, detaching it from its item.
    pub fn remove_selector(&self, key: &str) -> &Self {
        let removed = self.core.selectors.write().shift_remove(key);
        match removed {
            Some(selector) => {
                selector.unselect();
            }
            None => tracing::warn!(selector = %key, "no selector to remove"),
        }
        self
    }

    /// Number of selectors.
    pub fn selector_count(&self) -> usize {
        self.core.selectors.read().len()
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Look up an item. Placeholders are not returned.
    pub fn get_item(&self, key: impl Into<ItemKey>) -> Option<Item<V>> {
        self.core
            .data
            .read()
            .get(&key.into())
            .filter(|item| !item.is_placeholder())
            .cloned()
    }

    /// Look up an item, creating a placeholder when absent.
    pub fn get_item_with_reference(&self, key: impl Into<ItemKey>) -> Item<V> {
        self.core.item_with_reference(&key.into())
    }

    /// The record value at `key`, if a real item exists.
    pub fn get_item_value(&self, key: impl Into<ItemKey>) -> Option<V> {
        self.core.item_value(&key.into())
    }

    /// Every real item, in insertion order.
    pub fn get_all_items(&self) -> Vec<Item<V>> {
        self.core
            .data
            .read()
            .values()
            .filter(|item| !item.is_placeholder())
            .cloned()
            .collect()
    }

    /// Every real record value, in insertion order.
    pub fn get_all_item_values(&self) -> Vec<V> {
        self.get_all_items()
            .iter()
            .filter_map(Item::value)
            .collect()
    }

    /// Number of real items.
    pub fn size(&self) -> usize {
        self.core
            .data
            .read()
            .values()
            .filter(|item| !item.is_placeholder())
            .count()
    }

    /// Clear all data. Groups empty out; selectors keep observing their
    /// key through fresh placeholders.
    pub fn reset(&self) -> &Self {
        self.core.data.write().clear();

        let groups: Vec<Group<V>> = self.core.groups.read().values().cloned().collect();
        for group in groups {
            group.state().set(Vec::new());
        }

        let selectors: Vec<Selector<V>> = self.core.selectors.read().values().cloned().collect();
        for selector in selectors {
            if let Some(key) = selector.item_key() {
                selector.select_with_config(
                    key,
                    SelectConfig {
                        force: true,
                        background: false,
                    },
                );
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Synchronize this collection with the configured storage backends
    /// under the collection's own key.
    pub fn persist(&self) -> &Self {
        self.persist_with_config(PersistConfig::default())
    }

    /// Persist with an explicit key and/or backend list.
    pub fn persist_with_config(&self, config: PersistConfig) -> &Self {
        if self.core.persistent().is_some() {
            tracing::debug!(key = ?self.key(), "collection is already persisted");
            return self;
        }
        if let Some(persistent) = CollectionPersistent::attach(self, config) {
            *self.core.persistent.write() = Some(persistent);
        }
        self
    }

    /// Whether the collection is currently persisted.
    pub fn is_persisted(&self) -> bool {
        self.core.persistent().is_some()
    }

    /// Remove every persisted entry of this collection: the flag key, the
    /// default group's key list and every item entry.
    pub fn remove_persisted_value(&self) -> &Self {
        let persistent = self.core.persistent.write().take();
        match persistent {
            Some(persistent) => persistent.remove_persisted_value(self),
            None => tracing::debug!(key = ?self.key(), "collection is not persisted"),
        }
        self
    }
}

impl<V: StateValue> Clone for Collection<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for Collection<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("key", &self.key())
            .field("size", &self.size())
            .field("group_count", &self.group_count())
            .finish()
    }
}

/// Fluent handle finishing a [`Collection::remove`] call.
pub struct Remover<V: StateValue> {
    core: Arc<CollectionCore<V>>,
    keys: Vec<ItemKey>,
}


impl<V: StateValue> Remover<V> {
    /// Delete the items from `data` and every group, placeholder-izing
    /// dangling selectors.
    pub fn everywhere(self) {
        let collection = Collection {
            core: Arc::clone(&self.core),
        };
        collection.remove_items(&self.keys);
    }

    /// Delete the keys from the named groups only, leaving `data`
    /// untouched.
    pub fn from_groups(self, group_keys: &[&str]) {
        let collection = Collection {
            core: Arc::clone(&self.core),
        };
        collection.remove_from_groups(&self.keys, group_keys);
    }
}
