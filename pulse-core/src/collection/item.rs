//! Items
//!
//! An item is the state wrapper around one record of a collection. Its key
//! is taken from the collection's configured primary-key field. An item may
//! exist as a *placeholder*: referenced by a group or selector before any
//! real backing data was collected. Placeholders hold no value and are
//! skipped by group outputs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::collection::{CollectionCore, SIDE_EFFECT_REBUILD_GROUPS};
use crate::reactive::job::JobConfig;
use crate::reactive::observer::Observer;
use crate::reactive::state::{State, StateConfig, StateValue};

/// Key of one record within a collection.
///
/// Extracted from the record's primary-key field; numeric keys are
/// normalized to their decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract a key from a JSON primary-key field value. Strings and
    /// integers qualify; everything else does not.
    pub(crate) fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self(s.clone())),
            serde_json::Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(Self(n.to_string()))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<u64> for ItemKey {
    fn from(key: u64) -> Self {
        Self(key.to_string())
    }
}

impl From<i64> for ItemKey {
    fn from(key: i64) -> Self {
        Self(key.to_string())
    }
}

pub(crate) struct ItemShared<V: StateValue> {
    state: State<Option<V>>,
    key: RwLock<ItemKey>,
    placeholder: AtomicBool,
}

/// One record of a collection, reactively wrapped.
pub struct Item<V: StateValue> {
    shared: Arc<ItemShared<V>>,
}

impl<V: StateValue> Item<V> {
    /// Create an item owned by `collection`. A `None` value creates a
    /// placeholder.
    pub(crate) fn new(
        collection: &Arc<CollectionCore<V>>,
        key: ItemKey,
        value: Option<V>,
    ) -> Self {
        let placeholder = value.is_none();
        let state = State::new_with_config(
            collection.pulse(),
            value,
            StateConfig::keyed(key.as_str()),
        );

        let shared = Arc::new(ItemShared {
            state,
            key: RwLock::new(key),
            placeholder: AtomicBool::new(placeholder),
        });

        // Every commit of the item re-derives the outputs of the groups
        // that reference its key.
        let collection_weak = Arc::downgrade(collection);
        let shared_weak = Arc::downgrade(&shared);
        shared.state.add_side_effect(SIDE_EFFECT_REBUILD_GROUPS, 0, move |config| {
            let (Some(collection), Some(shared)) =
                (collection_weak.upgrade(), shared_weak.upgrade())
            else {
                return;
            };
            let key = shared.key.read().clone();
            collection.rebuild_groups_containing(&key, config);
        });

        Self { shared }
    }

    /// The item's key within its collection.
    pub fn key(&self) -> ItemKey {
        self.shared.key.read().clone()
    }

    pub(crate) fn set_key(&self, key: ItemKey) {
        self.shared.state.set_key(key.as_str());
        *self.shared.key.write() = key;
    }

    /// The record value; `None` for placeholders.
    pub fn value(&self) -> Option<V> {
        self.shared.state.get_untracked()
    }

    /// Whether this item holds real collected data.
    pub fn exists(&self) -> bool {
        !self.is_placeholder() && self.value().is_some()
    }

    /// Whether this item is a placeholder without backing data.
    pub fn is_placeholder(&self) -> bool {
        self.shared.placeholder.load(Ordering::SeqCst)
    }

    /// Replace the record value.
    pub fn set(&self, value: V) -> &Self {
        self.set_with_config(value, JobConfig::default())
    }

    /// Replace the record value with an explicit job config. Clears the
    /// placeholder flag.
    pub fn set_with_config(&self, value: V, config: JobConfig) -> &Self {
        self.shared.placeholder.store(false, Ordering::SeqCst);
        self.shared.state.set_with_config(Some(value), config);
        self
    }

    /// Merge a partial JSON object into the record.
    ///
    /// On a placeholder, the changes must form a complete record; partial
    /// changes on a placeholder are rejected with a warning.
    pub(crate) fn apply_changes(
        &self,
        changes: &serde_json::Value,
        add_new_properties: bool,
        config: JobConfig,
    ) {
        if self.is_placeholder() {
            match serde_json::from_value::<V>(changes.clone()) {
                Ok(value) => {
                    self.set_with_config(value, config);
                }
                Err(err) => {
                    tracing::warn!(
                        key = %self.key(),
                        %err,
                        "partial update cannot materialize a placeholder item"
                    );
                }
            }
            return;
        }

        match self.shared.state.core().merged_value(changes, add_new_properties) {
            Ok(value) => {
                self.shared.state.core().push_history();
                self.shared.state.core().ingest_value(value, config);
            }
            Err(err) => {
                tracing::error!(key = %self.key(), %err, "item update rejected");
            }
        }
    }

    /// The underlying reactive state, for watching and subscription wiring.
    pub fn state(&self) -> &State<Option<V>> {
        &self.shared.state
    }

    /// The observer handle of this item.
    pub fn observer(&self) -> Arc<dyn Observer> {
        self.shared.state.observer()
    }
}

impl<V: StateValue> Clone for Item<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for Item<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key())
            .field("value", &self.value())
            .field("is_placeholder", &self.is_placeholder())
            .finish()
    }
}
