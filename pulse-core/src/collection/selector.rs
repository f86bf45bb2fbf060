//! Selectors
//!
//! A selector tracks exactly one item key of a collection and mirrors that
//! item's value. Selecting a key with no item creates a placeholder item,
//! so the selector always has something to observe; its value is `None`
//! until real data arrives.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::collection::CollectionCore;
use super::item::ItemKey;
use crate::reactive::job::JobConfig;
use crate::reactive::observer::Observer;
use crate::reactive::state::{State, StateConfig, StateValue};

/// Configuration for [`Selector::select_with_config`].
#[derive(Debug, Clone, Default)]
pub struct SelectConfig {
    /// Re-select even when the key is already selected.
    pub force: bool,

    /// Commit without notifying subscribers.
    pub background: bool,
}

pub(crate) struct SelectorShared<V: StateValue> {
    state: State<Option<V>>,
    collection: Weak<CollectionCore<V>>,
    selector_key: String,
    item_key: RwLock<Option<ItemKey>>,
}

impl<V: StateValue> SelectorShared<V> {
    /// Name of the item side effect that keeps this selector in sync.
    fn effect_key(&self) -> String {
        format!("rebuildSelector-{}", self.selector_key)
    }
}

/// A reactive pointer at one item of a collection.
pub struct Selector<V: StateValue> {
    shared: Arc<SelectorShared<V>>,
}

impl<V: StateValue> Selector<V> {
    pub(crate) fn new(
        collection: &Arc<CollectionCore<V>>,
        selector_key: &str,
        item_key: Option<ItemKey>,
    ) -> Self {
        let state = State::new_with_config(
            collection.pulse(),
            None,
            StateConfig::keyed(selector_key),
        );

        let selector = Self {
            shared: Arc::new(SelectorShared {
                state,
                collection: Arc::downgrade(collection),
                selector_key: selector_key.to_string(),
                item_key: RwLock::new(None),
            }),
        };

        if let Some(key) = item_key {
            selector.select_with_config(key, SelectConfig::default());
        }
        selector
    }

    /// The selector's own key within its collection.
    pub fn key(&self) -> &str {
        &self.shared.selector_key
    }

    /// The currently selected item key, if any.
    pub fn item_key(&self) -> Option<ItemKey> {
        self.shared.item_key.read().clone()
    }

    /// The mirrored item value; `None` while the item is a placeholder or
    /// nothing is selected.
    pub fn get(&self) -> Option<V> {
        self.shared.state.get()
    }

    /// The mirrored value without establishing a reactive dependency.
    pub fn get_untracked(&self) -> Option<V> {
        self.shared.state.get_untracked()
    }

    /// Point the selector at `key`.
    ///
    /// Detaches from the previously selected item, resolves (or
    /// placeholder-creates) the item at `key`, and re-derives the mirrored
    /// value immediately.
    pub fn select(&self, key: impl Into<ItemKey>) -> &Self {
        self.select_with_config(key.into(), SelectConfig::default())
    }

    /// Select with an explicit config.
    pub fn select_with_config(&self, key: impl Into<ItemKey>, config: SelectConfig) -> &Self {
        let key = key.into();
        let Some(collection) = self.shared.collection.upgrade() else {
            return self;
        };

        let old_key = self.shared.item_key.read().clone();
        if old_key.as_ref() == Some(&key) && !config.force {
            tracing::debug!(selector = %self.shared.selector_key, key = %key, "key already selected");
            return self;
        }

        self.detach_from_item(&collection, old_key.as_ref());
        *self.shared.item_key.write() = Some(key.clone());

        let item = collection.item_with_reference(&key);

        // Keep the mirrored value in sync with every commit of the item.
        // Weight 1 places the sync after the item's group rebuild.
        let shared_weak = Arc::downgrade(&self.shared);
        item.state().add_side_effect(&self.shared.effect_key(), 1, move |item_config| {
            let Some(shared) = shared_weak.upgrade() else {
                return;
            };
            let Some(collection) = shared.collection.upgrade() else {
                return;
            };
            let Some(key) = shared.item_key.read().clone() else {
                return;
            };
            shared
                .state
                .core()
                .ingest_value(collection.item_value(&key), item_config.clone());
        });

        let mut job = JobConfig::default();
        job.background = config.background;
        job.force = config.force;
        self.shared.state.core().ingest_value(item.value(), job);
        self
    }

    /// Detach from the selected item. The mirrored value becomes `None`; a
    /// placeholder item left behind by this selector is discarded.
    pub fn unselect(&self) -> &Self {
        let Some(collection) = self.shared.collection.upgrade() else {
            return self;
        };

        let old_key = self.shared.item_key.write().take();
        self.detach_from_item(&collection, old_key.as_ref());

        if let Some(key) = old_key {
            collection.drop_placeholder_item(&key);
        }

        self.shared
            .state
            .core()
            .ingest_value(None, JobConfig::default());
        self
    }

    fn detach_from_item(&self, collection: &Arc<CollectionCore<V>>, key: Option<&ItemKey>) {
        let Some(key) = key else {
            return;
        };
        if let Some(item) = collection.item_ref(key) {
            item.state().remove_side_effect(&self.shared.effect_key());
        }
    }

    /// The underlying mirrored state, for watching and subscription wiring.
    pub fn state(&self) -> &State<Option<V>> {
        &self.shared.state
    }

    /// The observer handle of this selector.
    pub fn observer(&self) -> Arc<dyn Observer> {
        self.shared.state.observer()
    }
}

impl<V: StateValue> Clone for Selector<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for Selector<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("key", &self.shared.selector_key)
            .field("item_key", &self.item_key())
            .field("value", &self.get_untracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::collection::{Collection, CollectionConfig};
    use crate::core::Pulse;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn user(id: u64, name: &str) -> User {
        User {
            id,
            name: name.to_string(),
        }
    }

    fn users() -> Collection<User> {
        let pulse = Pulse::default();
        let users: Collection<User> = Collection::new(&pulse, CollectionConfig::keyed("users"));
        users.collect_many(vec![user(1, "a"), user(2, "b")]);
        users
    }

    #[test]
    fn selector_mirrors_selected_item() {
        let users = users();
        let selector = users.create_selector("current", 1u64);

        assert_eq!(selector.get(), Some(user(1, "a")));

        users.update(1u64, serde_json::json!({ "name": "a2" }));
        assert_eq!(selector.get(), Some(user(1, "a2")));
    }

    #[test]
    fn selecting_missing_key_creates_placeholder() {
        let users = users();
        let selector = users.create_selector("current", 9u64);

        assert_eq!(selector.get(), None);

        let placeholder = users.get_item_with_reference(9u64);
        assert!(placeholder.is_placeholder());

        // Real data arriving through the placeholder flips the selector.
        users.collect(user(9, "i"));
        assert_eq!(selector.get(), Some(user(9, "i")));
    }

    #[test]
    fn select_detaches_from_previous_item() {
        let users = users();
        let selector = users.create_selector("current", 1u64);
        let effect_key = format!("rebuildSelector-{}", selector.key());

        let first = users.get_item(1u64).unwrap();
        assert!(first.state().has_side_effect(&effect_key));

        selector.select(2u64);
        assert!(!first.state().has_side_effect(&effect_key));
        assert_eq!(selector.get(), Some(user(2, "b")));

        // The abandoned item no longer drives the selector.
        users.update(1u64, serde_json::json!({ "name": "a2" }));
        assert_eq!(selector.get(), Some(user(2, "b")));
    }

    #[test]
    fn reselecting_same_key_is_noop() {
        let users = users();
        let selector = users.create_selector("current", 1u64);

        selector.select(1u64);
        assert_eq!(selector.item_key(), Some(ItemKey::from(1u64)));
        assert_eq!(selector.get(), Some(user(1, "a")));
    }

    #[test]
    fn unselect_clears_value_and_placeholder() {
        let users = users();
        let selector = users.create_selector("current", 9u64);
        assert!(users.get_item_with_reference(9u64).is_placeholder());

        selector.unselect();

        assert_eq!(selector.item_key(), None);
        assert_eq!(selector.get(), None);
        // The placeholder this selector created is gone.
        assert!(users.get_item(9u64).is_none());
    }
}
