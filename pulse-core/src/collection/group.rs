//! Groups
//!
//! A group is an ordered sequence of item keys plus a cached output: the
//! materialized values of the referenced items, in sequence order, with
//! unresolvable keys collected into a not-found set and skipped.
//!
//! # Rebuild Modes
//!
//! - **Hard rebuild**: walk the full key sequence and resolve every key
//!   against the collection's data. O(n); used on construction and as the
//!   fallback.
//!
//! - **Soft rebuild**: `add`/`remove` record structural [`Delta`]s; the
//!   rebuild replays only those deltas against the cached output instead of
//!   re-scanning the sequence. Amortized O(Δ). The replay reconstructs the
//!   key sequence from the previous committed value and verifies it against
//!   the committed one; any inconsistency falls back to a hard rebuild, so
//!   soft output always equals what a hard rebuild would produce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use super::collection::CollectionCore;
use super::item::ItemKey;
use crate::reactive::job::JobConfig;
use crate::reactive::observer::Observer;
use crate::reactive::state::{State, StateConfig, StateValue};

/// Name of the side effect that re-derives the group output after every
/// commit of the group's key sequence.
pub(crate) const SIDE_EFFECT_REBUILD_OUTPUT: &str = "rebuildGroupOutput";

/// A structural change to a group's key sequence, recorded by `add` and
/// `remove` and replayed by the soft rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// `key` was inserted at `index` of the key sequence.
    Add { index: usize, key: ItemKey },

    /// `key` was removed from `index` of the key sequence.
    Remove { index: usize, key: ItemKey },

    /// The item behind `key` (still at `index`) changed its value.
    Update { index: usize, key: ItemKey },
}

/// Where `add` places new keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddMethod {
    /// Append to the end of the sequence.
    #[default]
    Push,

    /// Prepend to the front of the sequence.
    Unshift,
}

/// Configuration for [`Group::add`].
#[derive(Debug, Clone, Default)]
pub struct AddConfig {
    /// Placement of new keys.
    pub method: AddMethod,

    /// Re-place a key that is already in the sequence instead of skipping
    /// it.
    pub overwrite: bool,

    /// Commit without notifying subscribers.
    pub background: bool,
}

pub(crate) struct GroupShared<V: StateValue> {
    state: State<Vec<ItemKey>>,
    collection: Weak<CollectionCore<V>>,
    key: String,
    placeholder: AtomicBool,

    output: RwLock<Vec<V>>,
    /// Keys backing `output`, index-aligned with it.
    output_keys: RwLock<Vec<ItemKey>>,
    not_found: RwLock<IndexSet<ItemKey>>,

    /// Deltas recorded since the last rebuild, drained on rebuild.
    tracked: Mutex<Vec<Delta>>,
}

/// An ordered, reactively-maintained view over a subset of a collection.
pub struct Group<V: StateValue> {
    shared: Arc<GroupShared<V>>,
}

impl<V: StateValue> Group<V> {
    pub(crate) fn new(
        collection: &Arc<CollectionCore<V>>,
        key: &str,
        initial: Vec<ItemKey>,
        placeholder: bool,
    ) -> Self {
        let state = State::new_with_config(
            collection.pulse(),
            initial,
            StateConfig::keyed(key),
        );

        let shared = Arc::new(GroupShared {
            state,
            collection: Arc::downgrade(collection),
            key: key.to_string(),
            placeholder: AtomicBool::new(placeholder),
            output: RwLock::new(Vec::new()),
            output_keys: RwLock::new(Vec::new()),
            not_found: RwLock::new(IndexSet::new()),
            tracked: Mutex::new(Vec::new()),
        });

        let shared_weak = Arc::downgrade(&shared);
        shared
            .state
            .add_side_effect(SIDE_EFFECT_REBUILD_OUTPUT, 0, move |_config| {
                if let Some(shared) = shared_weak.upgrade() {
                    shared.rebuild();
                }
            });

        shared.rebuild();
        Self { shared }
    }

    /// The group's key within its collection.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// The ordered key sequence.
    pub fn value(&self) -> Vec<ItemKey> {
        self.shared.state.get_untracked()
    }

    /// The materialized output: referenced item values in sequence order,
    /// not-found keys skipped.
    pub fn output(&self) -> Vec<V> {
        self.shared.output.read().clone()
    }

    /// Keys of the sequence that currently resolve to no item.
    pub fn not_found_item_keys(&self) -> Vec<ItemKey> {
        self.shared.not_found.read().iter().cloned().collect()
    }

    /// Length of the key sequence.
    pub fn size(&self) -> usize {
        self.shared.state.get_untracked().len()
    }

    /// Whether `key` is part of the sequence.
    pub fn has(&self, key: &ItemKey) -> bool {
        self.shared.state.get_untracked().contains(key)
    }

    /// Append (or prepend) keys to the sequence.
    pub fn add(&self, keys: impl IntoIterator<Item = ItemKey>, config: AddConfig) -> &Self {
        let mut next = self.shared.state.get_untracked();
        let mut deltas = Vec::new();

        for key in keys {
            if let Some(position) = next.iter().position(|k| *k == key) {
                if !config.overwrite {
                    tracing::debug!(group = %self.shared.key, key = %key, "key already in group");
                    continue;
                }
                next.remove(position);
                deltas.push(Delta::Remove {
                    index: position,
                    key: key.clone(),
                });
            }

            match config.method {
                AddMethod::Push => {
                    next.push(key.clone());
                    deltas.push(Delta::Add {
                        index: next.len() - 1,
                        key,
                    });
                }
                AddMethod::Unshift => {
                    next.insert(0, key.clone());
                    deltas.push(Delta::Add { index: 0, key });
                }
            }
        }

        if deltas.is_empty() {
            return self;
        }

        self.shared.tracked.lock().extend(deltas);
        let job = if config.background {
            JobConfig::background()
        } else {
            JobConfig::default()
        };
        self.shared.state.set_with_config(next, job);
        self
    }

    /// Remove keys from the sequence. Keys not in the sequence are reported
    /// as a warning and skipped.
    pub fn remove(&self, keys: impl IntoIterator<Item = ItemKey>) -> &Self {
        self.remove_with_config(keys, JobConfig::default())
    }

    pub(crate) fn remove_with_config(
        &self,
        keys: impl IntoIterator<Item = ItemKey>,
        config: JobConfig,
    ) -> &Self {
        let mut next = self.shared.state.get_untracked();
        let mut deltas = Vec::new();

        for key in keys {
            let Some(position) = next.iter().position(|k| *k == key) else {
                tracing::warn!(group = %self.shared.key, key = %key, "key not in group");
                continue;
            };
            next.remove(position);
            deltas.push(Delta::Remove {
                index: position,
                key,
            });
        }

        if deltas.is_empty() {
            return self;
        }

        self.shared.tracked.lock().extend(deltas);
        self.shared.state.set_with_config(next, config);
        self
    }

    /// Record that the item behind `key` changed and re-derive the output.
    /// The key sequence is unchanged, so the commit is forced through the
    /// equality short-circuit.
    pub(crate) fn ingest_update(&self, key: &ItemKey, config: &JobConfig) {
        let value = self.shared.state.get_untracked();
        let Some(index) = value.iter().position(|k| k == key) else {
            return;
        };

        self.shared.tracked.lock().push(Delta::Update {
            index,
            key: key.clone(),
        });

        let mut job = config.clone();
        job.force = true;
        self.shared.state.core().ingest_value(value, job);
    }

    /// Replace `old` with `new` at the same sequence position (item rename).
    pub(crate) fn replace_key(&self, old: &ItemKey, new: &ItemKey, config: JobConfig) {
        let mut next = self.shared.state.get_untracked();
        let Some(position) = next.iter().position(|k| k == old) else {
            return;
        };

        next[position] = new.clone();
        self.shared.tracked.lock().extend([
            Delta::Remove {
                index: position,
                key: old.clone(),
            },
            Delta::Add {
                index: position,
                key: new.clone(),
            },
        ]);
        self.shared.state.set_with_config(next, config);
    }

    /// Overwrite the key sequence with a list loaded from storage.
    pub(crate) fn set_from_storage(&self, keys: Vec<ItemKey>) {
        self.shared.state.set_with_config(keys, JobConfig::from_storage());
    }

    pub(crate) fn is_placeholder(&self) -> bool {
        self.shared.placeholder.load(Ordering::SeqCst)
    }

    pub(crate) fn materialize(&self, initial: Vec<ItemKey>) {
        self.shared.placeholder.store(false, Ordering::SeqCst);
        if !initial.is_empty() {
            self.add(initial, AddConfig::default());
        }
    }

    /// Force a full hard rebuild of the output.
    pub fn rebuild(&self) -> &Self {
        self.shared.tracked.lock().clear();
        self.shared.rebuild();
        self
    }

    /// The group's key-sequence state, for watching and persistence.
    pub fn state(&self) -> &State<Vec<ItemKey>> {
        &self.shared.state
    }

    /// The observer handle of this group.
    pub fn observer(&self) -> Arc<dyn Observer> {
        self.shared.state.observer()
    }
}

impl<V: StateValue> GroupShared<V> {
    /// Drain recorded deltas and re-derive the output: soft replay when
    /// deltas exist, hard scan otherwise or on any inconsistency.
    fn rebuild(&self) {
        let deltas = std::mem::take(&mut *self.tracked.lock());
        let Some(collection) = self.collection.upgrade() else {
            return;
        };

        if deltas.is_empty() {
            self.hard_rebuild(&collection);
        } else if !self.soft_rebuild(&collection, &deltas) {
            tracing::warn!(
                group = %self.key,
                "soft rebuild inconsistency, falling back to hard rebuild"
            );
            self.hard_rebuild(&collection);
        }

        self.state
            .core()
            .node()
            .set_snapshot(serde_json::to_value(&*self.output.read()).ok());
    }

    fn hard_rebuild(&self, collection: &Arc<CollectionCore<V>>) {
        let value = self.state.get_untracked();
        let mut output = Vec::with_capacity(value.len());
        let mut output_keys = Vec::with_capacity(value.len());
        let mut not_found = IndexSet::new();

        for key in &value {
            match collection.item_value(key) {
                Some(item_value) => {
                    output.push(item_value);
                    output_keys.push(key.clone());
                }
                None => {
                    not_found.insert(key.clone());
                }
            }
        }

        if !not_found.is_empty() {
            tracing::warn!(
                group = %self.key,
                keys = ?not_found,
                "group references keys with no item"
            );
        }

        *self.output.write() = output;
        *self.output_keys.write() = output_keys;
        *self.not_found.write() = not_found;
    }

    /// Replay recorded deltas against the cached output. Returns `false`
    /// when the replay cannot be reconciled with the committed sequence.
    fn soft_rebuild(&self, collection: &Arc<CollectionCore<V>>, deltas: &[Delta]) -> bool {
        let committed = self.state.get_untracked();
        let mut seq = self.state.previous_value();
        let mut output = self.output.read().clone();
        let mut output_keys = self.output_keys.read().clone();
        let mut not_found = self.not_found.read().clone();

        for delta in deltas {
            match delta {
                Delta::Add { index, key } => {
                    if *index > seq.len() {
                        return false;
                    }
                    seq.insert(*index, key.clone());

                    match collection.item_value(key) {
                        Some(item_value) => {
                            let out_idx = found_before(&seq, *index, &not_found);
                            if out_idx > output.len() {
                                return false;
                            }
                            output.insert(out_idx, item_value);
                            output_keys.insert(out_idx, key.clone());
                        }
                        None => {
                            not_found.insert(key.clone());
                        }
                    }
                }
                Delta::Remove { index, key } => {
                    if seq.get(*index) != Some(key) {
                        return false;
                    }
                    seq.remove(*index);

                    if not_found.shift_remove(key) {
                        continue;
                    }
                    let Some(position) = output_keys.iter().position(|k| k == key) else {
                        return false;
                    };
                    output.remove(position);
                    output_keys.remove(position);
                }
                Delta::Update { index, key } => {
                    if seq.get(*index) != Some(key) {
                        return false;
                    }

                    match collection.item_value(key) {
                        Some(item_value) => {
                            if let Some(position) =
                                output_keys.iter().position(|k| k == key)
                            {
                                output[position] = item_value;
                            } else {
                                // Previously not-found key materialized.
                                not_found.shift_remove(key);
                                let out_idx = found_before(&seq, *index, &not_found);
                                output.insert(out_idx, item_value);
                                output_keys.insert(out_idx, key.clone());
                            }
                        }
                        None => {
                            if let Some(position) =
                                output_keys.iter().position(|k| k == key)
                            {
                                output.remove(position);
                                output_keys.remove(position);
                            }
                            not_found.insert(key.clone());
                        }
                    }
                }
            }
        }

        // The replayed sequence must land exactly on the committed one.
        if seq != committed {
            return false;
        }

        *self.output.write() = output;
        *self.output_keys.write() = output_keys;
        *self.not_found.write() = not_found;
        true
    }
}

/// Number of resolvable keys among the first `index` entries of `seq`.
fn found_before(seq: &[ItemKey], index: usize, not_found: &IndexSet<ItemKey>) -> usize {
    seq[..index].iter().filter(|k| !not_found.contains(*k)).count()
}

impl<V: StateValue> Clone for Group<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for Group<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("key", &self.shared.key)
            .field("value", &self.value())
            .field("not_found", &self.not_found_item_keys())
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
        users.collect_many(vec![user(1, "a"), user(2, "b"), user(3, "c")]);
        users
    }

    /// A hard rebuild over the same sequence must agree with the
    /// incrementally maintained output.
    fn assert_matches_hard_rebuild(collection: &Collection<User>, group: &Group<User>, tag: &str) {
        let mirror = collection.create_group(&format!("mirror-{}", tag), group.value());
        assert_eq!(group.output(), mirror.output(), "soft/hard divergence ({})", tag);
        assert_eq!(
            group.not_found_item_keys(),
            mirror.not_found_item_keys(),
            "not-found divergence ({})",
            tag
        );
        assert_eq!(
            group.output().len(),
            group.value().len() - group.not_found_item_keys().len(),
            "output length invariant ({})",
            tag
        );
    }

    #[test]
    fn hard_rebuild_skips_missing_keys() {
        let users = users();
        // Key 9 has no item.
        let group = users.create_group(
            "g",
            vec![ItemKey::from(1u64), ItemKey::from(9u64), ItemKey::from(3u64)],
        );

        assert_eq!(group.output(), vec![user(1, "a"), user(3, "c")]);
        assert_eq!(group.not_found_item_keys(), vec![ItemKey::from(9u64)]);
    }

    #[test]
    fn rebuild_skips_unresolvable_middle_key() {
        let pulse = Pulse::default();
        let users: Collection<User> = Collection::new(&pulse, CollectionConfig::keyed("users"));
        users.collect_many(vec![user(1, "a"), user(3, "c")]);

        let group = users.create_group(
            "g",
            vec![ItemKey::from(1u64), ItemKey::from(2u64), ItemKey::from(3u64)],
        );

        assert_eq!(group.output().len(), 2);
        assert_eq!(group.not_found_item_keys(), vec![ItemKey::from(2u64)]);
    }

    #[test]
    fn add_push_and_unshift() {
        let users = users();
        let group = users.create_group("g", vec![ItemKey::from(2u64)]);

        group.add([ItemKey::from(3u64)], AddConfig::default());
        group.add(
            [ItemKey::from(1u64)],
            AddConfig {
                method: AddMethod::Unshift,
                ..AddConfig::default()
            },
        );

        assert_eq!(
            group.value(),
            vec![ItemKey::from(1u64), ItemKey::from(2u64), ItemKey::from(3u64)]
        );
        assert_eq!(
            group.output(),
            vec![user(1, "a"), user(2, "b"), user(3, "c")]
        );
    }

    #[test]
    fn add_existing_key_is_skipped_without_overwrite() {
        let users = users();
        let group = users.create_group("g", vec![ItemKey::from(1u64), ItemKey::from(2u64)]);

        group.add([ItemKey::from(1u64)], AddConfig::default());
        assert_eq!(group.value(), vec![ItemKey::from(1u64), ItemKey::from(2u64)]);

        group.add(
            [ItemKey::from(1u64)],
            AddConfig {
                overwrite: true,
                ..AddConfig::default()
            },
        );
        // Overwrite re-places the key at the end.
        assert_eq!(group.value(), vec![ItemKey::from(2u64), ItemKey::from(1u64)]);
        assert_eq!(group.output(), vec![user(2, "b"), user(1, "a")]);
    }

    #[test]
    fn remove_updates_output() {
        let users = users();
        let group = users.create_group(
            "g",
            vec![ItemKey::from(1u64), ItemKey::from(2u64), ItemKey::from(3u64)],
        );

        group.remove([ItemKey::from(2u64)]);

        assert_eq!(group.value(), vec![ItemKey::from(1u64), ItemKey::from(3u64)]);
        assert_eq!(group.output(), vec![user(1, "a"), user(3, "c")]);
    }

    #[test]
    fn soft_rebuild_matches_hard_rebuild_over_mixed_sequence() {
        let users = users();
        // Start with a not-found key in the middle.
        let group = users.create_group(
            "g",
            vec![ItemKey::from(1u64), ItemKey::from(9u64), ItemKey::from(2u64)],
        );
        assert_matches_hard_rebuild(&users, &group, "initial");

        group.add([ItemKey::from(3u64)], AddConfig::default());
        assert_matches_hard_rebuild(&users, &group, "push");

        group.add(
            [ItemKey::from(8u64)],
            AddConfig {
                method: AddMethod::Unshift,
                ..AddConfig::default()
            },
        );
        assert_matches_hard_rebuild(&users, &group, "unshift-not-found");

        group.remove([ItemKey::from(1u64)]);
        assert_matches_hard_rebuild(&users, &group, "remove-found");

        group.remove([ItemKey::from(9u64)]);
        assert_matches_hard_rebuild(&users, &group, "remove-not-found");

        // A not-found key materializing flows through an update delta.
        users.collect(user(8, "h"));
        assert_matches_hard_rebuild(&users, &group, "materialize");

        // An item losing its data flows the other way.
        users.remove([ItemKey::from(2u64)]).everywhere();
        assert_matches_hard_rebuild(&users, &group, "item-removed");
    }

    #[test]
    fn item_update_refreshes_output_in_place() {
        let users = users();
        let group = users.create_group("g", vec![ItemKey::from(1u64), ItemKey::from(2u64)]);

        users.update(1u64, serde_json::json!({ "name": "a2" }));

        assert_eq!(group.output(), vec![user(1, "a2"), user(2, "b")]);
    }

    #[test]
    fn output_snapshot_mirrors_output() {
        let users = users();
        let group = users.create_group("g", vec![ItemKey::from(1u64)]);

        let snapshot = group.observer().node().snapshot();
        assert_eq!(
            snapshot,
            Some(serde_json::json!([{ "id": 1, "name": "a" }]))
        );
    }
}
