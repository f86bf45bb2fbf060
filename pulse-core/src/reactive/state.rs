//! State Implementation
//!
//! A State is the fundamental reactive value container. It wraps a value
//! with its previous/next values, a bounded undo history, named watcher
//! callbacks, and named side effects that run on every successful commit.
//!
//! # How States Work
//!
//! 1. `set`/`patch` compute the next value, push the current value onto the
//!    undo history, and hand a job to the runtime.
//!
//! 2. The runtime commits the job: the observer's value is replaced unless
//!    the new value equals the current one (equality short-circuit), side
//!    effects run in ascending weight order, and subscribers are marked.
//!
//! 3. Reading a state inside a computed evaluation records the state as a
//!    dependency of that computed.
//!
//! # Thread Safety
//!
//! State handles are cheap clones of a shared core; the value and all
//! bookkeeping live behind locks. The scheduling model is cooperative and
//! single-threaded per flush; the runtime is the sole writer of committed
//! values.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::collections::VecDeque;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::context::TrackingContext;
use super::job::{Job, JobConfig};
use super::observer::{Observer, ObserverNode};
use crate::core::Pulse;
use crate::error::ConfigError;
use crate::storage::persistent::{PersistConfig, StatePersistent};

/// Bound on the undo history depth.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Blanket bound for values managed by the reactive core.
///
/// `PartialEq` powers the equality short-circuit, `Clone` the value
/// snapshots, and the serde bounds power observer snapshots, `patch`
/// merging, subscriber payloads and persistence.
pub trait StateValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StateValue for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Callback signature for registered side effects.
pub type SideEffectFn = dyn Fn(&JobConfig) + Send + Sync;

struct SideEffect {
    weight: i32,
    callback: Arc<SideEffectFn>,
}

/// Configuration for creating a state.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Optional key identifying the state (used for diagnostics and as the
    /// fallback persistence key).
    pub key: Option<String>,

    /// Undo history bound.
    pub history_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            key: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl StateConfig {
    /// Config with just a key.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }
}

fn next_watcher_key() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("watcher-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// The shared core behind every [`State`] handle.
pub(crate) struct StateCore<V: StateValue> {
    pulse: Pulse,
    node: ObserverNode,
    weak_self: Weak<StateCore<V>>,

    initial: RwLock<V>,
    value: RwLock<V>,
    previous: RwLock<V>,
    next: RwLock<V>,

    /// Whether the value differs from its initial value.
    is_set: AtomicBool,

    history: Mutex<VecDeque<V>>,
    history_capacity: usize,

    side_effects: RwLock<IndexMap<String, SideEffect>>,
    watchers: RwLock<IndexMap<String, Arc<dyn Fn(&V) + Send + Sync>>>,

    persistent: RwLock<Option<Arc<StatePersistent<V>>>>,
}

impl<V: StateValue> StateCore<V> {
    pub(crate) fn new(pulse: Pulse, initial: V, config: StateConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            pulse,
            node: ObserverNode::new(config.key),
            weak_self: weak_self.clone(),
            initial: RwLock::new(initial.clone()),
            value: RwLock::new(initial.clone()),
            previous: RwLock::new(initial.clone()),
            next: RwLock::new(initial),
            is_set: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            history_capacity: config.history_capacity,
            side_effects: RwLock::new(IndexMap::new()),
            watchers: RwLock::new(IndexMap::new()),
            persistent: RwLock::new(None),
        })
    }

    pub(crate) fn pulse(&self) -> &Pulse {
        &self.pulse
    }

    pub(crate) fn committed_value(&self) -> V {
        self.value.read().clone()
    }

    pub(crate) fn as_observer(&self) -> Option<Arc<dyn Observer>> {
        self.weak_self.upgrade().map(|core| core as Arc<dyn Observer>)
    }

    /// Stage `value` as the pending value and enqueue a job for it.
    pub(crate) fn ingest_value(&self, value: V, config: JobConfig) {
        *self.next.write() = value;
        self.ingest(config);
    }

    pub(crate) fn push_history(&self) {
        let current = self.value.read().clone();
        let mut history = self.history.lock();
        history.push_back(current);
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    pub(crate) fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Merge a partial JSON object into the current value.
    pub(crate) fn merged_value(
        &self,
        changes: &serde_json::Value,
        add_new_properties: bool,
    ) -> Result<V, ConfigError> {
        if !changes.is_object() {
            return Err(ConfigError::NotAnObject);
        }

        let current = self.value.read().clone();
        let mut base = serde_json::to_value(&current)
            .map_err(|err| ConfigError::InvalidPatch(err.to_string()))?;
        if !base.is_object() {
            return Err(ConfigError::NotAnObject);
        }

        deep_merge(&mut base, changes, add_new_properties);
        serde_json::from_value(base).map_err(|err| ConfigError::InvalidPatch(err.to_string()))
    }

    pub(crate) fn add_side_effect(
        &self,
        key: &str,
        weight: i32,
        callback: Arc<SideEffectFn>,
    ) {
        self.side_effects.write().insert(
            key.to_string(),
            SideEffect { weight, callback },
        );
    }

    pub(crate) fn remove_side_effect(&self, key: &str) {
        self.side_effects.write().shift_remove(key);
    }

    pub(crate) fn has_side_effect(&self, key: &str) -> bool {
        self.side_effects.read().contains_key(key)
    }

    pub(crate) fn persistent(&self) -> Option<Arc<StatePersistent<V>>> {
        self.persistent.read().clone()
    }

    pub(crate) fn set_persistent(&self, persistent: Option<Arc<StatePersistent<V>>>) {
        *self.persistent.write() = persistent;
    }

    /// Run registered side effects in ascending weight order; ties keep
    /// registration order. Callbacks are collected first so a side effect
    /// may add or remove side effects without deadlocking.
    fn run_side_effects(&self, job: &Job) {
        if !job.config().side_effects.enabled {
            return;
        }

        let mut callbacks: Vec<(i32, String, Arc<SideEffectFn>)> = self
            .side_effects
            .read()
            .iter()
            .map(|(name, effect)| (effect.weight, name.clone(), effect.callback.clone()))
            .collect();
        callbacks.sort_by_key(|(weight, ..)| *weight);

        for (_, name, callback) in callbacks {
            if job.config().side_effects.allows(&name) {
                callback(job.config());
            }
        }
    }

    fn run_watchers(&self, value: &V) {
        let watchers: Vec<Arc<dyn Fn(&V) + Send + Sync>> =
            self.watchers.read().values().cloned().collect();
        for watcher in watchers {
            watcher(value);
        }
    }
}

impl<V: StateValue> Observer for StateCore<V> {
    fn node(&self) -> &ObserverNode {
        &self.node
    }

    fn perform(&self, job: &Job) -> bool {
        let next = self.next.read().clone();
        {
            let current = self.value.read().clone();
            if !job.config().force && next == current {
                return false;
            }
            *self.previous.write() = current;
        }

        *self.value.write() = next.clone();
        self.is_set
            .store(next != *self.initial.read(), Ordering::SeqCst);
        self.node.set_snapshot(serde_json::to_value(&next).ok());

        self.run_side_effects(job);
        self.run_watchers(&next);
        true
    }

    fn ingest(&self, config: JobConfig) {
        let Some(observer) = self.as_observer() else {
            return;
        };
        self.pulse.runtime().ingest(Job::new(observer, config));
    }
}

/// A reactive value container.
///
/// # Example
///
/// ```rust,ignore
/// let pulse = Pulse::default();
/// let count = pulse.state(0);
///
/// count.set(5);
/// assert_eq!(count.get(), 5);
///
/// count.undo();
/// assert_eq!(count.get(), 0);
/// ```
pub struct State<V: StateValue> {
    core: Arc<StateCore<V>>,
}

impl<V: StateValue> State<V> {
    /// Create a new state with the given initial value.
    pub fn new(pulse: &Pulse, initial: V) -> Self {
        Self::new_with_config(pulse, initial, StateConfig::default())
    }

    /// Create a new state with an explicit config.
    pub fn new_with_config(pulse: &Pulse, initial: V, config: StateConfig) -> Self {
        Self {
            core: StateCore::new(pulse.clone(), initial, config),
        }
    }

    pub(crate) fn from_core(core: Arc<StateCore<V>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<StateCore<V>> {
        &self.core
    }

    /// The state's key, if one was assigned.
    pub fn key(&self) -> Option<String> {
        self.core.node.key()
    }

    /// Assign or replace the state's key.
    pub fn set_key(&self, key: impl Into<String>) -> &Self {
        self.core.node.set_key(Some(key.into()));
        self
    }

    /// The observer handle of this state, for subscription wiring.
    pub fn observer(&self) -> Arc<dyn Observer> {
        self.core.clone()
    }

    /// Get the current value.
    ///
    /// If called within a computed evaluation, the state is recorded as a
    /// dependency of that computed.
    pub fn get(&self) -> V {
        if TrackingContext::is_active() {
            let weak = Arc::downgrade(&self.core) as Weak<dyn Observer>;
            TrackingContext::track(self.core.node.id(), weak);
        }
        self.core.value.read().clone()
    }

    /// Get the current value without establishing a reactive dependency.
    pub fn get_untracked(&self) -> V {
        self.core.value.read().clone()
    }

    /// The value before the last commit.
    pub fn previous_value(&self) -> V {
        self.core.previous.read().clone()
    }

    /// Whether the value differs from its initial value.
    pub fn is_set(&self) -> bool {
        self.core.is_set.load(Ordering::SeqCst)
    }

    /// Set a new value.
    pub fn set(&self, value: V) -> &Self {
        self.set_with_config(value, JobConfig::default())
    }

    /// Set a new value with an explicit job config.
    pub fn set_with_config(&self, value: V, config: JobConfig) -> &Self {
        self.core.push_history();
        self.core.ingest_value(value, config);
        self
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&V) -> V,
    {
        let next = f(&self.get_untracked());
        self.set(next)
    }

    /// Update with a function and an explicit job config.
    pub fn update_with_config<F>(&self, f: F, config: JobConfig) -> &Self
    where
        F: FnOnce(&V) -> V,
    {
        let next = f(&self.get_untracked());
        self.set_with_config(next, config)
    }

    /// Merge a partial JSON object into the current value.
    ///
    /// Defined only for object-valued states; anything else is rejected
    /// with a logged configuration error and the state is left unchanged.
    pub fn patch(&self, changes: serde_json::Value) -> &Self {
        self.patch_with_config(changes, JobConfig::default())
    }

    /// Patch with an explicit job config.
    pub fn patch_with_config(&self, changes: serde_json::Value, config: JobConfig) -> &Self {
        match self.core.merged_value(&changes, true) {
            Ok(value) => {
                self.core.push_history();
                self.core.ingest_value(value, config);
            }
            Err(err) => {
                tracing::error!(key = ?self.key(), %err, "patch rejected");
            }
        }
        self
    }

    /// Revert to the value before the last `set`/`patch`.
    ///
    /// Pops the last history entry and re-ingests it; with an empty history
    /// this is a no-op.
    pub fn undo(&self) -> &Self {
        let popped = self.core.history.lock().pop_back();
        if let Some(value) = popped {
            self.core.ingest_value(value, JobConfig::default());
        }
        self
    }

    /// Register a watcher invoked after every successful commit with the
    /// new value. Returns the generated watcher key.
    pub fn watch<F>(&self, callback: F) -> String
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let key = next_watcher_key();
        self.watch_with_key(&key, callback);
        key
    }

    /// Register a watcher under an explicit key.
    pub fn watch_with_key<F>(&self, key: &str, callback: F) -> &Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.core
            .watchers
            .write()
            .insert(key.to_string(), Arc::new(callback));
        self
    }

    /// Remove a watcher. No-op for unknown keys.
    pub fn unwatch(&self, key: &str) -> &Self {
        self.core.watchers.write().shift_remove(key);
        self
    }

    /// Register a named side effect run on every successful commit, ordered
    /// by ascending weight.
    pub fn add_side_effect<F>(&self, key: &str, weight: i32, callback: F) -> &Self
    where
        F: Fn(&JobConfig) + Send + Sync + 'static,
    {
        self.core.add_side_effect(key, weight, Arc::new(callback));
        self
    }

    /// Remove a named side effect. No-op for unknown keys.
    pub fn remove_side_effect(&self, key: &str) -> &Self {
        self.core.remove_side_effect(key);
        self
    }

    /// Whether a side effect is registered under `key`.
    pub fn has_side_effect(&self, key: &str) -> bool {
        self.core.has_side_effect(key)
    }

    /// Synchronize this state with the configured storage backends under
    /// the state's own key.
    pub fn persist(&self) -> &Self {
        self.persist_with_config(PersistConfig::default())
    }

    /// Persist with an explicit key and/or backend list.
    pub fn persist_with_config(&self, config: PersistConfig) -> &Self {
        if self.core.persistent().is_some() {
            tracing::debug!(key = ?self.key(), "state is already persisted");
            return self;
        }
        if let Some(persistent) = StatePersistent::attach(self, config) {
            self.core.set_persistent(Some(persistent));
        }
        self
    }
}

impl<V: StateValue> Clone for State<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for State<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("key", &self.key())
            .field("value", &self.get_untracked())
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// Recursively merge `source` into `target`. Nested objects merge;
/// arrays and scalars are replaced. New keys are inserted only when
/// `add_new_properties` is set.
pub(crate) fn deep_merge(
    target: &mut serde_json::Value,
    source: &serde_json::Value,
    add_new_properties: bool,
) {
    let (Some(target_map), Some(source_map)) = (target.as_object_mut(), source.as_object())
    else {
        return;
    };

    for (key, source_value) in source_map {
        match target_map.get_mut(key) {
            Some(target_value) => {
                if target_value.is_object() && source_value.is_object() {
                    deep_merge(target_value, source_value, add_new_properties);
                } else {
                    *target_value = source_value.clone();
                }
            }
            None if add_new_properties => {
                target_map.insert(key.clone(), source_value.clone());
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PulseConfig;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn pulse() -> Pulse {
        Pulse::new(PulseConfig::default())
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    #[test]
    fn state_get_and_set() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);

        assert_eq!(state.get(), 0);
        assert!(!state.is_set());

        state.set(42);
        assert_eq!(state.get(), 42);
        assert!(state.is_set());
        assert_eq!(state.previous_value(), 0);
    }

    #[test]
    fn state_update_with_function() {
        let pulse = pulse();
        let state = State::new(&pulse, 10);

        state.update(|v| v + 5);
        assert_eq!(state.get(), 15);
    }

    #[test]
    fn equal_value_skips_commit() {
        let pulse = pulse();
        let state = State::new(&pulse, 7);
        let commits = Arc::new(AtomicUsize::new(0));
        let commits_clone = commits.clone();

        state.watch_with_key("count", move |_| {
            commits_clone.fetch_add(1, Ordering::SeqCst);
        });

        state.set(7);
        assert_eq!(commits.load(Ordering::SeqCst), 0);

        state.set_with_config(7, JobConfig::forced());
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_set_undo_restores_previous_commit() {
        let pulse = pulse();
        let state = State::new(&pulse, 1);

        state.set(2);
        state.set(5);
        state.undo();

        assert_eq!(state.get(), 2);
        assert_eq!(state.previous_value(), 5);
    }

    #[test]
    fn undo_on_empty_history_is_noop() {
        let pulse = pulse();
        let state = State::new(&pulse, 3);

        state.undo();

        assert_eq!(state.get(), 3);
        assert_eq!(state.core().history_len(), 0);
        assert!(!state.is_set());
    }

    #[test]
    fn history_is_bounded() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);

        for i in 1..=25 {
            state.set(i);
        }

        assert_eq!(state.core().history_len(), DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn patch_merges_objects() {
        let pulse = pulse();
        let state = State::new(
            &pulse,
            Settings {
                theme: "light".to_string(),
                font_size: 12,
            },
        );

        state.patch(json!({ "theme": "dark" }));

        assert_eq!(
            state.get(),
            Settings {
                theme: "dark".to_string(),
                font_size: 12,
            }
        );
    }

    #[test]
    fn patch_on_non_object_is_rejected() {
        let pulse = pulse();
        let state = State::new(&pulse, 5);

        state.patch(json!({ "anything": 1 }));

        // Value unchanged, no history entry.
        assert_eq!(state.get(), 5);
        assert_eq!(state.core().history_len(), 0);
    }

    #[test]
    fn watchers_run_after_commit() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let key = state.watch(move |value| {
            seen_clone.lock().push(*value);
        });

        state.set(1);
        state.set(2);
        state.unwatch(&key);
        state.set(3);

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn side_effects_run_in_weight_order() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        state.add_side_effect("heavy", 10, move |_| order_a.lock().push("heavy"));
        let order_b = order.clone();
        state.add_side_effect("light", 1, move |_| order_b.lock().push("light"));
        let order_c = order.clone();
        state.add_side_effect("light-too", 1, move |_| order_c.lock().push("light-too"));

        state.set(1);

        // Ascending weight; equal weights keep registration order.
        assert_eq!(*order.lock(), vec!["light", "light-too", "heavy"]);
    }

    #[test]
    fn excluded_side_effects_are_skipped() {
        let pulse = pulse();
        let state = State::new(&pulse, 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        state.add_side_effect("skipped", 0, move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut config = JobConfig::default();
        config.side_effects.exclude.push("skipped".to_string());
        state.set_with_config(1, config);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clone_shares_state() {
        let pulse = pulse();
        let state1 = State::new(&pulse, 0);
        let state2 = state1.clone();

        state1.set(42);
        assert_eq!(state2.get(), 42);

        state2.set(100);
        assert_eq!(state1.get(), 100);
    }

    #[test]
    fn deep_merge_nested_objects() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        deep_merge(&mut target, &json!({ "a": { "b": 9 }, "e": 4 }), true);

        assert_eq!(target, json!({ "a": { "b": 9, "c": 2 }, "d": 3, "e": 4 }));
    }

    #[test]
    fn deep_merge_without_new_properties() {
        let mut target = json!({ "a": 1 });
        deep_merge(&mut target, &json!({ "a": 2, "b": 3 }), false);

        assert_eq!(target, json!({ "a": 2 }));
    }
}
