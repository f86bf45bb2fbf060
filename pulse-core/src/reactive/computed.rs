//! Computed Implementation
//!
//! A Computed is a state whose value is derived by a function. Its
//! dependencies are discovered automatically: every reactive value read
//! during the compute function is recorded, and the recorded set replaces
//! the previous one on each recompute: stale dependencies are dropped,
//! newly read ones added. Hard-coded dependencies, declared at creation,
//! are never dropped.
//!
//! When any dependency commits, the runtime re-ingests the computed, which
//! re-runs its function inside a fresh tracking frame and commits the new
//! result through the regular job pipeline.
//!
//! Computed values are read-only from the outside: there is no `set`,
//! `patch` or `undo` in this API, so direct mutation is rejected at compile
//! time rather than at runtime.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::context::TrackingContext;
use super::job::{Job, JobConfig};
use super::observer::{Observer, ObserverId, ObserverNode};
use super::state::StateValue;
use crate::core::Pulse;

/// Configuration for creating a computed.
#[derive(Debug, Clone, Default)]
pub struct ComputedConfig {
    /// Optional key identifying the computed.
    pub key: Option<String>,
}

pub(crate) struct ComputedCore<V: StateValue> {
    pulse: Pulse,
    node: ObserverNode,
    weak_self: Weak<ComputedCore<V>>,

    compute: Box<dyn Fn() -> V + Send + Sync>,

    value: RwLock<Option<V>>,
    previous: RwLock<Option<V>>,
    next: RwLock<Option<V>>,

    /// Observers read during the last evaluation.
    deps: RwLock<IndexMap<ObserverId, Weak<dyn Observer>>>,

    /// Explicitly declared dependencies, never dropped.
    hard_coded: Vec<(ObserverId, Weak<dyn Observer>)>,

    watchers: RwLock<IndexMap<String, Arc<dyn Fn(&V) + Send + Sync>>>,
}

impl<V: StateValue> ComputedCore<V> {
    fn as_observer(&self) -> Option<Arc<dyn Observer>> {
        self.weak_self.upgrade().map(|core| core as Arc<dyn Observer>)
    }

    /// Re-run the compute function with dependency tracking and enqueue the
    /// result.
    fn recompute(&self, config: JobConfig) {
        let new_value = {
            let _frame = TrackingContext::enter(self.node.id());
            let value = (self.compute)();
            let reads = TrackingContext::take_reads();
            self.swap_deps(reads);
            value
        };

        *self.next.write() = Some(new_value);
        let Some(observer) = self.as_observer() else {
            return;
        };
        self.pulse.runtime().ingest(Job::new(observer, config));
    }

    /// Replace the tracked dependency set: stale edges are removed from
    /// their source nodes, new ones registered.
    fn swap_deps(&self, reads: Vec<(ObserverId, Weak<dyn Observer>)>) {
        let mut new_deps: IndexMap<ObserverId, Weak<dyn Observer>> =
            reads.into_iter().collect();
        for (id, weak) in &self.hard_coded {
            new_deps.entry(*id).or_insert_with(|| weak.clone());
        }

        let old_deps = std::mem::replace(&mut *self.deps.write(), new_deps.clone());

        let Some(self_observer) = self.as_observer() else {
            return;
        };

        for (id, weak) in old_deps {
            if !new_deps.contains_key(&id) {
                if let Some(source) = weak.upgrade() {
                    source.node().undepend(self.node.id());
                }
            }
        }
        for weak in new_deps.values() {
            if let Some(source) = weak.upgrade() {
                source.node().depend(&self_observer);
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

impl<V: StateValue> Observer for ComputedCore<V> {
    fn node(&self) -> &ObserverNode {
        &self.node
    }

    fn perform(&self, job: &Job) -> bool {
        let next = self.next.read().clone();
        let Some(next) = next else {
            return false;
        };

        {
            let current = self.value.read().clone();
            if !job.config().force && current.as_ref() == Some(&next) {
                return false;
            }
            *self.previous.write() = current;
        }

        *self.value.write() = Some(next.clone());
        self.node.set_snapshot(serde_json::to_value(&next).ok());
        self.run_watchers(&next);
        true
    }

    fn ingest(&self, config: JobConfig) {
        self.recompute(config);
    }
}

/// A read-only derived value that recomputes when its dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let a = pulse.state(1);
/// let b = pulse.state(2);
///
/// let a2 = a.clone();
/// let b2 = b.clone();
/// let sum = pulse.computed(move || a2.get() + b2.get());
///
/// assert_eq!(sum.get(), 3);
/// a.set(10);
/// assert_eq!(sum.get(), 12);
/// ```
pub struct Computed<V: StateValue> {
    core: Arc<ComputedCore<V>>,
}

impl<V: StateValue> Computed<V> {
    /// Create a computed with auto-tracked dependencies. The function runs
    /// immediately to produce the initial value and discover its reads.
    pub fn new<F>(pulse: &Pulse, compute: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::new_with_deps(pulse, compute, Vec::new())
    }

    /// Create a computed with additional hard-coded dependencies that are
    /// kept even when an evaluation does not read them.
    pub fn new_with_deps<F>(
        pulse: &Pulse,
        compute: F,
        hard_coded: Vec<Arc<dyn Observer>>,
    ) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::new_with_config(pulse, compute, hard_coded, ComputedConfig::default())
    }

    /// Create a computed with an explicit config.
    pub fn new_with_config<F>(
        pulse: &Pulse,
        compute: F,
        hard_coded: Vec<Arc<dyn Observer>>,
        config: ComputedConfig,
    ) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        let hard_coded = hard_coded
            .iter()
            .map(|observer| (observer.node().id(), Arc::downgrade(observer)))
            .collect();

        let core = Arc::new_cyclic(|weak_self| ComputedCore {
            pulse: pulse.clone(),
            node: ObserverNode::new(config.key),
            weak_self: weak_self.clone(),
            compute: Box::new(compute),
            value: RwLock::new(None),
            previous: RwLock::new(None),
            next: RwLock::new(None),
            deps: RwLock::new(IndexMap::new()),
            hard_coded,
            watchers: RwLock::new(IndexMap::new()),
        });

        // Initial evaluation establishes the value and the dependency set.
        core.recompute(JobConfig::default());

        Self { core }
    }

    /// The computed's key, if one was assigned.
    pub fn key(&self) -> Option<String> {
        self.core.node.key()
    }

    /// The observer handle of this computed, for subscription wiring or as
    /// a hard-coded dependency of another computed.
    pub fn observer(&self) -> Arc<dyn Observer> {
        self.core.clone()
    }

    /// Get the current value.
    ///
    /// Reading a computed inside another computed's evaluation records it
    /// as a dependency.
    pub fn get(&self) -> V {
        if TrackingContext::is_active() {
            let weak = Arc::downgrade(&self.core) as Weak<dyn Observer>;
            TrackingContext::track(self.core.node.id(), weak);
        }
        self.get_untracked()
    }

    /// Get the current value without establishing a reactive dependency.
    pub fn get_untracked(&self) -> V {
        let cached = self.core.value.read().clone();
        // Always `Some` after construction; the fallback recomputes inline.
        cached.unwrap_or_else(|| (self.core.compute)())
    }

    /// The value before the last commit, if any.
    pub fn previous_value(&self) -> Option<V> {
        self.core.previous.read().clone()
    }

    /// Force a re-evaluation of the compute function.
    pub fn recompute(&self) -> &Self {
        self.core.recompute(JobConfig::default());
        self
    }

    /// Number of currently tracked dependencies.
    pub fn dep_count(&self) -> usize {
        self.core.deps.read().len()
    }

    /// Register a watcher invoked after every successful recompute commit.
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
}

impl<V: StateValue> Clone for Computed<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<V: StateValue + std::fmt::Debug> std::fmt::Debug for Computed<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("key", &self.key())
            .field("value", &self.get_untracked())
            .field("dep_count", &self.dep_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PulseConfig;
    use crate::reactive::state::State;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pulse() -> Pulse {
        Pulse::new(PulseConfig::default())
    }

    #[test]
    fn computed_evaluates_eagerly() {
        let pulse = pulse();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let computed = Computed::new(&pulse, move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(computed.get(), 42);
        // Reading again does not recompute.
        assert_eq!(computed.get(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn computed_tracks_and_follows_sources() {
        let pulse = pulse();
        let a = State::new(&pulse, 1);
        let b = State::new(&pulse, 2);

        let a2 = a.clone();
        let b2 = b.clone();
        let sum = Computed::new(&pulse, move || a2.get() + b2.get());

        assert_eq!(sum.get(), 3);
        assert_eq!(sum.dep_count(), 2);

        a.set(10);
        assert_eq!(sum.get(), 12);

        b.set(5);
        assert_eq!(sum.get(), 15);
    }

    #[test]
    fn stale_dependencies_are_dropped() {
        let pulse = pulse();
        let toggle = State::new(&pulse, true);
        let left = State::new(&pulse, 10);
        let right = State::new(&pulse, 20);

        let toggle2 = toggle.clone();
        let left2 = left.clone();
        let right2 = right.clone();
        let picked = Computed::new(&pulse, move || {
            if toggle2.get() {
                left2.get()
            } else {
                right2.get()
            }
        });

        assert_eq!(picked.get(), 10);
        assert!(left.observer().node().depends(picked.observer().node().id()));
        assert!(!right.observer().node().depends(picked.observer().node().id()));

        toggle.set(false);
        assert_eq!(picked.get(), 20);

        // The branch flip swapped the tracked source.
        assert!(!left.observer().node().depends(picked.observer().node().id()));
        assert!(right.observer().node().depends(picked.observer().node().id()));
    }

    #[test]
    fn hard_coded_deps_survive_recompute() {
        let pulse = pulse();
        let hidden = State::new(&pulse, 0);
        let runs = Arc::new(AtomicUsize::new(0));

        // Reads `hidden` without tracking, so only the hard-coded edge
        // keeps the computed wired to it.
        let hidden2 = hidden.clone();
        let runs_clone = runs.clone();
        let computed = Computed::new_with_deps(
            &pulse,
            move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                hidden2.get_untracked() * 2
            },
            vec![hidden.observer()],
        );

        assert_eq!(computed.get(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        hidden.set(21);
        assert_eq!(computed.get(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn computed_chains_propagate() {
        let pulse = pulse();
        let base = State::new(&pulse, 5);

        let base2 = base.clone();
        let doubled = Computed::new(&pulse, move || base2.get() * 2);
        let doubled2 = doubled.clone();
        let plus_ten = Computed::new(&pulse, move || doubled2.get() + 10);

        assert_eq!(doubled.get(), 10);
        assert_eq!(plus_ten.get(), 20);

        base.set(10);
        assert_eq!(doubled.get(), 20);
        assert_eq!(plus_ten.get(), 30);
    }

    #[test]
    fn unchanged_result_does_not_notify_watchers() {
        let pulse = pulse();
        let source = State::new(&pulse, 2);
        let commits = Arc::new(AtomicUsize::new(0));

        let source2 = source.clone();
        let parity = Computed::new(&pulse, move || source2.get() % 2);
        let commits_clone = commits.clone();
        parity.watch_with_key("count", move |_| {
            commits_clone.fetch_add(1, Ordering::SeqCst);
        });

        source.set(4);
        // Recomputed, but the result (0) is unchanged, so no commit.
        assert_eq!(commits.load(Ordering::SeqCst), 0);

        source.set(3);
        assert_eq!(parity.get(), 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }
}
