//! Runtime
//!
//! The runtime is the central coordinator: it serializes mutation requests
//! into a deterministic apply-then-notify sequence.
//!
//! # How It Works
//!
//! 1. A mutation is wrapped in a [`Job`] and handed to [`Runtime::ingest`].
//!
//! 2. If no flush is in progress, the runtime drains its queue synchronously
//!    to a fixed point. For each job, strictly in FIFO order:
//!    a. the observer commits its pending value (skipped entirely when the
//!       new value equals the current one and the job is not forced),
//!    b. the observer's registered side effects run in ascending weight
//!       order,
//!    c. every dependent observer is re-ingested, and
//!    d. unless the job is background, every bound subscription container is
//!       marked dirty.
//!
//! 3. After the queue drains, one notification pass runs: every dirty
//!    container is notified exactly once, batching all observers that
//!    changed within the flush into a single payload.
//!
//! Jobs ingested while a flush is in progress (from side effects or the
//! dependent walk) are appended to the queue and processed by the same
//! flush; the notification pass only runs once the queue is empty.
//!
//! # Failure Semantics
//!
//! Application-level problems (missing keys, dead references) are logged
//! and skipped; the runtime never panics out of a flush. A container that
//! is not yet ready is retried on later flushes a bounded number of times,
//! then dropped with a diagnostic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::job::Job;
use super::observer::Observer;
use crate::integration::subscription::{
    SubscriptionContainer, SubscriptionContainerId, SubscriptionTarget,
};
use crate::integration::IntegrationRegistry;

/// How many flushes a not-ready container survives before being dropped.
const MAX_NOT_READY_TRIES: u8 = 3;

/// The job scheduler draining mutations and dispatching notifications.
pub struct Runtime {
    /// Pending jobs in enqueue order.
    queue: Mutex<VecDeque<Job>>,

    /// Whether a flush is currently draining the queue.
    performing: AtomicBool,

    /// Containers touched by the current flush, in first-touched order.
    dirty: Mutex<IndexMap<SubscriptionContainerId, Weak<SubscriptionContainer>>>,

    /// Retry counters for containers that were dirty but not ready.
    not_ready_tries: Mutex<IndexMap<SubscriptionContainerId, u8>>,

    /// Adapter registry consulted during the notification pass.
    integrations: Arc<IntegrationRegistry>,
}

impl Runtime {
    /// Create a runtime wired to the given integration registry.
    pub fn new(integrations: Arc<IntegrationRegistry>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            performing: AtomicBool::new(false),
            dirty: Mutex::new(IndexMap::new()),
            not_ready_tries: Mutex::new(IndexMap::new()),
            integrations,
        }
    }

    /// Enqueue a job and, unless a flush is already draining, flush to a
    /// fixed point followed by one notification pass.
    pub fn ingest(&self, job: Job) {
        self.queue.lock().push_back(job);

        // A flush already in progress will pick the job up; re-entrant
        // ingests (from side effects or the dependent walk) land here.
        if self.performing.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => self.perform(&job),
                None => break,
            }
        }
        self.performing.store(false, Ordering::Release);

        self.update_subscribers();
    }

    /// Number of queued jobs. Non-zero only while a flush is in progress.
    pub fn queued_jobs(&self) -> usize {
        self.queue.lock().len()
    }

    /// Commit one job: value, side effects, dependent walk, dirty marking.
    fn perform(&self, job: &Job) {
        let observer = job.observer();

        if !observer.perform(job) {
            tracing::debug!(
                observer = observer.node().id().raw(),
                "job skipped, value unchanged"
            );
            return;
        }

        // Walk dependents so derived values and group outputs stay
        // consistent. Their jobs land behind this one in the queue.
        for dependent in observer.node().dependents() {
            dependent.ingest(job.config().clone());
        }

        if job.rerender() {
            let node_id = observer.node().id();
            let mut dirty = self.dirty.lock();
            for container in observer.node().subscribers() {
                container.mark_changed(node_id);
                dirty
                    .entry(container.id())
                    .or_insert_with(|| Arc::downgrade(&container));
            }
        }
    }

    /// The notification pass: invoke each dirty container's update path
    /// exactly once.
    fn update_subscribers(&self) {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        if dirty.is_empty() {
            return;
        }

        for (container_id, weak) in dirty {
            let Some(container) = weak.upgrade() else {
                self.not_ready_tries.lock().shift_remove(&container_id);
                continue;
            };

            if !container.ready() {
                self.retry_later(container_id, &container);
                continue;
            }
            self.not_ready_tries.lock().shift_remove(&container_id);

            let changed = container.take_changed();
            if changed.is_empty() {
                continue;
            }

            match container.target() {
                SubscriptionTarget::Callback(callback) => callback(),
                SubscriptionTarget::Component(handle) => {
                    let props = container.build_changed_props(&changed);
                    self.integrations.update_all(handle, &props);
                }
            }
        }
    }

    /// Keep a not-ready container dirty for the next flush, or drop it once
    /// its retries are used up.
    fn retry_later(&self, container_id: SubscriptionContainerId, container: &Arc<SubscriptionContainer>) {
        let mut tries = self.not_ready_tries.lock();
        let count = tries.entry(container_id).or_insert(0);
        *count += 1;

        if *count > MAX_NOT_READY_TRIES {
            tries.shift_remove(&container_id);
            container.take_changed();
            tracing::warn!(
                container = container_id.raw(),
                tries = MAX_NOT_READY_TRIES,
                "subscription container never became ready, dropping its update"
            );
            return;
        }

        tracing::debug!(
            container = container_id.raw(),
            attempt = *count,
            "subscription container not ready, retrying on next flush"
        );
        self.dirty.lock().insert(container_id, Arc::downgrade(container));
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("queued_jobs", &self.queued_jobs())
            .field("performing", &self.performing.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::job::JobConfig;
    use crate::reactive::observer::{Observer, ObserverNode};
    use std::sync::atomic::AtomicUsize;

    struct MockObserver {
        node: ObserverNode,
        performs: AtomicUsize,
        skip: bool,
    }

    impl MockObserver {
        fn new(skip: bool) -> Arc<Self> {
            Arc::new(Self {
                node: ObserverNode::new(None),
                performs: AtomicUsize::new(0),
                skip,
            })
        }
    }

    impl Observer for MockObserver {
        fn node(&self) -> &ObserverNode {
            &self.node
        }

        fn perform(&self, _job: &Job) -> bool {
            self.performs.fetch_add(1, Ordering::SeqCst);
            !self.skip
        }

        fn ingest(&self, _config: JobConfig) {}
    }

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(IntegrationRegistry::new()))
    }

    #[test]
    fn ingest_performs_job() {
        let runtime = runtime();
        let observer = MockObserver::new(false);

        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));

        assert_eq!(observer.performs.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.queued_jobs(), 0);
    }

    #[test]
    fn same_observer_jobs_both_run() {
        let runtime = runtime();
        let observer = MockObserver::new(false);

        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));
        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));

        assert_eq!(observer.performs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn skipped_job_does_not_mark_subscribers() {
        let runtime = runtime();
        let observer = MockObserver::new(true);
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();

        let container = SubscriptionContainer::callback(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });
        let observer_dyn: Arc<dyn Observer> = observer.clone();
        observer.node().subscribe(&container);
        container.add_sub(&observer_dyn);

        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));

        assert_eq!(observer.performs.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_container_notified_once_per_flush() {
        let runtime = runtime();
        let observer = MockObserver::new(false);
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();

        let container = SubscriptionContainer::callback(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });
        let observer_dyn: Arc<dyn Observer> = observer.clone();
        observer.node().subscribe(&container);
        container.add_sub(&observer_dyn);

        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        runtime.ingest(Job::new(observer.clone(), JobConfig::default()));
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn background_job_suppresses_notification() {
        let runtime = runtime();
        let observer = MockObserver::new(false);
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();

        let container = SubscriptionContainer::callback(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });
        let observer_dyn: Arc<dyn Observer> = observer.clone();
        observer.node().subscribe(&container);
        container.add_sub(&observer_dyn);

        runtime.ingest(Job::new(observer.clone(), JobConfig::background()));

        // Value committed, no notification.
        assert_eq!(observer.performs.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn not_ready_container_dropped_after_bounded_retries() {
        let runtime = runtime();
        let observer = MockObserver::new(false);

        let container = SubscriptionContainer::component(
            crate::integration::ComponentHandle::new(()),
            IndexMap::new(),
        );
        let observer_dyn: Arc<dyn Observer> = observer.clone();
        observer.node().subscribe(&container);
        container.add_sub(&observer_dyn);

        // First flush marks the container dirty; it is retried across the
        // following flushes and eventually dropped.
        for _ in 0..=MAX_NOT_READY_TRIES {
            runtime.ingest(Job::new(observer.clone(), JobConfig::default()));
        }
        assert!(runtime.not_ready_tries.lock().is_empty());
        assert!(runtime.dirty.lock().is_empty());
    }
}
