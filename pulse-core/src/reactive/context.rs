//! Tracking Context
//!
//! The tracking context records which computation is currently evaluating.
//! This enables automatic dependency discovery: when a reactive value is
//! read, the read is recorded against the evaluation that is running.
//!
//! # Implementation
//!
//! A thread-local stack of frames tracks the currently evaluating computed.
//! Entering a frame pushes onto the stack; the returned guard pops it on
//! drop, so the stack stays balanced even if the compute function panics.
//! Each frame collects its own reads, which keeps nested evaluations (a
//! computed reading another computed) from cross-talking.

use std::cell::RefCell;
use std::sync::Weak;

use super::observer::{Observer, ObserverId};

thread_local! {
    static FRAME_STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// One evaluation frame: the observer being computed and the reads recorded
/// while its compute function runs.
struct Frame {
    observer_id: ObserverId,
    reads: Vec<(ObserverId, Weak<dyn Observer>)>,
}

/// Guard that pops the frame when dropped.
pub struct TrackingContext {
    observer_id: ObserverId,
}

impl TrackingContext {
    /// Enter a new tracking frame for the given observer.
    ///
    /// While the frame is active, every tracked read records its observer
    /// into the frame. The frame is exited when the guard is dropped.
    pub fn enter(observer_id: ObserverId) -> Self {
        FRAME_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                observer_id,
                reads: Vec::new(),
            });
        });

        Self { observer_id }
    }

    /// Whether an evaluation frame is currently active on this thread.
    pub fn is_active() -> bool {
        FRAME_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The observer currently being evaluated, if any.
    pub fn current_observer() -> Option<ObserverId> {
        FRAME_STACK.with(|stack| stack.borrow().last().map(|frame| frame.observer_id))
    }

    /// Record a read of `observer` against the active frame.
    ///
    /// Called by reactive values when they are read. No-op outside a frame;
    /// duplicate reads of the same observer collapse to one entry.
    pub fn track(observer: ObserverId, weak: Weak<dyn Observer>) {
        FRAME_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                if !frame.reads.iter().any(|(id, _)| *id == observer) {
                    frame.reads.push((observer, weak));
                }
            }
        });
    }

    /// Drain the reads recorded in the active frame.
    pub fn take_reads() -> Vec<(ObserverId, Weak<dyn Observer>)> {
        FRAME_STACK.with(|stack| {
            stack
                .borrow_mut()
                .last_mut()
                .map(|frame| std::mem::take(&mut frame.reads))
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackingContext {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Catch mismatched enter/drop pairs early in debug builds.
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.observer_id, self.observer_id,
                    "TrackingContext mismatch: expected {:?}, got {:?}",
                    self.observer_id, frame.observer_id
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::job::{Job, JobConfig};
    use crate::reactive::observer::ObserverNode;
    use std::sync::Arc;

    struct StubObserver {
        node: ObserverNode,
    }

    impl Observer for StubObserver {
        fn node(&self) -> &ObserverNode {
            &self.node
        }

        fn perform(&self, _job: &Job) -> bool {
            true
        }

        fn ingest(&self, _config: JobConfig) {}
    }

    fn stub() -> Arc<dyn Observer> {
        Arc::new(StubObserver {
            node: ObserverNode::new(None),
        })
    }

    #[test]
    fn context_tracks_current_observer() {
        let id = ObserverId::new();

        assert!(!TrackingContext::is_active());
        assert!(TrackingContext::current_observer().is_none());

        {
            let _ctx = TrackingContext::enter(id);

            assert!(TrackingContext::is_active());
            assert_eq!(TrackingContext::current_observer(), Some(id));
        }

        assert!(!TrackingContext::is_active());
        assert!(TrackingContext::current_observer().is_none());
    }

    #[test]
    fn context_records_reads() {
        let _ctx = TrackingContext::enter(ObserverId::new());

        let a = stub();
        let b = stub();
        TrackingContext::track(a.node().id(), Arc::downgrade(&a));
        TrackingContext::track(b.node().id(), Arc::downgrade(&b));

        let reads = TrackingContext::take_reads();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].0, a.node().id());
        assert_eq!(reads[1].0, b.node().id());
    }

    #[test]
    fn duplicate_reads_collapse() {
        let _ctx = TrackingContext::enter(ObserverId::new());

        let a = stub();
        TrackingContext::track(a.node().id(), Arc::downgrade(&a));
        TrackingContext::track(a.node().id(), Arc::downgrade(&a));
        TrackingContext::track(a.node().id(), Arc::downgrade(&a));

        assert_eq!(TrackingContext::take_reads().len(), 1);
    }

    #[test]
    fn nested_frames_do_not_cross_talk() {
        let outer = ObserverId::new();
        let inner = ObserverId::new();
        let a = stub();
        let b = stub();

        {
            let _outer_ctx = TrackingContext::enter(outer);
            TrackingContext::track(a.node().id(), Arc::downgrade(&a));

            {
                let _inner_ctx = TrackingContext::enter(inner);
                assert_eq!(TrackingContext::current_observer(), Some(inner));
                TrackingContext::track(b.node().id(), Arc::downgrade(&b));

                let inner_reads = TrackingContext::take_reads();
                assert_eq!(inner_reads.len(), 1);
                assert_eq!(inner_reads[0].0, b.node().id());
            }

            // Back in the outer frame, only the outer read is visible.
            assert_eq!(TrackingContext::current_observer(), Some(outer));
            let outer_reads = TrackingContext::take_reads();
            assert_eq!(outer_reads.len(), 1);
            assert_eq!(outer_reads[0].0, a.node().id());
        }

        assert!(!TrackingContext::is_active());
    }
}
