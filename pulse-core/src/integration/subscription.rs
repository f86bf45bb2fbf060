//! Subscription Containers
//!
//! A subscription container is the boundary object a UI adapter owns to
//! receive batched change notifications. It bundles the set of observers a
//! component (or plain callback) is interested in, a readiness flag, and,
//! for object-shaped subscriptions, a map from property name to observer
//! used to build the partial "what changed" payload.
//!
//! The runtime marks containers dirty while committing jobs and notifies
//! each dirty container exactly once per flush, batching every observer
//! that changed within that flush into a single payload.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};

use crate::reactive::observer::{Observer, ObserverId};

/// Unique identifier for a subscription container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionContainerId(u64);

impl SubscriptionContainerId {
    /// Generate a new unique container ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionContainerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque token identifying the adapter-side component a subscription
/// belongs to. The core never inspects it; it is handed back verbatim on
/// every update.
#[derive(Clone)]
pub struct ComponentHandle(Arc<dyn Any + Send + Sync>);

impl ComponentHandle {
    /// Wrap an adapter-side component value.
    pub fn new<T: Any + Send + Sync>(component: T) -> Self {
        Self(Arc::new(component))
    }

    /// Downcast back to the adapter-side type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ComponentHandle(..)")
    }
}

/// How a container's notification is delivered.
pub enum SubscriptionTarget {
    /// A plain callback, invoked once per notification batch.
    Callback(Arc<dyn Fn() + Send + Sync>),

    /// A component handle, forwarded to every ready integration together
    /// with the changed-props payload.
    Component(ComponentHandle),
}

/// The boundary object a UI adapter registers to receive notifications.
pub struct SubscriptionContainer {
    id: SubscriptionContainerId,

    /// Containers start not-ready until the owning component has mounted;
    /// the runtime retries not-ready containers a bounded number of times.
    ready: AtomicBool,

    target: SubscriptionTarget,

    /// Observers this container is bound to.
    subs: RwLock<IndexMap<ObserverId, Weak<dyn Observer>>>,

    /// For object-shaped subscriptions: property name -> observer, used to
    /// assemble the partial changed-props payload.
    prop_map: Option<IndexMap<String, ObserverId>>,

    /// Observers that changed since the last notification.
    changed: Mutex<IndexSet<ObserverId>>,
}

impl SubscriptionContainer {
    /// Create a callback-flavored container. Callback containers have no
    /// mount phase and start ready.
    pub fn callback<F>(callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: SubscriptionContainerId::new(),
            ready: AtomicBool::new(true),
            target: SubscriptionTarget::Callback(Arc::new(callback)),
            subs: RwLock::new(IndexMap::new()),
            prop_map: None,
            changed: Mutex::new(IndexSet::new()),
        })
    }

    /// Create a component-flavored container with an object-shaped
    /// subscription. Starts not-ready; the adapter flips readiness once the
    /// component has mounted.
    pub fn component(
        handle: ComponentHandle,
        prop_map: IndexMap<String, ObserverId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionContainerId::new(),
            ready: AtomicBool::new(false),
            target: SubscriptionTarget::Component(handle),
            subs: RwLock::new(IndexMap::new()),
            prop_map: Some(prop_map),
            changed: Mutex::new(IndexSet::new()),
        })
    }

    /// Get the container's ID.
    pub fn id(&self) -> SubscriptionContainerId {
        self.id
    }

    /// Whether the container is ready to receive notifications.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Flip the readiness flag. Called by the adapter around component
    /// mount/unmount.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// How this container's notifications are delivered.
    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Bind an observer to this container. Idempotent.
    pub fn add_sub(&self, observer: &Arc<dyn Observer>) {
        self.subs
            .write()
            .entry(observer.node().id())
            .or_insert_with(|| Arc::downgrade(observer));
    }

    /// Number of bound observers.
    pub fn sub_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Record that `observer` changed since the last notification.
    pub(crate) fn mark_changed(&self, observer: ObserverId) {
        self.changed.lock().insert(observer);
    }

    /// Drain the changed-observer set.
    pub(crate) fn take_changed(&self) -> IndexSet<ObserverId> {
        std::mem::take(&mut *self.changed.lock())
    }

    /// Assemble the partial changed-props payload for an object-shaped
    /// subscription: every mapped property whose observer changed, with the
    /// observer's committed value snapshot.
    pub(crate) fn build_changed_props(
        &self,
        changed: &IndexSet<ObserverId>,
    ) -> IndexMap<String, serde_json::Value> {
        let mut props = IndexMap::new();
        let Some(prop_map) = &self.prop_map else {
            return props;
        };

        let subs = self.subs.read();
        for (name, observer_id) in prop_map {
            if !changed.contains(observer_id) {
                continue;
            }
            let snapshot = subs
                .get(observer_id)
                .and_then(Weak::upgrade)
                .and_then(|observer| observer.node().snapshot())
                .unwrap_or(serde_json::Value::Null);
            props.insert(name.clone(), snapshot);
        }
        props
    }

    /// Detach this container from every observer it is bound to.
    pub fn unsubscribe(&self) {
        let subs = std::mem::take(&mut *self.subs.write());
        for (_, weak) in subs {
            if let Some(observer) = weak.upgrade() {
                observer.node().unsubscribe(self.id);
            }
        }
        self.changed.lock().clear();
    }
}

impl std::fmt::Debug for SubscriptionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionContainer")
            .field("id", &self.id)
            .field("ready", &self.ready())
            .field("sub_count", &self.sub_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::job::{Job, JobConfig};
    use crate::reactive::observer::ObserverNode;

    struct StubObserver {
        node: ObserverNode,
    }

    impl StubObserver {
        fn with_snapshot(snapshot: serde_json::Value) -> Arc<Self> {
            let stub = Arc::new(Self {
                node: ObserverNode::new(None),
            });
            stub.node.set_snapshot(Some(snapshot));
            stub
        }
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

    #[test]
    fn callback_containers_start_ready() {
        let container = SubscriptionContainer::callback(|| {});
        assert!(container.ready());
    }

    #[test]
    fn component_containers_start_not_ready() {
        let container =
            SubscriptionContainer::component(ComponentHandle::new(()), IndexMap::new());
        assert!(!container.ready());

        container.set_ready(true);
        assert!(container.ready());
    }

    #[test]
    fn add_sub_is_idempotent() {
        let container = SubscriptionContainer::callback(|| {});
        let observer: Arc<dyn Observer> = StubObserver::with_snapshot(serde_json::json!(1));

        container.add_sub(&observer);
        container.add_sub(&observer);

        assert_eq!(container.sub_count(), 1);
    }

    #[test]
    fn changed_props_only_contain_changed_observers() {
        let a: Arc<dyn Observer> = StubObserver::with_snapshot(serde_json::json!(1));
        let b: Arc<dyn Observer> = StubObserver::with_snapshot(serde_json::json!("two"));

        let mut prop_map = IndexMap::new();
        prop_map.insert("a".to_string(), a.node().id());
        prop_map.insert("b".to_string(), b.node().id());

        let container = SubscriptionContainer::component(ComponentHandle::new(()), prop_map);
        container.add_sub(&a);
        container.add_sub(&b);

        container.mark_changed(a.node().id());
        let changed = container.take_changed();
        let props = container.build_changed_props(&changed);

        assert_eq!(props.len(), 1);
        assert_eq!(props.get("a"), Some(&serde_json::json!(1)));
        assert!(props.get("b").is_none());
    }

    #[test]
    fn unsubscribe_detaches_from_observers() {
        let observer: Arc<dyn Observer> = StubObserver::with_snapshot(serde_json::json!(0));
        let container = SubscriptionContainer::callback(|| {});

        observer.node().subscribe(&container);
        container.add_sub(&observer);
        assert!(observer.node().has_subscribers());

        container.unsubscribe();
        assert!(!observer.node().has_subscribers());
        assert_eq!(container.sub_count(), 0);
    }

    #[test]
    fn component_handle_downcasts() {
        let handle = ComponentHandle::new("component-7".to_string());
        assert_eq!(
            handle.downcast_ref::<String>().map(String::as_str),
            Some("component-7")
        );
        assert!(handle.downcast_ref::<u32>().is_none());
    }
}
