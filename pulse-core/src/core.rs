//! Core Handle
//!
//! [`Pulse`] is the explicit constructor of one reactive core: it owns the
//! job runtime, the storage registry and the integration registry. Every
//! reactive entity is created against a handle and shares its internals;
//! nothing is registered through import-time side effects.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::collection::collection::{Collection, CollectionConfig};
use crate::integration::integration::{Integration, IntegrationRegistry};
use crate::integration::subscription::{ComponentHandle, SubscriptionContainer};
use crate::reactive::computed::Computed;
use crate::reactive::observer::Observer;
use crate::reactive::runtime::Runtime;
use crate::reactive::state::{State, StateConfig, StateValue};
use crate::storage::backend::{Storage, StorageRegistry};

/// Configuration for creating a core handle.
#[derive(Debug, Clone, Default)]
pub struct PulseConfig {
    /// Optional key identifying this core instance in diagnostics.
    pub key: Option<String>,
}

struct PulseShared {
    key: Option<String>,
    runtime: Arc<Runtime>,
    storages: Arc<StorageRegistry>,
    integrations: Arc<IntegrationRegistry>,
}

/// Handle to one reactive core. Cheap to clone; all clones share the same
/// runtime and registries.
pub struct Pulse {
    shared: Arc<PulseShared>,
}

impl Pulse {
    /// Create a core with its own runtime and empty registries.
    pub fn new(config: PulseConfig) -> Self {
        let integrations = Arc::new(IntegrationRegistry::new());
        Self {
            shared: Arc::new(PulseShared {
                key: config.key,
                runtime: Arc::new(Runtime::new(Arc::clone(&integrations))),
                storages: Arc::new(StorageRegistry::new()),
                integrations,
            }),
        }
    }

    /// The core's key, if one was assigned.
    pub fn key(&self) -> Option<&str> {
        self.shared.key.as_deref()
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.shared.runtime
    }

    pub(crate) fn storages(&self) -> &Arc<StorageRegistry> {
        &self.shared.storages
    }

    // ------------------------------------------------------------------
    // Entity factories
    // ------------------------------------------------------------------

    /// Create a [`State`] with the given initial value.
    pub fn state<V: StateValue>(&self, initial: V) -> State<V> {
        State::new(self, initial)
    }

    /// Create a [`State`] with an explicit config.
    pub fn state_with_config<V: StateValue>(&self, initial: V, config: StateConfig) -> State<V> {
        State::new_with_config(self, initial, config)
    }

    /// Create a [`Computed`] deriving its value from the reactive values it
    /// reads.
    pub fn computed<V, F>(&self, compute: F) -> Computed<V>
    where
        V: StateValue,
        F: Fn() -> V + Send + Sync + 'static,
    {
        Computed::new(self, compute)
    }

    /// Create a [`Computed`] with additional hard-coded dependencies.
    pub fn computed_with_deps<V, F>(
        &self,
        compute: F,
        hard_coded: Vec<Arc<dyn Observer>>,
    ) -> Computed<V>
    where
        V: StateValue,
        F: Fn() -> V + Send + Sync + 'static,
    {
        Computed::new_with_deps(self, compute, hard_coded)
    }

    /// Create a [`Collection`] with the default config (`id` primary key).
    pub fn collection<V: StateValue>(&self) -> Collection<V> {
        Collection::new(self, CollectionConfig::default())
    }

    /// Create a [`Collection`] with an explicit config.
    pub fn collection_with_config<V: StateValue>(
        &self,
        config: CollectionConfig,
    ) -> Collection<V> {
        Collection::new(self, config)
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// Register a storage backend. The first registered backend becomes the
    /// default; `make_default` promotes a later one.
    pub fn register_storage(&self, storage: Storage, make_default: bool) -> &Self {
        self.shared.storages.register(storage, make_default);
        self
    }

    /// Register a UI adapter, calling its `bind` hook.
    pub fn register_integration(&self, integration: Arc<dyn Integration>) -> &Self {
        self.shared.integrations.register(self, integration);
        self
    }

    /// Number of registered integrations.
    pub fn integration_count(&self) -> usize {
        self.shared.integrations.len()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a plain callback to the given observers. The callback runs
    /// once per notification batch.
    pub fn subscribe_callback<F>(
        &self,
        observers: &[Arc<dyn Observer>],
        callback: F,
    ) -> Arc<SubscriptionContainer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let container = SubscriptionContainer::callback(callback);
        for observer in observers {
            observer.node().subscribe(&container);
            container.add_sub(observer);
        }
        container
    }

    /// Subscribe a component with an object-shaped prop map. Notifications
    /// carry only the props whose observers changed.
    pub fn subscribe_component(
        &self,
        handle: ComponentHandle,
        props: IndexMap<String, Arc<dyn Observer>>,
    ) -> Arc<SubscriptionContainer> {
        let mut prop_map = IndexMap::new();
        for (name, observer) in &props {
            prop_map.insert(name.clone(), observer.node().id());
        }

        let container = SubscriptionContainer::component(handle, prop_map);
        for observer in props.values() {
            observer.node().subscribe(&container);
            container.add_sub(observer);
        }
        container
    }

    /// Detach a subscription container from every observer it is bound to.
    pub fn unsubscribe(&self, container: &Arc<SubscriptionContainer>) -> &Self {
        container.unsubscribe();
        self
    }
}

impl Clone for Pulse {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new(PulseConfig::default())
    }
}

impl std::fmt::Debug for Pulse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pulse")
            .field("key", &self.shared.key)
            .field("storages", &self.shared.storages.len())
            .field("integrations", &self.shared.integrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factories_share_the_core() {
        let pulse = Pulse::default();

        let count = pulse.state(0);
        let count2 = count.clone();
        let doubled = pulse.computed(move || count2.get() * 2);

        count.set(4);
        assert_eq!(doubled.get(), 8);
    }

    #[test]
    fn cores_are_independent() {
        let a = Pulse::new(PulseConfig {
            key: Some("a".to_string()),
        });
        let b = Pulse::new(PulseConfig {
            key: Some("b".to_string()),
        });

        assert_eq!(a.key(), Some("a"));
        assert_eq!(b.key(), Some("b"));

        a.register_storage(
            Storage::new("memory", crate::storage::backend::MemoryStorage::new()),
            false,
        );
        assert_eq!(a.storages().len(), 1);
        assert_eq!(b.storages().len(), 0);
    }
}
