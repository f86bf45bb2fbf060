//! Integrations
//!
//! An integration is the capability interface a UI adapter implements to
//! receive update notifications. Adapters are registered by explicit call on
//! an [`IntegrationRegistry`] owned by the core handle (never by
//! import-time side effect) and are dynamically dispatched per
//! notification batch.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::subscription::ComponentHandle;
use crate::core::Pulse;

/// Capability interface implemented by UI adapters.
pub trait Integration: Send + Sync {
    /// Identifier of the adapter (e.g. `"react"`, `"dioxus"`).
    fn key(&self) -> &str;

    /// Called once at registration to let the adapter initialize.
    ///
    /// Returning `false` marks the integration not-ready; it is skipped
    /// during notification until re-registered.
    fn bind(&self, pulse: &Pulse) -> bool {
        let _ = pulse;
        true
    }

    /// Called once per notification batch for every component-flavored
    /// subscription container that changed.
    fn update(
        &self,
        component: &ComponentHandle,
        changed_props: &IndexMap<String, serde_json::Value>,
    );
}

struct Registered {
    integration: Arc<dyn Integration>,
    ready: bool,
}

/// Explicit registry of UI adapters, owned by the core handle.
pub struct IntegrationRegistry {
    integrations: RwLock<IndexMap<String, Registered>>,
}

impl IntegrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            integrations: RwLock::new(IndexMap::new()),
        }
    }

    /// Register an adapter, calling its `bind` hook.
    pub fn register(&self, pulse: &Pulse, integration: Arc<dyn Integration>) {
        let key = integration.key().to_string();
        let ready = integration.bind(pulse);
        if !ready {
            tracing::warn!(integration = %key, "integration failed to bind, marked not ready");
        }
        self.integrations
            .write()
            .insert(key, Registered { integration, ready });
    }

    /// Whether any integration is registered.
    pub fn has_any(&self) -> bool {
        !self.integrations.read().is_empty()
    }

    /// Number of registered integrations.
    pub fn len(&self) -> usize {
        self.integrations.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.integrations.read().is_empty()
    }

    /// Forward a notification batch to every ready integration.
    ///
    /// A component subscription with no registered integration is a
    /// programmer error: the update cannot be delivered anywhere.
    pub(crate) fn update_all(
        &self,
        component: &ComponentHandle,
        changed_props: &IndexMap<String, serde_json::Value>,
    ) {
        let integrations: Vec<Arc<dyn Integration>> = {
            let registered = self.integrations.read();
            registered
                .values()
                .filter(|entry| entry.ready)
                .map(|entry| Arc::clone(&entry.integration))
                .collect()
        };

        if integrations.is_empty() {
            tracing::error!(
                "no ready integration registered, component update cannot be delivered"
            );
            return;
        }

        for integration in integrations {
            integration.update(component, changed_props);
        }
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Pulse, PulseConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIntegration {
        ready: bool,
        updates: AtomicUsize,
    }

    impl Integration for CountingIntegration {
        fn key(&self) -> &str {
            "counting"
        }

        fn bind(&self, _pulse: &Pulse) -> bool {
            self.ready
        }

        fn update(
            &self,
            _component: &ComponentHandle,
            _changed_props: &IndexMap<String, serde_json::Value>,
        ) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_and_update() {
        let pulse = Pulse::new(PulseConfig::default());
        let registry = IntegrationRegistry::new();
        let integration = Arc::new(CountingIntegration {
            ready: true,
            updates: AtomicUsize::new(0),
        });

        registry.register(&pulse, integration.clone());
        assert_eq!(registry.len(), 1);

        registry.update_all(&ComponentHandle::new(()), &IndexMap::new());
        assert_eq!(integration.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_ready_integrations_are_skipped() {
        let pulse = Pulse::new(PulseConfig::default());
        let registry = IntegrationRegistry::new();
        let integration = Arc::new(CountingIntegration {
            ready: false,
            updates: AtomicUsize::new(0),
        });

        registry.register(&pulse, integration.clone());
        registry.update_all(&ComponentHandle::new(()), &IndexMap::new());

        assert_eq!(integration.updates.load(Ordering::SeqCst), 0);
    }
}
