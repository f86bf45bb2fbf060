//! Storage Backends
//!
//! The core does not implement persistence itself; it defines the contract
//! external key-value stores fulfill and a registry that resolves backend
//! names to registered stores.
//!
//! Values cross the boundary as JSON. A backend that is internally
//! asynchronous (a write-behind queue, a remote store) bridges behind this
//! trait: the core treats every save and remove as fire-and-forget, so
//! eventual writes are indistinguishable from immediate ones.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{ConfigError, StorageError};

/// Contract implemented by external key-value stores.
pub trait StorageBackend: Send + Sync {
    /// Load the value stored under `key`. `None` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Store `value` under `key`.
    fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError>;

    /// Delete the value stored under `key`.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// A named, registered storage backend.
pub struct Storage {
    key: String,
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    /// Wrap a backend under a registry name.
    pub fn new(key: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            key: key.into(),
            backend,
        }
    }

    /// The registry name of this storage.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load a value, resolving backend failures to a logged `None`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(storage = %self.key, key, %err, "storage get failed");
                None
            }
        }
    }

    /// Store a value, fire-and-forget. Failures are logged.
    pub fn set(&self, key: &str, value: &serde_json::Value) {
        if let Err(err) = self.backend.set(key, value) {
            tracing::warn!(storage = %self.key, key, %err, "storage set failed");
        }
    }

    /// Delete a value, fire-and-forget. Failures are logged.
    pub fn remove(&self, key: &str) {
        if let Err(err) = self.backend.remove(key) {
            tracing::warn!(storage = %self.key, key, %err, "storage remove failed");
        }
    }
}

/// Registry of storage backends with an explicit default.
pub struct StorageRegistry {
    storages: RwLock<IndexMap<String, Arc<Storage>>>,
    default_key: RwLock<Option<String>>,
}

impl StorageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            storages: RwLock::new(IndexMap::new()),
            default_key: RwLock::new(None),
        }
    }

    /// Register a storage. The first registered storage becomes the default;
    /// `make_default` promotes a later one.
    pub fn register(&self, storage: Storage, make_default: bool) {
        if storage.key().is_empty() {
            tracing::error!("rejected storage registration with empty key");
            return;
        }

        let key = storage.key().to_string();
        self.storages.write().insert(key.clone(), Arc::new(storage));

        let mut default_key = self.default_key.write();
        if make_default || default_key.is_none() {
            *default_key = Some(key);
        }
    }

    /// Look up a storage by name.
    pub fn get(&self, key: &str) -> Option<Arc<Storage>> {
        self.storages.read().get(key).cloned()
    }

    /// The default storage, if any is registered.
    pub fn default_storage(&self) -> Option<Arc<Storage>> {
        let default_key = self.default_key.read().clone()?;
        self.get(&default_key)
    }

    /// Number of registered storages.
    pub fn len(&self) -> usize {
        self.storages.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.storages.read().is_empty()
    }

    /// Resolve an explicit backend list, or the default when the list is
    /// empty. Unknown names are logged and skipped.
    pub(crate) fn resolve(&self, keys: &[String]) -> Vec<Arc<Storage>> {
        if keys.is_empty() {
            return match self.default_storage() {
                Some(storage) => vec![storage],
                None => Vec::new(),
            };
        }

        keys.iter()
            .filter_map(|key| {
                let storage = self.get(key);
                if storage.is_none() {
                    tracing::error!(
                        err = %ConfigError::UnknownStorage(key.clone()),
                        "storage lookup failed"
                    );
                }
                storage
            })
            .collect()
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory storage backend for tests and examples.
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }
}
