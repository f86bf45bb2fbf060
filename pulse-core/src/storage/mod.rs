//! Persistent / Storage
//!
//! Synchronization between in-memory reactive state and external key-value
//! stores. The core defines the backend contract and the sync logic; it
//! ships no backend of its own beyond an in-memory one for tests.

pub mod backend;
pub mod persistent;

pub use backend::{MemoryStorage, Storage, StorageBackend, StorageRegistry};
pub use persistent::{CollectionPersistent, PersistConfig, StatePersistent};
