//! Error taxonomy.
//!
//! The core never throws out of its public API for data-shape problems.
//! Fallible internals return these errors; the public boundary resolves them
//! by logging through `tracing` and leaving the entity in its prior state.

use thiserror::Error;

/// Configuration-class failures: the operation is aborted and the entity is
/// left unchanged.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No key could be resolved for an entity that requires one.
    #[error("no key could be resolved for the entity")]
    MissingKey,

    /// An entity key is already in use (e.g. renaming an Item onto an
    /// occupied key).
    #[error("key `{0}` is already in use")]
    KeyCollision(String),

    /// `patch` was called on a value that does not serialize to a JSON
    /// object.
    #[error("value does not serialize to a JSON object and cannot be patched")]
    NotAnObject,

    /// A collected record is missing the collection's primary-key field.
    #[error("record has no usable `{0}` primary-key field")]
    MissingPrimaryKey(String),

    /// A patch merge produced a value that no longer deserializes into the
    /// state's value type.
    #[error("patched value no longer deserializes: {0}")]
    InvalidPatch(String),

    /// A persist call referenced a storage backend that is not registered.
    #[error("no storage backend registered under `{0}`")]
    UnknownStorage(String),

    /// A persist call needed the default storage backend but none is
    /// registered.
    #[error("no default storage backend is registered")]
    NoDefaultStorage,
}

/// Failures surfaced by a storage backend or by (de)serializing values on
/// their way to one.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend itself reported a failure.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A value could not be converted to or from its stored JSON form.
    #[error("storage serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}
