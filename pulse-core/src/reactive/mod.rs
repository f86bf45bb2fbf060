//! Reactive Primitives
//!
//! This module implements the core reactive system: observers, the job
//! runtime, states and computed values.
//!
//! # Concepts
//!
//! ## Observers
//!
//! Every reactive entity embeds an observer node in the dependency graph.
//! The node records which computations depend on the entity and which
//! subscription containers are bound to it.
//!
//! ## Jobs and the Runtime
//!
//! Mutations never touch a value directly. They are wrapped in jobs and
//! handed to the runtime, which drains its queue synchronously in FIFO
//! order (committing values, running side effects, walking dependents)
//! and then notifies affected subscribers once per flush.
//!
//! ## States and Computeds
//!
//! A `State` is a mutable reactive value with undo history and named side
//! effects. A `Computed` derives its value from other reactive values and
//! rediscovers its dependencies on every evaluation through a thread-local
//! tracking context, the approach used by fine-grained reactive systems
//! like SolidJS and Leptos.

pub mod computed;
pub mod context;
pub mod job;
pub mod observer;
pub mod runtime;
pub mod state;

pub use computed::{Computed, ComputedConfig};
pub use context::TrackingContext;
pub use job::{Job, JobConfig, SideEffectConfig};
pub use observer::{Observer, ObserverId, ObserverNode};
pub use runtime::Runtime;
pub use state::{State, StateConfig, StateValue, DEFAULT_HISTORY_CAPACITY};
