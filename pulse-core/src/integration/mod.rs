//! Integration Boundary
//!
//! This module is the seam between the reactive core and UI adapters. An
//! adapter implements [`Integration`] and registers it on the core handle;
//! components subscribe through [`SubscriptionContainer`]s, which the
//! runtime notifies in batches after each flush.

pub mod integration;
pub mod subscription;

pub use integration::{Integration, IntegrationRegistry};
pub use subscription::{
    ComponentHandle, SubscriptionContainer, SubscriptionContainerId, SubscriptionTarget,
};
