//! Collection Family
//!
//! An indexed, ordered, reactively-updated view over a set of keyed
//! records:
//!
//! - [`Collection`] owns the key→item data map and is the single owner of
//!   its groups and selectors.
//! - [`Item`] wraps one record as a reactive state; placeholders stand in
//!   for keys referenced before data exists.
//! - [`Group`] maintains an ordered key sequence with a cached output,
//!   incrementally rebuilt from recorded [`Delta`]s where possible.
//! - [`Selector`] mirrors the value of exactly one item.

pub mod collection;
pub mod group;
pub mod item;
pub mod selector;

pub use collection::{
    CollectConfig, Collection, CollectionConfig, Remover, UpdateConfig, DEFAULT_GROUP_KEY,
};
pub use group::{AddConfig, AddMethod, Delta, Group};
pub use item::{Item, ItemKey};
pub use selector::{SelectConfig, Selector};
