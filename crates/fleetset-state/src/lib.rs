//! fleetset-state — object model and embedded state store for fleetset.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for machine sets, machines, and nodes.
//!
//! # Architecture
//!
//! All objects are JSON-serialized into redb's `&[u8]` value columns.
//! Namespaced objects use `{namespace}/{name}` keys so a namespace can be
//! listed with a prefix scan. Nodes are cluster-scoped and keyed by name.
//!
//! Every write stamps the object with a store-wide, monotonically increasing
//! `resource_version`. Updates that carry a stale version fail with
//! [`StateError::Conflict`], which is how concurrent controllers avoid
//! clobbering each other without a lock.
//!
//! Committed writes are published on a broadcast channel (see
//! [`StateStore::subscribe`]) so a controller can watch for changes.

pub mod error;
pub mod events;
pub mod selector;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use events::{EventAction, StoreEvent};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorError, SelectorOperator};
pub use store::{MachinePatch, StateStore};
pub use types::*;
