//! fleetset-controller — machine-set reconciliation.
//!
//! Drives the machines selected by each `MachineSet` toward the set's
//! desired replica count. The controller:
//!
//! - Classifies machines as owned, foreign, or orphaned, and adopts orphans
//! - Creates and deletes machines to close the gap to `spec.replicas`
//! - Aggregates ready/available counts from node readiness into set status
//! - Maps machine and node changes back to the sets that care about them
//!
//! There is no lock across sets and no transaction across machines. Every
//! decision is re-derived from freshly read state and every write is
//! version-checked, so a reconcile can be repeated or interrupted at any
//! point.
//!
//! # Architecture
//!
//! ```text
//! Controller (watch + queue + workers)
//!   └── Reconciler::reconcile(set key)
//!         ├── validate
//!         ├── scaling::converge
//!         │     ├── ownership::classify / adopt_orphan
//!         │     └── create / delete (concurrent, UID-pinned deletes)
//!         └── status::compute_status + write_status
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod mapper;
pub mod ownership;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod scaling;
pub mod status;

#[cfg(test)]
mod fixtures;

pub use client::FleetClient;
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{BatchOperation, ControllerError, ControllerResult, ValidationError};
pub use mapper::{UnitMapping, map_unit_to_sets};
pub use ownership::{Ownership, adopt_orphan, classify, should_exclude};
pub use queue::WorkQueue;
pub use reconciler::{Action, Reconciler, validate};
pub use scaling::{Convergence, converge, select_victims};
pub use status::{NodeReadiness, compute_status, write_status};
