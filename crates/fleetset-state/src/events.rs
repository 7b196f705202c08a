//! Change notifications published by the store after each committed write.

use crate::types::{Machine, MachineSet, Node, ObjectKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// The object was created or updated (including being marked for deletion).
    Applied,
    /// The object was removed from the store.
    Deleted,
}

/// A committed change, carrying the object as it was written (or, for
/// deletions, as it was last stored).
#[derive(Debug, Clone)]
pub enum StoreEvent {
    MachineSet { action: EventAction, object: MachineSet },
    Machine { action: EventAction, object: Machine },
    Node { action: EventAction, object: Node },
}

impl StoreEvent {
    pub fn action(&self) -> EventAction {
        match self {
            StoreEvent::MachineSet { action, .. }
            | StoreEvent::Machine { action, .. }
            | StoreEvent::Node { action, .. } => *action,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            StoreEvent::MachineSet { object, .. } => object.metadata.key(),
            StoreEvent::Machine { object, .. } => object.metadata.key(),
            StoreEvent::Node { object, .. } => object.metadata.key(),
        }
    }
}
