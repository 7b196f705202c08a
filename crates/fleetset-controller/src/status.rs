//! Status aggregation.
//!
//! Computes a set's replica counts from its active machines and the
//! readiness of the nodes they are attached to, and persists the result
//! to the status sub-resource.

use std::collections::HashMap;

use tracing::debug;

use fleetset_state::{Machine, MachineSet, MachineSetStatus, Node, ObjectKey};

use crate::client::FleetClient;
use crate::error::ControllerResult;
use crate::retry::retry_on_conflict;

/// Snapshot of node readiness, indexed by node name.
#[derive(Debug, Clone, Default)]
pub struct NodeReadiness {
    nodes: HashMap<String, NodeEntry>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    uid: String,
    ready_since: Option<u64>,
}

impl NodeReadiness {
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| {
                let entry = NodeEntry {
                    uid: node.metadata.uid.clone(),
                    ready_since: node.ready_since(),
                };
                (node.metadata.name, entry)
            })
            .collect();
        Self { nodes }
    }

    /// When the node `machine` is attached to became ready, if it exists
    /// and is ready now. A node reference carrying a UID only matches that
    /// exact node, not a later node reusing the name.
    pub fn ready_since(&self, machine: &Machine) -> Option<u64> {
        let node_ref = machine.status.node_ref.as_ref()?;
        let entry = self.nodes.get(&node_ref.name)?;
        if !node_ref.uid.is_empty() && node_ref.uid != entry.uid {
            return None;
        }
        entry.ready_since
    }

    pub fn is_ready(&self, machine: &Machine) -> bool {
        self.ready_since(machine).is_some()
    }

    /// Ready for at least `min_ready_seconds` as of `now`.
    pub fn is_available(&self, machine: &Machine, min_ready_seconds: u32, now: u64) -> bool {
        self.ready_since(machine)
            .is_some_and(|since| now.saturating_sub(since) >= u64::from(min_ready_seconds))
    }
}

/// Aggregate the observed status of `set` from its active machines.
///
/// Conditions are carried over from the current status; the caller adjusts
/// them before writing.
pub fn compute_status(
    set: &MachineSet,
    active: &[Machine],
    readiness: &NodeReadiness,
    now: u64,
) -> MachineSetStatus {
    let template_labels = &set.spec.template.metadata.labels;
    let min_ready = set.spec.min_ready_seconds;

    let fully_labeled = active
        .iter()
        .filter(|m| {
            template_labels
                .iter()
                .all(|(k, v)| m.metadata.labels.get(k) == Some(v))
        })
        .count();
    let ready = active.iter().filter(|m| readiness.is_ready(m)).count();
    let available = active
        .iter()
        .filter(|m| readiness.is_available(m, min_ready, now))
        .count();

    MachineSetStatus {
        replicas: count(active.len()),
        fully_labeled_replicas: count(fully_labeled),
        ready_replicas: count(ready),
        available_replicas: count(available),
        observed_generation: set.metadata.generation,
        conditions: set.status.conditions.clone(),
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Persist `status` on `set`.
///
/// Skips the write when nothing changed, since every write emits a change
/// event that would trigger another reconcile. On conflict the set is
/// reloaded and only the status is written again. A set that disappeared
/// in the meantime yields `Ok(None)`.
pub async fn write_status<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    status: &MachineSetStatus,
    attempts: u32,
) -> ControllerResult<Option<MachineSet>> {
    let key = set.metadata.key();
    retry_on_conflict(attempts, |attempt| {
        write_attempt(client, set, &key, status, attempt)
    })
    .await
}

async fn write_attempt<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    key: &ObjectKey,
    status: &MachineSetStatus,
    attempt: u32,
) -> ControllerResult<Option<MachineSet>> {
    let mut current = if attempt == 0 {
        set.clone()
    } else {
        match client.get_machine_set(key).await? {
            Some(current) => current,
            None => return Ok(None),
        }
    };

    if current.status == *status {
        debug!(set = %key, "status unchanged");
        return Ok(Some(current));
    }

    current.status = status.clone();
    match client.update_machine_set_status(&current).await {
        Ok(updated) => {
            debug!(
                set = %key,
                replicas = status.replicas,
                ready = status.ready_replicas,
                available = status.available_replicas,
                "status updated"
            );
            Ok(Some(updated))
        }
        Err(e) if e.is_not_found() => {
            debug!(set = %key, "set removed before status write");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
