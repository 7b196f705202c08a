//! Scaling engine — converges a set's membership toward its replica count.
//!
//! One call to [`converge`] lists the machines in the set's namespace,
//! keeps those that belong to the set (adopting orphans on the way), and
//! then creates or deletes machines to close the gap. Creates and deletes
//! are issued concurrently; individual failures are collected and reported
//! together while the successful part of the batch stands.

use std::cmp::Ordering;
use std::collections::HashSet;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use fleetset_state::{
    DELETE_MACHINE_ANNOTATION, DeletePolicy, Labels, Machine, MachineSet, SET_NAME_LABEL, StateResult,
};

use crate::client::FleetClient;
use crate::config::ControllerConfig;
use crate::error::{BatchOperation, ControllerError, ControllerResult, ValidationError};
use crate::ownership::{Ownership, adopt_orphan, classify, controller_ref_for, should_exclude};
use crate::status::NodeReadiness;

/// Outcome of one convergence pass.
#[derive(Debug, Default)]
pub struct Convergence {
    /// Best-known membership after this pass: owned, non-terminating,
    /// selector-matching machines.
    pub active: Vec<Machine>,
    pub adopted: usize,
    pub created: usize,
    pub deleted: usize,
    /// Aggregated failures of the batch that ran, if any.
    pub error: Option<ControllerError>,
}

/// Drive `set`'s membership toward its desired replica count.
///
/// Returns `Err` only when the membership could not be read at all. Partial
/// failures are reported in [`Convergence::error`] next to the membership
/// that was actually achieved. If any orphan could not be adopted the
/// membership is uncertain, so no machines are created or deleted.
pub async fn converge<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    readiness: &NodeReadiness,
    config: &ControllerConfig,
) -> ControllerResult<Convergence> {
    let key = set.metadata.key();
    let replicas = set.desired_replicas();
    let desired =
        usize::try_from(replicas).map_err(|_| ValidationError::NegativeReplicas(replicas))?;

    let machines = client.list_machines(Some(&set.metadata.namespace)).await?;
    let (active, orphans): (Vec<Machine>, Vec<Machine>) = machines
        .into_iter()
        .filter(|m| set.spec.selector.matches(&m.metadata.labels) && !should_exclude(set, m))
        .partition(|m| classify(set, m) == Ownership::Owned);

    let mut outcome = Convergence {
        active,
        ..Default::default()
    };

    if !orphans.is_empty() {
        let results = join_all(
            orphans
                .iter()
                .map(|m| adopt_orphan(client, set, m, config.conflict_retries)),
        )
        .await;

        let mut failures = Vec::new();
        for (orphan, result) in orphans.iter().zip(results) {
            match result {
                Ok(Some(machine)) => {
                    outcome.adopted += 1;
                    outcome.active.push(machine);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(set = %key, machine = %orphan.metadata.name, error = %e, "adoption failed");
                    failures.push(format!("{}: {e}", orphan.metadata.name));
                }
            }
        }
        if !failures.is_empty() {
            outcome.error = Some(ControllerError::Batch {
                operation: BatchOperation::Adopt,
                failures,
            });
            return Ok(outcome);
        }
    }

    let current = outcome.active.len();
    match desired.cmp(&current) {
        Ordering::Greater => scale_up(client, set, desired - current, &mut outcome).await,
        Ordering::Less => {
            scale_down(client, set, readiness, current - desired, &mut outcome).await
        }
        Ordering::Equal => debug!(set = %key, replicas = current, "membership converged"),
    }
    Ok(outcome)
}

async fn scale_up<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    count: usize,
    outcome: &mut Convergence,
) {
    let key = set.metadata.key();
    info!(set = %key, count, "creating machines");

    let template = new_machine(set);
    let results = join_all((0..count).map(|_| client.create_machine(&template))).await;

    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(machine) => {
                debug!(set = %key, machine = %machine.metadata.name, "machine created");
                outcome.created += 1;
                outcome.active.push(machine);
            }
            Err(e) => {
                warn!(set = %key, error = %e, "machine creation failed");
                failures.push(e.to_string());
            }
        }
    }
    if !failures.is_empty() {
        outcome.error = Some(ControllerError::Batch {
            operation: BatchOperation::Create,
            failures,
        });
    }
}

async fn scale_down<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    readiness: &NodeReadiness,
    count: usize,
    outcome: &mut Convergence,
) {
    let key = set.metadata.key();
    info!(set = %key, count, "deleting machines");

    let victims = select_victims(&outcome.active, readiness, set.spec.delete_policy, count);
    let results = join_all(victims.iter().map(|m| delete_victim(client, m))).await;

    let mut removed = HashSet::new();
    let mut failures = Vec::new();
    for (victim, result) in victims.iter().zip(results) {
        match result {
            Ok(()) => {
                debug!(set = %key, machine = %victim.metadata.name, "machine deleted");
                removed.insert(victim.metadata.uid.clone());
            }
            Err(e) => {
                warn!(set = %key, machine = %victim.metadata.name, error = %e, "machine deletion failed");
                failures.push(format!("{}: {e}", victim.metadata.name));
            }
        }
    }

    outcome.deleted = removed.len();
    outcome.active.retain(|m| !removed.contains(&m.metadata.uid));
    if !failures.is_empty() {
        outcome.error = Some(ControllerError::Batch {
            operation: BatchOperation::Delete,
            failures,
        });
    }
}

/// Delete one machine, pinned to its UID. An already-gone machine counts
/// as deleted.
async fn delete_victim<C: FleetClient>(client: &C, machine: &Machine) -> StateResult<()> {
    let key = machine.metadata.key();
    match client.delete_machine(&key, Some(&machine.metadata.uid)).await {
        Err(e) if e.is_not_found() => Ok(()),
        result => result,
    }
}

/// Pick `count` machines to delete, most expendable first.
///
/// Machines annotated with [`DELETE_MACHINE_ANNOTATION`] go first, then
/// machines without a ready node, then by creation time according to
/// `policy`. Names break the remaining ties so the choice is deterministic.
pub fn select_victims<'a>(
    active: &'a [Machine],
    readiness: &NodeReadiness,
    policy: DeletePolicy,
    count: usize,
) -> Vec<&'a Machine> {
    let unmarked = |m: &Machine| !m.metadata.annotations.contains_key(DELETE_MACHINE_ANNOTATION);

    let mut candidates: Vec<&Machine> = active.iter().collect();
    candidates.sort_by(|a, b| {
        unmarked(a)
            .cmp(&unmarked(b))
            .then_with(|| readiness.is_ready(a).cmp(&readiness.is_ready(b)))
            .then_with(|| {
                let (ta, tb) = (a.metadata.creation_timestamp, b.metadata.creation_timestamp);
                match policy {
                    DeletePolicy::Oldest => ta.cmp(&tb),
                    DeletePolicy::Newest => tb.cmp(&ta),
                }
            })
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    candidates.truncate(count);
    candidates
}

/// Labels every machine created for `set` carries: the template labels
/// plus [`SET_NAME_LABEL`].
pub fn stamped_labels(set: &MachineSet) -> Labels {
    let mut labels = set.spec.template.metadata.labels.clone();
    labels.insert(SET_NAME_LABEL.to_string(), set.metadata.name.clone());
    labels
}

/// A new machine stamped from `set`'s template, already controlled by `set`.
pub fn new_machine(set: &MachineSet) -> Machine {
    let template = &set.spec.template;
    let mut machine = Machine::new(&set.metadata.namespace, "");

    machine.metadata.generate_name = Some(format!("{}-", set.metadata.name));
    machine.metadata.labels = stamped_labels(set);
    machine.metadata.annotations = template.metadata.annotations.clone();
    machine.metadata.owner_references = vec![controller_ref_for(set)];
    machine.spec = template.spec.clone();
    machine
}
