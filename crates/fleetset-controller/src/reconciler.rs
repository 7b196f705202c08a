//! Reconciler — one stateless pass over a single machine set.
//!
//! Each call re-derives every decision from freshly read state, so running
//! it twice, concurrently, or after a crash mid-pass is safe. The reconciler
//! is the only place that decides whether a failure is retried.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use fleetset_state::{
    Condition, ConditionStatus, MachineSet, ObjectKey, REPLICA_FAILURE, SPEC_VALID,
    remove_condition, set_condition,
};

use crate::client::FleetClient;
use crate::config::ControllerConfig;
use crate::error::{BatchOperation, ControllerError, ControllerResult, ValidationError};
use crate::scaling::{converge, stamped_labels};
use crate::status::{NodeReadiness, compute_status, write_status};

/// What the caller should do with the key after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged, or the set is gone; wait for the next change event.
    Done,
    /// The set's spec cannot be acted on; wait for it to be edited.
    AwaitChange,
    /// Reconcile again after a fixed delay.
    Requeue(Duration),
    /// Reconcile again after the key's exponential backoff.
    Backoff,
}

pub struct Reconciler<C> {
    client: Arc<C>,
    config: ControllerConfig,
}

impl<C> Clone for Reconciler<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
        }
    }
}

impl<C: FleetClient> Reconciler<C> {
    pub fn new(client: Arc<C>, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Bring the set at `key` one step closer to its desired state and
    /// record what was observed.
    pub async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let Some(set) = self.client.get_machine_set(key).await? else {
            debug!(set = %key, "machine set not found");
            return Ok(Action::Done);
        };
        if set.metadata.is_terminating() {
            debug!(set = %key, "machine set is terminating");
            return Ok(Action::Done);
        }

        let now = epoch_secs();
        if let Err(invalid) = validate(&set) {
            warn!(set = %key, error = %invalid, "machine set spec is invalid");
            self.record_invalid(&set, &invalid, now).await?;
            return Ok(Action::AwaitChange);
        }

        let readiness = NodeReadiness::from_nodes(self.client.list_nodes().await?);
        let convergence = converge(self.client(), &set, &readiness, &self.config).await?;

        let mut status = compute_status(&set, &convergence.active, &readiness, now);
        set_condition(
            &mut status.conditions,
            Condition::new(SPEC_VALID, ConditionStatus::True),
            now,
        );
        match &convergence.error {
            None => remove_condition(&mut status.conditions, REPLICA_FAILURE),
            Some(err) => {
                if let Some(reason) = replica_failure_reason(err) {
                    set_condition(
                        &mut status.conditions,
                        Condition::new(REPLICA_FAILURE, ConditionStatus::True)
                            .with_reason(reason, err.to_string()),
                        now,
                    );
                }
            }
        }

        write_status(self.client(), &set, &status, self.config.conflict_retries).await?;
        info!(
            set = %key,
            replicas = status.replicas,
            ready = status.ready_replicas,
            available = status.available_replicas,
            adopted = convergence.adopted,
            created = convergence.created,
            deleted = convergence.deleted,
            "reconciled"
        );

        if let Some(e) = convergence.error {
            return Err(e);
        }
        if set.spec.min_ready_seconds > 0 && status.ready_replicas > status.available_replicas {
            return Ok(Action::Requeue(Duration::from_secs(u64::from(
                set.spec.min_ready_seconds,
            ))));
        }
        Ok(Action::Done)
    }

    /// Map a failed reconcile to the next step for its key.
    pub fn error_policy(&self, key: &ObjectKey, err: &ControllerError) -> Action {
        if err.is_retryable() {
            warn!(set = %key, error = %err, "reconcile failed, backing off");
            Action::Backoff
        } else {
            error!(set = %key, error = %err, "reconcile failed permanently");
            Action::AwaitChange
        }
    }

    async fn record_invalid(
        &self,
        set: &MachineSet,
        invalid: &ValidationError,
        now: u64,
    ) -> ControllerResult<()> {
        let mut status = set.status.clone();
        status.observed_generation = set.metadata.generation;
        set_condition(
            &mut status.conditions,
            Condition::new(SPEC_VALID, ConditionStatus::False)
                .with_reason(invalid.reason(), invalid.to_string()),
            now,
        );
        write_status(self.client(), set, &status, self.config.conflict_retries).await?;
        Ok(())
    }
}

/// Reason for a `ReplicaFailure` condition. A failed adoption leaves the
/// membership unknown, so the previous verdict is kept.
fn replica_failure_reason(err: &ControllerError) -> Option<&'static str> {
    match err {
        ControllerError::Batch {
            operation: BatchOperation::Create,
            ..
        } => Some("FailedCreate"),
        ControllerError::Batch {
            operation: BatchOperation::Delete,
            ..
        } => Some("FailedDelete"),
        _ => None,
    }
}

/// Check that `set` can be reconciled at all.
///
/// The selector must be well formed, the replica count non-negative, and
/// the selector must match the labels stamped on new machines; otherwise
/// every created machine would immediately fall out of the set.
pub fn validate(set: &MachineSet) -> Result<(), ValidationError> {
    set.spec.selector.validate()?;
    if let Some(replicas) = set.spec.replicas
        && replicas < 0
    {
        return Err(ValidationError::NegativeReplicas(replicas));
    }
    if !set.spec.selector.matches(&stamped_labels(set)) {
        return Err(ValidationError::TemplateMismatch);
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
