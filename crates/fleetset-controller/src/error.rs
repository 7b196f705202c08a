//! Controller error types.

use std::fmt;

use thiserror::Error;

use fleetset_state::{ObjectKey, SelectorError, StateError};

/// Errors that can occur during a reconcile cycle.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("invalid machine set: {0}")]
    Validation(#[from] ValidationError),

    /// Some operations of a concurrent batch failed; the rest went through.
    #[error("{operation} failed for {} machine(s): {}", failures.len(), failures.join("; "))]
    Batch {
        operation: BatchOperation,
        failures: Vec<String>,
    },
}

pub type ControllerResult<T> = Result<T, ControllerError>;

impl ControllerError {
    pub fn not_found(kind: &'static str, key: &ObjectKey) -> Self {
        ControllerError::NotFound {
            kind,
            key: key.clone(),
        }
    }

    /// Whether another cycle can succeed without the set's spec changing.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::State(e) => e.is_retryable(),
            ControllerError::NotFound { .. } | ControllerError::Batch { .. } => true,
            ControllerError::Validation(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::State(e) if e.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::State(e) => e.is_not_found(),
            ControllerError::NotFound { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    Adopt,
    Create,
    Delete,
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOperation::Adopt => "adopt",
            BatchOperation::Create => "create",
            BatchOperation::Delete => "delete",
        })
    }
}

/// Reasons a machine set's spec cannot be acted on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("replicas must not be negative, got {0}")]
    NegativeReplicas(i32),

    #[error("selector does not match the template labels")]
    TemplateMismatch,
}

impl ValidationError {
    /// Machine-readable reason recorded on the `SpecValid` condition.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Selector(_) => "InvalidSelector",
            ValidationError::NegativeReplicas(_) => "InvalidReplicas",
            ValidationError::TemplateMismatch => "SelectorMismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ControllerError::State(StateError::Conflict("rv".into())).is_retryable());
        assert!(ControllerError::State(StateError::Conflict("rv".into())).is_conflict());
        assert!(!ControllerError::State(StateError::Invalid("x".into())).is_retryable());
        assert!(!ControllerError::Validation(ValidationError::NegativeReplicas(-1)).is_retryable());
        assert!(
            ControllerError::Batch {
                operation: BatchOperation::Create,
                failures: vec!["boom".into()],
            }
            .is_retryable()
        );
    }

    #[test]
    fn batch_error_lists_failures() {
        let err = ControllerError::Batch {
            operation: BatchOperation::Delete,
            failures: vec!["a: gone".into(), "b: busy".into()],
        };
        assert_eq!(err.to_string(), "delete failed for 2 machine(s): a: gone; b: busy");
    }

    #[test]
    fn not_found_covers_both_sources() {
        let key = ObjectKey::new("ns", "m");
        assert!(ControllerError::not_found("Machine", &key).is_not_found());
        assert!(ControllerError::State(StateError::NotFound("m".into())).is_not_found());
        assert!(!ControllerError::State(StateError::Write("disk".into())).is_not_found());
    }

    #[test]
    fn validation_reasons() {
        assert_eq!(
            ValidationError::Selector(SelectorError::EmptyKey).reason(),
            "InvalidSelector"
        );
        assert_eq!(ValidationError::NegativeReplicas(-2).reason(), "InvalidReplicas");
        assert_eq!(ValidationError::TemplateMismatch.reason(), "SelectorMismatch");
    }
}
