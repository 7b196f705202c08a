//! Error types for the fleetset state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The caller's view of the object is stale (resource version or UID mismatch).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }

    /// Whether retrying the same operation later can succeed without a
    /// change to the request itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            StateError::Transaction(_)
            | StateError::Table(_)
            | StateError::Read(_)
            | StateError::Write(_)
            | StateError::NotFound(_)
            | StateError::AlreadyExists(_)
            | StateError::Conflict(_) => true,
            StateError::Open(_)
            | StateError::Serialize(_)
            | StateError::Deserialize(_)
            | StateError::Invalid(_) => false,
        }
    }
}
