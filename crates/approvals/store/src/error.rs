use approvals_types::WorkflowError;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale write: {0}")]
    StaleWrite(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) | StoreError::StaleWrite(msg) => WorkflowError::Conflict(msg),
            StoreError::InvariantViolation(msg) => WorkflowError::IllegalState(msg),
            StoreError::InvalidInput(msg) => WorkflowError::InvalidDefinition(msg),
            other => WorkflowError::Storage(other.to_string()),
        }
    }
}
