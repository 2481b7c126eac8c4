//! Error types for the approval workflow layer

use crate::{InstanceId, InstanceStatus, StageId, TransitionId, WorkflowTaskId};

/// Coarse classification of a [`WorkflowError`], used by transports to pick
/// a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Forbidden,
    IllegalState,
    BadRequest,
    Internal,
}

/// The complete list of rule failures for one validation pass.
///
/// Never truncated: callers always see every failed rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, messages: I) {
        self.0.extend(messages);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` when empty, otherwise a [`WorkflowError::Validation`]
    pub fn into_result(self) -> WorkflowResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl From<Vec<String>> for ValidationErrors {
    fn from(messages: Vec<String>) -> Self {
        Self(messages)
    }
}

/// Errors that can occur in approval workflow operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // ── NotFound ─────────────────────────────────────────────────────
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(StageId),

    #[error("Transition not found: {0}")]
    TransitionNotFound(TransitionId),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Workflow task not found: {0}")]
    TaskNotFound(WorkflowTaskId),

    // ── Conflict ─────────────────────────────────────────────────────
    #[error("Template code '{code}' already exists for tenant '{tenant}'")]
    DuplicateTemplateCode { tenant: String, code: String },

    #[error("A workflow instance already exists for {module}/{source_id}")]
    DuplicateInstance { module: String, source_id: String },

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    // ── Validation ───────────────────────────────────────────────────
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    // ── Forbidden ────────────────────────────────────────────────────
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // ── IllegalState / BadRequest ────────────────────────────────────
    #[error("Invalid action '{action}' for current stage '{stage}'")]
    InvalidAction { action: String, stage: String },

    #[error("Workflow instance {instance_id} is {status}, expected {expected}")]
    WrongStatus {
        instance_id: InstanceId,
        status: InstanceStatus,
        expected: InstanceStatus,
    },

    #[error("Template '{0}' is inactive")]
    TemplateInactive(String),

    #[error("Template '{0}' has no initial stage")]
    NoInitialStage(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // ── Internal ─────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Directory error: {0}")]
    Directory(String),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TemplateNotFound(_)
            | Self::StageNotFound(_)
            | Self::TransitionNotFound(_)
            | Self::InstanceNotFound(_)
            | Self::TaskNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateTemplateCode { .. }
            | Self::DuplicateInstance { .. }
            | Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidDefinition(_) | Self::InvalidAction { .. } | Self::TemplateInactive(_) => {
                ErrorKind::BadRequest
            }
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::WrongStatus { .. } | Self::NoInitialStage(_) | Self::IllegalState(_) => {
                ErrorKind::IllegalState
            }
            Self::Storage(_) | Self::Directory(_) => ErrorKind::Internal,
        }
    }

    /// The validation messages, if this is a validation failure
    pub fn validation_messages(&self) -> Option<&[String]> {
        match self {
            Self::Validation(errors) => Some(errors.messages()),
            _ => None,
        }
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_join_all_messages() {
        let mut errors = ValidationErrors::new();
        errors.push("Remarks are required");
        errors.push("Amount 900 exceeds limit 500");
        let err = errors.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            "Validation failed: Remarks are required; Amount 900 exceeds limit 500"
        );
        assert_eq!(err.validation_messages().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_validation_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            WorkflowError::DuplicateInstance {
                module: "EXPENSE".into(),
                source_id: "77".into()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            WorkflowError::Forbidden("nope".into()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            WorkflowError::InvalidAction {
                action: "Fly".into(),
                stage: "PENDING".into()
            }
            .kind(),
            ErrorKind::BadRequest
        );
    }
}
