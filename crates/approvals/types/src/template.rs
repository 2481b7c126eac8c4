//! Workflow templates and their stages
//!
//! A template is the authored graph. Stages are kept densely numbered
//! (`sequence` 0..n with no gaps) and at most one of them is initial;
//! both invariants are maintained by the stage graph manager and
//! re-checked by the store on every graph commit.

use crate::{StageId, TemplateId, TenantId, UserId, WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Workflow Template ────────────────────────────────────────────────

/// The authored definition of a workflow's stage graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub tenant_id: TenantId,
    /// Unique per tenant among non-deleted templates
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub is_active: bool,
    pub is_default: bool,
    /// Bumped on every write to the row or its graph; writes compare-and-swap on it
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn new(tenant_id: TenantId, code: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::generate(),
            tenant_id,
            code: code.into(),
            name: name.into(),
            description: String::new(),
            is_active: true,
            is_default: false,
            revision: 0,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Active and not soft-deleted
    pub fn is_usable(&self) -> bool {
        self.is_active && !self.is_deleted()
    }
}

// ── Assignee Policy ──────────────────────────────────────────────────

/// Flat assignee type as stored by authoring tools
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssigneeType {
    SpecificUser,
    DirectSupervisor,
    Department,
    Role,
}

/// Who receives the task when an instance enters a stage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssigneePolicy {
    /// Nothing configured; the task orchestrator falls back to the
    /// performer's direct supervisor
    #[default]
    None,
    SpecificUser { user_id: UserId },
    DirectSupervisor,
    Department { department_id: String },
    Role { role_id: String },
}

impl AssigneePolicy {
    /// Build a policy from the flat `(assignee_type, assignee_id)` pair.
    ///
    /// Every type other than `DIRECT_SUPERVISOR` needs a non-empty id.
    pub fn from_parts(
        assignee_type: Option<AssigneeType>,
        assignee_id: Option<&str>,
    ) -> WorkflowResult<Self> {
        let id = assignee_id.map(str::trim).filter(|s| !s.is_empty());
        let require = |kind: &str| {
            id.map(str::to_string).ok_or_else(|| {
                WorkflowError::InvalidDefinition(format!("assignee type {kind} requires an assignee id"))
            })
        };
        Ok(match assignee_type {
            None => Self::None,
            Some(AssigneeType::DirectSupervisor) => Self::DirectSupervisor,
            Some(AssigneeType::SpecificUser) => Self::SpecificUser {
                user_id: UserId::new(require("SPECIFIC_USER")?),
            },
            Some(AssigneeType::Department) => Self::Department {
                department_id: require("DEPARTMENT")?,
            },
            Some(AssigneeType::Role) => Self::Role {
                role_id: require("ROLE")?,
            },
        })
    }

    /// Re-check a policy that was constructed directly
    pub fn validate(&self) -> WorkflowResult<()> {
        let blank = match self {
            Self::SpecificUser { user_id } => user_id.as_str().trim().is_empty(),
            Self::Department { department_id } => department_id.trim().is_empty(),
            Self::Role { role_id } => role_id.trim().is_empty(),
            Self::None | Self::DirectSupervisor => false,
        };
        if blank {
            return Err(WorkflowError::InvalidDefinition(format!(
                "assignee type {:?} requires an assignee id",
                self.assignee_type()
            )));
        }
        Ok(())
    }

    pub fn assignee_type(&self) -> Option<AssigneeType> {
        match self {
            Self::None => None,
            Self::SpecificUser { .. } => Some(AssigneeType::SpecificUser),
            Self::DirectSupervisor => Some(AssigneeType::DirectSupervisor),
            Self::Department { .. } => Some(AssigneeType::Department),
            Self::Role { .. } => Some(AssigneeType::Role),
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::None)
    }
}

// ── Stage ────────────────────────────────────────────────────────────

/// One node in the template graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub template_id: TemplateId,
    /// Unique within the template
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Dense, 0-based position within the template
    pub sequence: u32,
    pub is_initial: bool,
    pub is_final: bool,
    #[serde(default)]
    pub assignee: AssigneePolicy,
}

impl Stage {
    pub fn new(template_id: TemplateId, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: StageId::generate(),
            template_id,
            key: key.into(),
            name: name.into(),
            color: None,
            sequence: 0,
            is_initial: false,
            is_final: false,
            assignee: AssigneePolicy::None,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_assignee(mut self, assignee: AssigneePolicy) -> Self {
        self.assignee = assignee;
        self
    }
}
