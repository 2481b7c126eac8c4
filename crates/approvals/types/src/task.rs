//! Workflow tasks and the board cards they are tracked on
//!
//! A [`WorkflowTask`] binds one instance stage to one [`TaskCard`]. It is
//! open while `completed_at` is `None`; at most one task per instance is
//! open at any time.

use crate::{InstanceId, StageId, TaskCardId, TenantId, UserId, WorkflowTaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a task was closed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskClosure {
    /// The instance moved on from the task's stage
    Completed,
    /// The instance was cancelled
    Cancelled { reason: String },
}

/// Link entity: one instance, one stage, one task card
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: WorkflowTaskId,
    pub instance_id: InstanceId,
    pub stage_id: StageId,
    pub card_id: TaskCardId,
    pub assignee_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closure: Option<TaskClosure>,
}

impl WorkflowTask {
    pub fn new(
        instance_id: InstanceId,
        stage_id: StageId,
        card_id: TaskCardId,
        assignee_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WorkflowTaskId::generate(),
            instance_id,
            stage_id,
            card_id,
            assignee_id,
            created_at,
            completed_at: None,
            closure: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    pub fn close(&mut self, closure: TaskClosure, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.closure = Some(closure);
    }
}

/// A card on the work board representing "do something about this instance"
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskCard {
    pub id: TaskCardId,
    pub tenant_id: TenantId,
    pub title: String,
    pub description: String,
    /// Board column, e.g. `backlog` or `done`
    pub bucket: String,
    pub assignee_id: UserId,
    pub creator_id: UserId,
    /// Deduplicated, in insertion order
    pub watchers: Vec<UserId>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskCard {
    /// Add a watcher unless already present
    pub fn watch(&mut self, user: UserId) {
        if !self.watchers.contains(&user) {
            self.watchers.push(user);
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_at < now
    }
}
