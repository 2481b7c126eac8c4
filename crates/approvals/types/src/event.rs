//! Lifecycle events emitted after a mutation commits
//!
//! Event names are a stable contract; see [`WorkflowEvent::name`].

use crate::{InstanceId, SourceRef, StageId, TaskCardId, UserId, WorkflowTaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub const EVENT_STARTED: &str = "workflow.started";
pub const EVENT_TRANSITIONED: &str = "workflow.transitioned";
pub const EVENT_CANCELLED: &str = "workflow.cancelled";
pub const EVENT_SUSPENDED: &str = "workflow.suspended";
pub const EVENT_RESUMED: &str = "workflow.resumed";
pub const EVENT_TASK_CREATED: &str = "workflow.task.created";
pub const EVENT_TASK_COMPLETED: &str = "workflow.task.completed";
pub const EVENT_TASK_REASSIGNED: &str = "workflow.task.reassigned";
pub const EVENT_SYNC_PREFIX: &str = "workflow.sync.";

/// Status mirrored onto the owning business entity after a stage change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub source_id: String,
    pub stage_key: String,
    pub stage_name: String,
    pub is_final: bool,
    pub instance_id: InstanceId,
}

/// An event emitted by the engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        instance_id: InstanceId,
        template_code: String,
        source: SourceRef,
        stage_key: String,
        at: DateTime<Utc>,
    },
    Transitioned {
        instance_id: InstanceId,
        source: SourceRef,
        action: String,
        from_stage_key: String,
        to_stage_key: String,
        performed_by: UserId,
        completed: bool,
        at: DateTime<Utc>,
    },
    Cancelled {
        instance_id: InstanceId,
        source: SourceRef,
        performed_by: UserId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Suspended {
        instance_id: InstanceId,
        source: SourceRef,
        performed_by: UserId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Resumed {
        instance_id: InstanceId,
        source: SourceRef,
        performed_by: UserId,
        at: DateTime<Utc>,
    },
    TaskCreated {
        task_id: WorkflowTaskId,
        card_id: TaskCardId,
        instance_id: InstanceId,
        stage_id: StageId,
        assignee_id: UserId,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: WorkflowTaskId,
        instance_id: InstanceId,
        cancelled: bool,
        at: DateTime<Utc>,
    },
    TaskReassigned {
        task_id: WorkflowTaskId,
        instance_id: InstanceId,
        previous_assignee: UserId,
        new_assignee: UserId,
        performed_by: UserId,
        at: DateTime<Utc>,
    },
    /// Per-module status sync, named `workflow.sync.<module>`
    Sync { module: String, payload: SyncPayload },
}

impl WorkflowEvent {
    /// The stable event name
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Self::Started { .. } => Cow::Borrowed(EVENT_STARTED),
            Self::Transitioned { .. } => Cow::Borrowed(EVENT_TRANSITIONED),
            Self::Cancelled { .. } => Cow::Borrowed(EVENT_CANCELLED),
            Self::Suspended { .. } => Cow::Borrowed(EVENT_SUSPENDED),
            Self::Resumed { .. } => Cow::Borrowed(EVENT_RESUMED),
            Self::TaskCreated { .. } => Cow::Borrowed(EVENT_TASK_CREATED),
            Self::TaskCompleted { .. } => Cow::Borrowed(EVENT_TASK_COMPLETED),
            Self::TaskReassigned { .. } => Cow::Borrowed(EVENT_TASK_REASSIGNED),
            Self::Sync { module, .. } => Cow::Owned(format!("{EVENT_SYNC_PREFIX}{module}")),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Started { instance_id, .. }
            | Self::Transitioned { instance_id, .. }
            | Self::Cancelled { instance_id, .. }
            | Self::Suspended { instance_id, .. }
            | Self::Resumed { instance_id, .. }
            | Self::TaskCreated { instance_id, .. }
            | Self::TaskCompleted { instance_id, .. }
            | Self::TaskReassigned { instance_id, .. } => instance_id,
            Self::Sync { payload, .. } => &payload.instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let id = InstanceId::new("i-1");
        let sync = WorkflowEvent::Sync {
            module: "EXPENSE".into(),
            payload: SyncPayload {
                source_id: "77".into(),
                stage_key: "REJECTED".into(),
                stage_name: "Rejected".into(),
                is_final: true,
                instance_id: id.clone(),
            },
        };
        assert_eq!(sync.name(), "workflow.sync.EXPENSE");
        assert_eq!(sync.instance_id(), &id);

        let resumed = WorkflowEvent::Resumed {
            instance_id: id,
            source: SourceRef::new("EXPENSE", "77"),
            performed_by: UserId::new("boss"),
            at: Utc::now(),
        };
        assert_eq!(resumed.name(), "workflow.resumed");
    }
}
