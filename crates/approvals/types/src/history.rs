//! History: the append-only audit trail of an instance
//!
//! Entries are never mutated or deleted. Sequencing and hash chaining are
//! assigned by the store when an entry is appended.

use crate::{HistoryEntryId, InstanceId, Metadata, StageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to the instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    WorkflowStarted,
    /// A transition was performed; carries the matched action key
    Transition(String),
    WorkflowCancelled,
    WorkflowSuspended,
    WorkflowResumed,
}

impl HistoryAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::Transition(action) => action,
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
            Self::WorkflowSuspended => "WORKFLOW_SUSPENDED",
            Self::WorkflowResumed => "WORKFLOW_RESUMED",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History append payload. Sequence and hashes are assigned by storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryAppend {
    pub instance_id: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stage_id: Option<StageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stage_id: Option<StageId>,
    pub action: HistoryAction,
    pub performed_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub performed_at: DateTime<Utc>,
}

impl HistoryAppend {
    pub fn new(
        instance_id: InstanceId,
        action: HistoryAction,
        performed_by: UserId,
        performed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            from_stage_id: None,
            to_stage_id: None,
            action,
            performed_by,
            remarks: None,
            metadata: Metadata::new(),
            performed_at,
        }
    }

    pub fn between(mut self, from: Option<StageId>, to: Option<StageId>) -> Self {
        self.from_stage_id = from;
        self.to_stage_id = to;
        self
    }

    pub fn with_remarks(mut self, remarks: Option<String>) -> Self {
        self.remarks = remarks;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Persistent, tamper-evident history record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub instance_id: InstanceId,
    /// 1-based position within the instance's trail
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stage_id: Option<StageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stage_id: Option<StageId>,
    pub action: HistoryAction,
    pub performed_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub performed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl HistoryEntry {
    /// The append payload this record was created from
    pub fn to_append(&self) -> HistoryAppend {
        HistoryAppend {
            instance_id: self.instance_id.clone(),
            from_stage_id: self.from_stage_id.clone(),
            to_stage_id: self.to_stage_id.clone(),
            action: self.action.clone(),
            performed_by: self.performed_by.clone(),
            remarks: self.remarks.clone(),
            metadata: self.metadata.clone(),
            performed_at: self.performed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(HistoryAction::WorkflowStarted.as_str(), "WORKFLOW_STARTED");
        assert_eq!(HistoryAction::WorkflowCancelled.to_string(), "WORKFLOW_CANCELLED");
        assert_eq!(HistoryAction::Transition("Approve".into()).as_str(), "Approve");
    }

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_value(HistoryAction::Transition("Reject".into())).unwrap();
        assert_eq!(json["kind"], "TRANSITION");
        assert_eq!(json["action"], "Reject");
        let back: HistoryAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, HistoryAction::Transition("Reject".into()));
    }
}
