//! Workflow instances: one execution of a template against one entity
//!
//! An instance is bound to exactly one `(source_module, source_id)` pair
//! for its whole life and beyond; a second instance for the same pair is
//! never allowed, even after the first completed or was cancelled.

use crate::{InstanceId, StageId, TemplateId, TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key/value bag owned by the calling module
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ── Source Reference ─────────────────────────────────────────────────

/// Identity of the business entity a workflow is attached to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub module: String,
    pub id: String,
}

impl SourceRef {
    pub fn new(module: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.module, self.id)
    }
}

// ── Instance Status ──────────────────────────────────────────────────

/// Lifecycle status of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
    Suspended,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Suspended => "SUSPENDED",
        }
    }

    /// Completed and cancelled instances never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A live execution of a template against one business entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub template_code: String,
    pub tenant_id: TenantId,
    pub current_stage_id: StageId,
    pub source: SourceRef,
    pub status: InstanceStatus,
    pub started_by: UserId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; incremented by the store on every write
    pub version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl WorkflowInstance {
    pub fn new(
        template_id: TemplateId,
        template_code: impl Into<String>,
        tenant_id: TenantId,
        current_stage_id: StageId,
        source: SourceRef,
        started_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            template_id,
            template_code: template_code.into(),
            tenant_id,
            current_stage_id,
            source,
            status: InstanceStatus::Active,
            started_by,
            started_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new stage, completing the instance when the stage is final
    pub fn enter_stage(&mut self, stage_id: StageId, is_final: bool, at: DateTime<Utc>) {
        self.current_stage_id = stage_id;
        if is_final {
            self.status = InstanceStatus::Completed;
            self.completed_at = Some(at);
        }
        self.updated_at = at;
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) {
        self.status = InstanceStatus::Cancelled;
        self.completed_at = Some(at);
        self.updated_at = at;
    }

    pub fn suspend(&mut self, by: &UserId, reason: Option<&str>, at: DateTime<Utc>) {
        self.status = InstanceStatus::Suspended;
        self.metadata.insert(
            "suspension".to_string(),
            serde_json::json!({
                "suspended_by": by,
                "suspended_at": at,
                "reason": reason,
            }),
        );
        self.updated_at = at;
    }

    pub fn resume(&mut self, by: &UserId, at: DateTime<Utc>) {
        self.status = InstanceStatus::Active;
        let mut record = self
            .metadata
            .remove("suspension")
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = record.as_object_mut() {
            map.insert("resumed_by".to_string(), serde_json::json!(by));
            map.insert("resumed_at".to_string(), serde_json::json!(at));
        }
        self.metadata
            .entry("suspensions".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(serde_json::Value::Array(log)) = self.metadata.get_mut("suspensions") {
            log.push(record);
        }
        self.updated_at = at;
    }

    /// Seconds from start to completion, if completed
    pub fn completion_secs(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_seconds())
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance() -> WorkflowInstance {
        WorkflowInstance::new(
            TemplateId::new("tpl"),
            "expense_approval",
            TenantId::new("t1"),
            StageId::new("pending"),
            SourceRef::new("EXPENSE", "77"),
            UserId::new("alice"),
        )
    }

    #[test]
    fn test_new_instance_is_active() {
        let inst = make_instance();
        assert!(inst.is_active());
        assert!(!inst.is_terminal());
        assert_eq!(inst.source.to_string(), "EXPENSE/77");
    }

    #[test]
    fn test_enter_final_stage_completes() {
        let mut inst = make_instance();
        let now = Utc::now();
        inst.enter_stage(StageId::new("review"), false, now);
        assert!(inst.is_active());
        assert!(inst.completed_at.is_none());

        inst.enter_stage(StageId::new("approved"), true, now);
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert_eq!(inst.completed_at, Some(now));
        assert_eq!(inst.completion_secs(), Some((now - inst.started_at).num_seconds()));
    }

    #[test]
    fn test_suspend_resume_metadata() {
        let mut inst = make_instance();
        let by = UserId::new("boss");
        inst.suspend(&by, Some("audit"), Utc::now());
        assert_eq!(inst.status, InstanceStatus::Suspended);
        assert_eq!(inst.metadata["suspension"]["reason"], "audit");

        inst.resume(&by, Utc::now());
        assert!(inst.is_active());
        assert!(!inst.metadata.contains_key("suspension"));
        let log = inst.metadata["suspensions"].as_array().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["resumed_by"], "boss");
        assert_eq!(log[0]["reason"], "audit");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&InstanceStatus::Suspended).unwrap();
        assert_eq!(json, "\"SUSPENDED\"");
        assert!(InstanceStatus::Cancelled.is_terminal());
    }
}
