//! Instance query service: the read side
//!
//! Reads the store directly and never writes. Permission checks reuse the
//! engine's [`PermissionPolicy`] so that `available_actions` agrees with
//! what a transition would allow.

use crate::config::QueryConfig;
use crate::validator::PermissionPolicy;
use approvals_store::{hash, InstanceFilter, Page, QueryWindow, WorkflowStore};
use approvals_types::{
    DialogSpec, HistoryAction, InstanceId, InstanceStatus, Metadata, RemarksRequirement,
    SourceRef, Stage, StageId, TaskCard, TransitionId, UserId, WorkflowError, WorkflowInstance,
    WorkflowResult, WorkflowTask,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

const MAX_THRESHOLD_HOURS: u64 = 876_000;

// ── Views ────────────────────────────────────────────────────────────

/// Compact reference to a stage
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageRef {
    pub id: StageId,
    pub key: String,
    pub name: String,
    pub is_final: bool,
}

impl From<&Stage> for StageRef {
    fn from(stage: &Stage) -> Self {
        Self {
            id: stage.id.clone(),
            key: stage.key.clone(),
            name: stage.name.clone(),
            is_final: stage.is_final,
        }
    }
}

/// A history entry with its stages resolved
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub sequence: u64,
    pub action: HistoryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<StageRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<StageRef>,
    pub performed_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    pub metadata: Metadata,
    pub performed_at: DateTime<Utc>,
}

/// An action a user could perform right now
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AvailableAction {
    pub transition_id: TransitionId,
    pub button_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_type: Option<String>,
    /// `None` for informational actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stage: Option<StageRef>,
    pub remarks: RemarksRequirement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog: Option<DialogSpec>,
}

/// A task with its board card
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskView {
    pub task: WorkflowTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<TaskCard>,
}

/// An active instance running longer than the threshold
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverdueInstance {
    pub instance_id: InstanceId,
    pub source: SourceRef,
    pub template_code: String,
    pub current_stage_id: StageId,
    pub started_at: DateTime<Utc>,
    pub elapsed_hours: i64,
}

/// Aggregate figures over a filtered set of instances
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkflowStatistics {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub suspended: usize,
    /// Mean over completed instances; `None` if there are none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_completion_secs: Option<f64>,
    pub overdue: usize,
}

// ── Service ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct InstanceQueryService {
    store: Arc<dyn WorkflowStore>,
    permissions: PermissionPolicy,
    config: QueryConfig,
}

impl InstanceQueryService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        permissions: PermissionPolicy,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            permissions,
            config,
        }
    }

    pub fn get(&self, id: &InstanceId) -> WorkflowResult<WorkflowInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.to_string()))
    }

    pub fn by_source(&self, source: &SourceRef) -> WorkflowResult<WorkflowInstance> {
        self.store
            .find_instance_by_source(source)?
            .ok_or_else(|| WorkflowError::InstanceNotFound(source.to_string()))
    }

    /// Filtered listing, newest first. Without a window the configured
    /// page size applies.
    pub fn list(
        &self,
        filter: &InstanceFilter,
        window: Option<QueryWindow>,
    ) -> WorkflowResult<Page<WorkflowInstance>> {
        let window =
            window.unwrap_or_else(|| QueryWindow::new(self.config.default_page_size, 0));
        Ok(self.store.list_instances(filter, window)?)
    }

    pub fn timeline(&self, id: &InstanceId) -> WorkflowResult<Vec<TimelineEntry>> {
        self.get(id)?;
        let mut stages: HashMap<StageId, Option<StageRef>> = HashMap::new();
        let mut resolve = |id: &Option<StageId>| -> WorkflowResult<Option<StageRef>> {
            let Some(id) = id else {
                return Ok(None);
            };
            if let Some(cached) = stages.get(id) {
                return Ok(cached.clone());
            }
            let stage = self.store.get_stage(id)?.as_ref().map(StageRef::from);
            stages.insert(id.clone(), stage.clone());
            Ok(stage)
        };

        self.store
            .history_for(id)?
            .into_iter()
            .map(|entry| -> WorkflowResult<TimelineEntry> {
                Ok(TimelineEntry {
                    from: resolve(&entry.from_stage_id)?,
                    to: resolve(&entry.to_stage_id)?,
                    sequence: entry.sequence,
                    action: entry.action,
                    performed_by: entry.performed_by,
                    remarks: entry.remarks,
                    metadata: entry.metadata,
                    performed_at: entry.performed_at,
                })
            })
            .collect()
    }

    /// Outgoing actions of the current stage that `user` passes the
    /// permission check for. Empty unless the instance is active.
    pub fn available_actions(
        &self,
        id: &InstanceId,
        user: &UserId,
    ) -> WorkflowResult<Vec<AvailableAction>> {
        let instance = self.get(id)?;
        if instance.status != InstanceStatus::Active {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        for transition in self.store.transitions_from(&instance.current_stage_id)? {
            if !self
                .permissions
                .permits(user, &transition.conditions.permissions)?
            {
                continue;
            }
            let to_stage = match &transition.to_stage_id {
                Some(stage_id) => self.store.get_stage(stage_id)?.as_ref().map(StageRef::from),
                None => None,
            };
            actions.push(AvailableAction {
                transition_id: transition.id,
                button_name: transition.button_name,
                condition_type: transition.condition_type,
                to_stage,
                remarks: transition.conditions.remarks,
                dialog: transition.conditions.dialog,
            });
        }
        Ok(actions)
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub fn tasks_for_instance(&self, id: &InstanceId) -> WorkflowResult<Vec<TaskView>> {
        let tasks = self.store.tasks_for_instance(id)?;
        self.with_cards(tasks)
    }

    /// Open tasks assigned to `user`
    pub fn pending_for_user(&self, user: &UserId) -> WorkflowResult<Vec<TaskView>> {
        let tasks = self.store.open_tasks(Some(user))?;
        self.with_cards(tasks)
    }

    /// Open tasks whose card is past due
    pub fn overdue_tasks(&self, now: DateTime<Utc>) -> WorkflowResult<Vec<TaskView>> {
        let views = self.with_cards(self.store.open_tasks(None)?)?;
        Ok(views
            .into_iter()
            .filter(|v| v.card.as_ref().is_some_and(|c| c.is_overdue(now)))
            .collect())
    }

    fn with_cards(&self, tasks: Vec<WorkflowTask>) -> WorkflowResult<Vec<TaskView>> {
        tasks
            .into_iter()
            .map(|task| -> WorkflowResult<TaskView> {
                let card = self.store.get_card(&task.card_id)?;
                Ok(TaskView { task, card })
            })
            .collect()
    }

    // ── Reports ──────────────────────────────────────────────────────

    /// Active instances started more than `threshold_hours` ago, oldest
    /// first. Defaults to the configured threshold.
    pub fn overdue(
        &self,
        threshold_hours: Option<u64>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<OverdueInstance>> {
        let threshold = self.threshold(threshold_hours);
        let filter = InstanceFilter {
            status: Some(InstanceStatus::Active),
            ..Default::default()
        };
        let mut overdue: Vec<_> = self
            .store
            .list_instances(&filter, QueryWindow::all())?
            .items
            .into_iter()
            .filter(|i| now - i.started_at > threshold)
            .map(|i| OverdueInstance {
                elapsed_hours: (now - i.started_at).num_hours(),
                instance_id: i.id,
                source: i.source,
                template_code: i.template_code,
                current_stage_id: i.current_stage_id,
                started_at: i.started_at,
            })
            .collect();
        overdue.sort_by_key(|o| o.started_at);
        Ok(overdue)
    }

    pub fn statistics(
        &self,
        filter: &InstanceFilter,
        now: DateTime<Utc>,
    ) -> WorkflowResult<WorkflowStatistics> {
        let threshold = self.threshold(None);
        let instances = self.store.list_instances(filter, QueryWindow::all())?.items;

        let mut stats = WorkflowStatistics {
            total: instances.len(),
            ..Default::default()
        };
        let mut completion_total = 0i64;
        let mut completion_count = 0usize;
        for instance in &instances {
            match instance.status {
                InstanceStatus::Active => {
                    stats.active += 1;
                    if now - instance.started_at > threshold {
                        stats.overdue += 1;
                    }
                }
                InstanceStatus::Completed => {
                    stats.completed += 1;
                    if let Some(secs) = instance.completion_secs() {
                        completion_total += secs;
                        completion_count += 1;
                    }
                }
                InstanceStatus::Cancelled => stats.cancelled += 1,
                InstanceStatus::Suspended => stats.suspended += 1,
            }
        }
        if completion_count > 0 {
            stats.avg_completion_secs = Some(completion_total as f64 / completion_count as f64);
        }
        Ok(stats)
    }

    /// Recompute the history hash chain. Returns the sequence of the first
    /// entry that does not verify, or `None` if the trail is intact.
    pub fn verify_history(&self, id: &InstanceId) -> WorkflowResult<Option<u64>> {
        self.get(id)?;
        let entries = self.store.history_for(id)?;
        let broken = hash::verify_chain(&entries)?;
        if let Some(sequence) = broken {
            tracing::warn!(instance_id = %id, sequence, "History chain does not verify");
        }
        Ok(broken)
    }

    fn threshold(&self, hours: Option<u64>) -> Duration {
        let hours = hours
            .unwrap_or(self.config.overdue_threshold_hours)
            .min(MAX_THRESHOLD_HOURS);
        Duration::hours(hours as i64)
    }
}

impl std::fmt::Debug for InstanceQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceQueryService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
