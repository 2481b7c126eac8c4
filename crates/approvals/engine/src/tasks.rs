//! Task orchestrator: the unit of work attached to an instance's stage
//!
//! The orchestrator plans task writes; it never commits them. The engine
//! folds the planned [`WorkflowTask`]s and [`TaskCard`]s into the same unit
//! of work as the instance change, then asks the orchestrator to notify
//! once the commit has gone through.

use crate::config::TaskConfig;
use crate::directory::Directory;
use crate::listener::run_isolated;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::rules::{RuleContext, RuleRegistry};
use approvals_types::{
    AssigneePolicy, Stage, TaskCard, TaskCardId, TaskClosure, UserId, WorkflowError,
    WorkflowInstance, WorkflowResult, WorkflowTask,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Upper bound on the due date offset (about a century)
const MAX_DUE_OFFSET_HOURS: u64 = 876_000;

/// A new task and its card, not yet committed
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedTask {
    pub task: WorkflowTask,
    pub card: TaskCard,
}

/// A closed task and its updated card
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedTask {
    pub task: WorkflowTask,
    /// `None` if the card could not be found
    pub card: Option<TaskCard>,
}

/// Resolves assignees and plans task lifecycle writes
#[derive(Clone)]
pub struct TaskOrchestrator {
    directory: Arc<dyn Directory>,
    rules: Arc<RuleRegistry>,
    notifier: Arc<dyn Notifier>,
    config: TaskConfig,
    supervisor_level: u8,
}

impl TaskOrchestrator {
    pub fn new(
        directory: Arc<dyn Directory>,
        rules: Arc<RuleRegistry>,
        notifier: Arc<dyn Notifier>,
        config: TaskConfig,
        supervisor_level: u8,
    ) -> Self {
        Self {
            directory,
            rules,
            notifier,
            config,
            supervisor_level,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    // ── Assignee Resolution ──────────────────────────────────────────

    /// Resolve who should work a stage entered by `performer`.
    ///
    /// `Ok(None)` means nobody could be found; the stage stays unassigned.
    pub fn resolve_assignee(
        &self,
        policy: &AssigneePolicy,
        performer: &UserId,
    ) -> WorkflowResult<Option<UserId>> {
        let resolved = match policy {
            AssigneePolicy::SpecificUser { user_id } => Some(user_id.clone()),
            AssigneePolicy::DirectSupervisor | AssigneePolicy::None => {
                self.directory.direct_supervisor(performer)?
            }
            AssigneePolicy::Department { department_id } => self
                .directory
                .department_representative(department_id, self.supervisor_level)?,
            AssigneePolicy::Role { role_id } => self.directory.role_member(role_id)?,
        };
        tracing::debug!(
            policy = ?policy.assignee_type(),
            performer = %performer,
            assignee = ?resolved.as_ref().map(|u| u.to_string()),
            "Assignee resolved"
        );
        Ok(resolved)
    }

    // ── Planning ─────────────────────────────────────────────────────

    /// Plan the task for `instance` entering `stage`.
    ///
    /// Returns `Ok(None)` when no assignee can be resolved.
    pub fn plan_task(
        &self,
        instance: &WorkflowInstance,
        stage: &Stage,
        performer: &UserId,
        context: &RuleContext,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Option<PlannedTask>> {
        let Some(assignee) = self.resolve_assignee(&stage.assignee, performer)? else {
            tracing::info!(
                instance_id = %instance.id,
                stage = %stage.key,
                "No assignee resolved; stage left unassigned"
            );
            return Ok(None);
        };

        let details = self.rules.format_task(instance, stage, context);
        let mut card = TaskCard {
            id: TaskCardId::generate(),
            tenant_id: instance.tenant_id.clone(),
            title: details.title,
            description: details.description,
            bucket: self.config.backlog_bucket.clone(),
            assignee_id: assignee.clone(),
            creator_id: performer.clone(),
            watchers: Vec::new(),
            due_at: now + self.due_offset(),
            created_at: now,
            updated_at: now,
        };
        card.watch(performer.clone());
        card.watch(assignee.clone());
        for watcher in details.extra_watchers {
            card.watch(watcher);
        }

        let task = WorkflowTask::new(
            instance.id.clone(),
            stage.id.clone(),
            card.id.clone(),
            assignee,
            now,
        );
        Ok(Some(PlannedTask { task, card }))
    }

    /// Close a task because the instance moved on
    pub fn complete(&self, task: WorkflowTask, card: Option<TaskCard>, now: DateTime<Utc>) -> ClosedTask {
        self.close(task, card, TaskClosure::Completed, now)
    }

    /// Close a task because the instance was cancelled
    pub fn cancel(
        &self,
        task: WorkflowTask,
        card: Option<TaskCard>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ClosedTask {
        self.close(
            task,
            card,
            TaskClosure::Cancelled {
                reason: reason.to_string(),
            },
            now,
        )
    }

    fn close(
        &self,
        mut task: WorkflowTask,
        card: Option<TaskCard>,
        closure: TaskClosure,
        now: DateTime<Utc>,
    ) -> ClosedTask {
        let card = card.map(|mut card| {
            card.bucket = self.config.done_bucket.clone();
            if let TaskClosure::Cancelled { reason } = &closure {
                if !card.description.is_empty() {
                    card.description.push_str("\n\n");
                }
                card.description.push_str(&format!("Cancelled: {reason}"));
            }
            card.updated_at = now;
            card
        });
        task.close(closure, now);
        ClosedTask { task, card }
    }

    /// Plan a reassignment. Only open tasks may be reassigned.
    pub fn reassign(
        &self,
        mut task: WorkflowTask,
        card: Option<TaskCard>,
        new_assignee: &UserId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<(WorkflowTask, Option<TaskCard>)> {
        if !task.is_open() {
            return Err(WorkflowError::IllegalState(format!(
                "task {} is already closed",
                task.id
            )));
        }
        task.assignee_id = new_assignee.clone();
        let card = card.map(|mut card| {
            card.assignee_id = new_assignee.clone();
            card.watch(new_assignee.clone());
            card.updated_at = now;
            card
        });
        Ok((task, card))
    }

    fn due_offset(&self) -> Duration {
        Duration::hours(self.config.due_offset_hours.min(MAX_DUE_OFFSET_HOURS) as i64)
    }

    // ── Notification ─────────────────────────────────────────────────

    /// Tell the assignee about a new task, unless they created it
    pub fn notify_assigned(&self, planned: &PlannedTask) {
        if planned.card.assignee_id == planned.card.creator_id {
            return;
        }
        self.send(Notification {
            kind: NotificationKind::TaskAssigned,
            recipient: planned.card.assignee_id.clone(),
            instance_id: planned.task.instance_id.clone(),
            task_id: Some(planned.task.id.clone()),
            title: planned.card.title.clone(),
            message: planned.card.description.clone(),
        });
    }

    /// Tell the new assignee about a reassignment, unless they did it
    pub fn notify_reassigned(&self, task: &WorkflowTask, card: Option<&TaskCard>, performed_by: &UserId) {
        if !self.config.notify_on_reassign || &task.assignee_id == performed_by {
            return;
        }
        self.send(Notification {
            kind: NotificationKind::TaskReassigned,
            recipient: task.assignee_id.clone(),
            instance_id: task.instance_id.clone(),
            task_id: Some(task.id.clone()),
            title: card.map_or_else(|| "Task reassigned".to_string(), |c| c.title.clone()),
            message: format!("{performed_by} reassigned this task to you."),
        });
    }

    /// Best-effort delivery; failures are logged
    pub fn send(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        run_isolated("notifier", move || notifier.notify(&notification));
    }
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("config", &self.config)
            .field("supervisor_level", &self.supervisor_level)
            .finish_non_exhaustive()
    }
}
