//! Workflow engine: the write-side entry point
//!
//! Every mutation follows the same shape:
//! 1. read the instance and the graph around it,
//! 2. decide (structural guard, validator, permission pass),
//! 3. commit instance, history and task writes as one unit of work,
//!    compare-and-swap on the instance version read in step 1,
//! 4. run side effects (status sync, events, notifications), each one
//!    isolated so that nothing after the commit can fail the call.

use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::graph::StageGraphManager;
use crate::listener::{run_isolated, ListenerSet, WorkflowListener};
use crate::notify::{NoopNotifier, Notification, NotificationKind, Notifier};
use crate::query::InstanceQueryService;
use crate::rules::{DomainRuleSet, RuleContext, RuleInput, RuleRegistry};
use crate::tasks::{ClosedTask, PlannedTask, TaskOrchestrator};
use crate::templates::TemplateRegistry;
use crate::validator::{PermissionPolicy, Validator};
use approvals_store::{InstanceWrite, StoreError, UnitOfWork, WorkflowStore};
use approvals_types::{
    HistoryAction, HistoryAppend, InstanceId, InstanceStatus, Metadata, SourceRef, Stage, StageId,
    SyncPayload, TenantId, UserId, WorkflowError, WorkflowEvent, WorkflowInstance,
    WorkflowResult, WorkflowTask, WorkflowTaskId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const DEFAULT_CANCEL_REASON: &str = "Workflow cancelled";

// ── Requests ─────────────────────────────────────────────────────────

/// Input of [`WorkflowEngine::start`]
#[derive(Clone, Debug, PartialEq)]
pub struct StartRequest {
    pub tenant_id: TenantId,
    pub template_code: String,
    pub source: SourceRef,
    pub initiator: UserId,
    pub metadata: Metadata,
}

impl StartRequest {
    pub fn new(
        tenant_id: TenantId,
        template_code: impl Into<String>,
        source: SourceRef,
        initiator: UserId,
    ) -> Self {
        Self {
            tenant_id,
            template_code: template_code.into(),
            source,
            initiator,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Input of [`WorkflowEngine::transition`]
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionRequest {
    pub instance_id: InstanceId,
    /// Matched against `button_name` or `condition_type`
    pub action: String,
    pub performed_by: UserId,
    pub remarks: Option<String>,
    pub metadata: Metadata,
}

impl TransitionRequest {
    pub fn new(instance_id: InstanceId, action: impl Into<String>, performed_by: UserId) -> Self {
        Self {
            instance_id,
            action: action.into(),
            performed_by,
            remarks: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Assembles a [`WorkflowEngine`] from its collaborators
pub struct EngineBuilder {
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn Directory>,
    rules: RuleRegistry,
    notifier: Arc<dyn Notifier>,
    listeners: ListenerSet,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn WorkflowStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            rules: RuleRegistry::new(),
            notifier: Arc::new(NoopNotifier),
            listeners: ListenerSet::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_rule_set(mut self, rule_set: Arc<dyn DomainRuleSet>) -> Self {
        self.rules.register(rule_set);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn WorkflowListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let rules = Arc::new(self.rules);
        let permissions =
            PermissionPolicy::new(self.directory.clone(), self.config.permissions.supervisor_level);
        let tasks = TaskOrchestrator::new(
            self.directory,
            rules.clone(),
            self.notifier,
            self.config.tasks.clone(),
            self.config.permissions.supervisor_level,
        );
        WorkflowEngine {
            templates: TemplateRegistry::new(self.store.clone()),
            graph: StageGraphManager::new(self.store.clone()),
            validator: Validator::new(rules.clone(), permissions),
            store: self.store,
            rules,
            tasks,
            listeners: self.listeners,
            config: self.config,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// The workflow engine
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    templates: TemplateRegistry,
    graph: StageGraphManager,
    rules: Arc<RuleRegistry>,
    validator: Validator,
    tasks: TaskOrchestrator,
    listeners: ListenerSet,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn builder(store: Arc<dyn WorkflowStore>, directory: Arc<dyn Directory>) -> EngineBuilder {
        EngineBuilder::new(store, directory)
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn graph(&self) -> &StageGraphManager {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-side service over the same store
    pub fn query(&self) -> InstanceQueryService {
        InstanceQueryService::new(
            self.store.clone(),
            self.validator.permissions().clone(),
            self.config.query.clone(),
        )
    }

    // ── Start ────────────────────────────────────────────────────────

    /// Start a workflow for a business entity.
    ///
    /// At most one instance may ever exist per source, so a second start
    /// fails with `DuplicateInstance` even after the first one finished.
    pub fn start(&self, request: StartRequest) -> WorkflowResult<WorkflowInstance> {
        let duplicate = || WorkflowError::DuplicateInstance {
            module: request.source.module.clone(),
            source_id: request.source.id.clone(),
        };
        if self.store.find_instance_by_source(&request.source)?.is_some() {
            return Err(duplicate());
        }

        let template = self
            .templates
            .find_by_code(&request.tenant_id, &request.template_code)?
            .ok_or_else(|| WorkflowError::TemplateNotFound(request.template_code.clone()))?;
        if !template.is_active {
            return Err(WorkflowError::TemplateInactive(template.code));
        }
        let initial = self
            .store
            .stages_for_template(&template.id)?
            .into_iter()
            .find(|s| s.is_initial)
            .ok_or_else(|| WorkflowError::NoInitialStage(template.code.clone()))?;

        let now = Utc::now();
        let mut instance = WorkflowInstance::new(
            template.id.clone(),
            template.code.clone(),
            template.tenant_id.clone(),
            initial.id.clone(),
            request.source.clone(),
            request.initiator.clone(),
        )
        .with_metadata(request.metadata.clone());
        instance.started_at = now;
        instance.updated_at = now;

        let mut unit = UnitOfWork::new().with_instance(InstanceWrite::Insert(instance.clone()));
        unit.append_history(
            HistoryAppend::new(
                instance.id.clone(),
                HistoryAction::WorkflowStarted,
                request.initiator.clone(),
                now,
            )
            .between(None, Some(initial.id.clone()))
            .with_metadata(request.metadata.clone()),
        );

        let planned = if initial.assignee.is_configured() {
            let context = self.task_context(&instance, &request.metadata);
            self.tasks
                .plan_task(&instance, &initial, &request.initiator, &context, now)?
        } else {
            None
        };
        push_planned(&mut unit, planned.as_ref());

        let receipt = self.store.commit(unit).map_err(|e| match e {
            StoreError::Conflict(_) => duplicate(),
            other => other.into(),
        })?;
        let instance = committed(receipt.instance)?;

        tracing::info!(
            instance_id = %instance.id,
            template = %instance.template_code,
            source = %instance.source,
            stage = %initial.key,
            "Workflow started"
        );

        self.listeners.emit(&WorkflowEvent::Started {
            instance_id: instance.id.clone(),
            template_code: instance.template_code.clone(),
            source: instance.source.clone(),
            stage_key: initial.key.clone(),
            at: now,
        });
        if let Some(planned) = &planned {
            self.task_created(planned);
        }
        Ok(instance)
    }

    // ── Transition ───────────────────────────────────────────────────

    /// Perform an action on an active instance.
    ///
    /// Fails with `InvalidAction` unless the action is wired as an edge out
    /// of the current stage, `Validation` with every failed rule, or
    /// `Forbidden` if the performer lacks permission.
    pub fn transition(&self, request: TransitionRequest) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_instance(&request.instance_id)?;
        require_status(&instance, InstanceStatus::Active)?;

        let stage = self.load_stage(&instance.current_stage_id)?;
        let transition = self
            .store
            .transitions_from(&stage.id)?
            .into_iter()
            .find(|t| t.matches_action(&request.action))
            .ok_or_else(|| WorkflowError::InvalidAction {
                action: request.action.clone(),
                stage: stage.key.clone(),
            })?;
        let target = transition
            .to_stage_id
            .as_ref()
            .map(|id| self.load_stage(id))
            .transpose()?;

        let context = self
            .rules
            .context_for(&instance, &request.metadata)
            .map_err(|e| WorkflowError::Validation(vec![e.to_string()].into()))?;
        let input = RuleInput {
            instance: &instance,
            transition: &transition,
            target: target.as_ref(),
            performer: &request.performed_by,
            remarks: request.remarks.as_deref(),
            metadata: &request.metadata,
        };
        self.validator.validate(&input, &context)?;
        self.validator.check_permission(&input)?;

        let now = Utc::now();
        let remarks = request
            .remarks
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        let history = HistoryAppend::new(
            instance.id.clone(),
            HistoryAction::Transition(transition.button_name.clone()),
            request.performed_by.clone(),
            now,
        )
        .with_remarks(remarks)
        .with_metadata(request.metadata.clone());

        let mut next = instance.clone();
        let mut unit = UnitOfWork::new();
        let mut closed = Vec::new();
        let mut planned = None;

        match &target {
            // Informational action: history only
            None => {
                next.updated_at = now;
                unit.append_history(history.between(Some(stage.id.clone()), Some(stage.id.clone())));
            }
            Some(target) => {
                next.enter_stage(target.id.clone(), target.is_final, now);
                unit.append_history(history.between(Some(stage.id.clone()), Some(target.id.clone())));
                closed = self.close_open_tasks(&instance.id, None, now)?;
                push_closed(&mut unit, &closed);
                if !target.is_final {
                    planned = self
                        .tasks
                        .plan_task(&next, target, &request.performed_by, &context, now)?;
                    push_planned(&mut unit, planned.as_ref());
                }
            }
        }
        unit.instance = Some(InstanceWrite::Update {
            instance: next,
            expected_version: instance.version,
        });

        let updated = committed(self.store.commit(unit)?.instance)?;
        let to_stage = target.as_ref().unwrap_or(&stage);

        tracing::info!(
            instance_id = %updated.id,
            template = %updated.template_code,
            action = %transition.button_name,
            from = %stage.key,
            to = %to_stage.key,
            status = %updated.status,
            "Workflow transitioned"
        );

        if let Some(target) = &target {
            self.sync_source(&updated, target);
        }
        self.listeners.emit(&WorkflowEvent::Transitioned {
            instance_id: updated.id.clone(),
            source: updated.source.clone(),
            action: transition.button_name.clone(),
            from_stage_key: stage.key.clone(),
            to_stage_key: to_stage.key.clone(),
            performed_by: request.performed_by.clone(),
            completed: updated.status == InstanceStatus::Completed,
            at: now,
        });
        self.tasks_closed(&closed, false);
        if let Some(planned) = &planned {
            self.task_created(planned);
        }
        if updated.started_by != request.performed_by {
            self.tasks.send(Notification {
                kind: NotificationKind::WorkflowTransitioned,
                recipient: updated.started_by.clone(),
                instance_id: updated.id.clone(),
                task_id: None,
                title: format!(
                    "{} {}: {}",
                    updated.source.module, updated.source.id, transition.button_name
                ),
                message: format!(
                    "{} performed '{}'; now at '{}'.",
                    request.performed_by, transition.button_name, to_stage.name
                ),
            });
        }
        Ok(updated)
    }

    // ── Cancel / Suspend / Resume ────────────────────────────────────

    /// Cancel an active instance, closing its open tasks with the reason
    pub fn cancel(
        &self,
        instance_id: &InstanceId,
        performed_by: &UserId,
        reason: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id)?;
        require_status(&instance, InstanceStatus::Active)?;

        let now = Utc::now();
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let task_reason = reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON);

        let mut next = instance.clone();
        next.cancel(now);
        let mut unit = UnitOfWork::new();
        unit.append_history(
            HistoryAppend::new(
                instance.id.clone(),
                HistoryAction::WorkflowCancelled,
                performed_by.clone(),
                now,
            )
            .between(
                Some(instance.current_stage_id.clone()),
                Some(instance.current_stage_id.clone()),
            )
            .with_remarks(reason.clone()),
        );
        let closed = self.close_open_tasks(&instance.id, Some(task_reason), now)?;
        push_closed(&mut unit, &closed);
        unit.instance = Some(InstanceWrite::Update {
            instance: next,
            expected_version: instance.version,
        });

        let updated = committed(self.store.commit(unit)?.instance)?;
        tracing::info!(
            instance_id = %updated.id,
            template = %updated.template_code,
            tasks_cancelled = closed.len(),
            "Workflow cancelled"
        );

        self.listeners.emit(&WorkflowEvent::Cancelled {
            instance_id: updated.id.clone(),
            source: updated.source.clone(),
            performed_by: performed_by.clone(),
            reason,
            at: now,
        });
        self.tasks_closed(&closed, true);
        Ok(updated)
    }

    /// Suspend an active instance. Stage and open tasks are untouched.
    pub fn suspend(
        &self,
        instance_id: &InstanceId,
        performed_by: &UserId,
        reason: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id)?;
        require_status(&instance, InstanceStatus::Active)?;

        let now = Utc::now();
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let mut next = instance.clone();
        next.suspend(performed_by, reason.as_deref(), now);

        let updated = self.commit_status_change(
            &instance,
            next,
            HistoryAction::WorkflowSuspended,
            performed_by,
            reason.clone(),
            now,
        )?;
        tracing::info!(instance_id = %updated.id, template = %updated.template_code, "Workflow suspended");

        self.listeners.emit(&WorkflowEvent::Suspended {
            instance_id: updated.id.clone(),
            source: updated.source.clone(),
            performed_by: performed_by.clone(),
            reason,
            at: now,
        });
        Ok(updated)
    }

    /// Resume a suspended instance
    pub fn resume(
        &self,
        instance_id: &InstanceId,
        performed_by: &UserId,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_instance(instance_id)?;
        require_status(&instance, InstanceStatus::Suspended)?;

        let now = Utc::now();
        let mut next = instance.clone();
        next.resume(performed_by, now);

        let updated = self.commit_status_change(
            &instance,
            next,
            HistoryAction::WorkflowResumed,
            performed_by,
            None,
            now,
        )?;
        tracing::info!(instance_id = %updated.id, template = %updated.template_code, "Workflow resumed");

        self.listeners.emit(&WorkflowEvent::Resumed {
            instance_id: updated.id.clone(),
            source: updated.source.clone(),
            performed_by: performed_by.clone(),
            at: now,
        });
        Ok(updated)
    }

    fn commit_status_change(
        &self,
        before: &WorkflowInstance,
        after: WorkflowInstance,
        action: HistoryAction,
        performed_by: &UserId,
        remarks: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut unit = UnitOfWork::new();
        unit.append_history(
            HistoryAppend::new(before.id.clone(), action, performed_by.clone(), now)
                .between(
                    Some(before.current_stage_id.clone()),
                    Some(before.current_stage_id.clone()),
                )
                .with_remarks(remarks),
        );
        unit.instance = Some(InstanceWrite::Update {
            instance: after,
            expected_version: before.version,
        });
        committed(self.store.commit(unit)?.instance)
    }

    // ── Tasks ────────────────────────────────────────────────────────

    /// Hand an open task to someone else
    pub fn reassign_task(
        &self,
        task_id: &WorkflowTaskId,
        new_assignee: &UserId,
        performed_by: &UserId,
    ) -> WorkflowResult<WorkflowTask> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        let card = self.store.get_card(&task.card_id)?;
        let previous = task.assignee_id.clone();

        let now = Utc::now();
        let (task, card) = self.tasks.reassign(task, card, new_assignee, now)?;
        let mut unit = UnitOfWork::new();
        unit.update_tasks.push(task.clone());
        unit.update_cards.extend(card.clone());
        self.store.commit(unit)?;

        tracing::info!(
            instance_id = %task.instance_id,
            task = %task.id,
            from = %previous,
            to = %new_assignee,
            "Task reassigned"
        );

        self.listeners.emit(&WorkflowEvent::TaskReassigned {
            task_id: task.id.clone(),
            instance_id: task.instance_id.clone(),
            previous_assignee: previous,
            new_assignee: new_assignee.clone(),
            performed_by: performed_by.clone(),
            at: now,
        });
        self.tasks.notify_reassigned(&task, card.as_ref(), performed_by);
        Ok(task)
    }

    /// Close every open task of an instance; `cancel_reason` marks them
    /// cancelled rather than completed
    fn close_open_tasks(
        &self,
        instance_id: &InstanceId,
        cancel_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<ClosedTask>> {
        let mut closed = Vec::new();
        for task in self.store.tasks_for_instance(instance_id)? {
            if !task.is_open() {
                continue;
            }
            let card = self.store.get_card(&task.card_id)?;
            closed.push(match cancel_reason {
                Some(reason) => self.tasks.cancel(task, card, reason, now),
                None => self.tasks.complete(task, card, now),
            });
        }
        Ok(closed)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn load_instance(&self, id: &InstanceId) -> WorkflowResult<WorkflowInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.to_string()))
    }

    fn load_stage(&self, id: &StageId) -> WorkflowResult<Stage> {
        self.store
            .get_stage(id)?
            .ok_or_else(|| WorkflowError::StageNotFound(id.clone()))
    }

    /// Context for task formatting; a source that fails to load degrades
    /// to the instance metadata
    fn task_context(&self, instance: &WorkflowInstance, metadata: &Metadata) -> RuleContext {
        self.rules
            .context_for(instance, metadata)
            .unwrap_or_else(|e| {
                tracing::warn!(
                    instance_id = %instance.id,
                    source = %instance.source,
                    error = %e,
                    "Source entity unavailable for task formatting"
                );
                RuleContext {
                    fields: instance.metadata.clone(),
                    requester: None,
                }
            })
    }

    /// Mirror the new stage onto the business entity and announce it
    fn sync_source(&self, instance: &WorkflowInstance, stage: &Stage) {
        let payload = SyncPayload {
            source_id: instance.source.id.clone(),
            stage_key: stage.key.clone(),
            stage_name: stage.name.clone(),
            is_final: stage.is_final,
            instance_id: instance.id.clone(),
        };
        if let Some(rule_set) = self.rules.get(&instance.source.module) {
            let label = format!("sync:{}", instance.source.module);
            run_isolated(&label, || rule_set.sync_status(&payload));
        }
        self.listeners.emit(&WorkflowEvent::Sync {
            module: instance.source.module.clone(),
            payload,
        });
    }

    fn task_created(&self, planned: &PlannedTask) {
        self.listeners.emit(&WorkflowEvent::TaskCreated {
            task_id: planned.task.id.clone(),
            card_id: planned.card.id.clone(),
            instance_id: planned.task.instance_id.clone(),
            stage_id: planned.task.stage_id.clone(),
            assignee_id: planned.task.assignee_id.clone(),
            at: planned.task.created_at,
        });
        self.tasks.notify_assigned(planned);
    }

    fn tasks_closed(&self, closed: &[ClosedTask], cancelled: bool) {
        for closed in closed {
            self.listeners.emit(&WorkflowEvent::TaskCompleted {
                task_id: closed.task.id.clone(),
                instance_id: closed.task.instance_id.clone(),
                cancelled,
                at: closed.task.completed_at.unwrap_or_else(Utc::now),
            });
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("rules", &self.rules)
            .field("listeners", &self.listeners)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn require_status(instance: &WorkflowInstance, expected: InstanceStatus) -> WorkflowResult<()> {
    if instance.status != expected {
        return Err(WorkflowError::WrongStatus {
            instance_id: instance.id.clone(),
            status: instance.status,
            expected,
        });
    }
    Ok(())
}

fn committed(instance: Option<WorkflowInstance>) -> WorkflowResult<WorkflowInstance> {
    instance.ok_or_else(|| WorkflowError::Storage("commit returned no instance".to_string()))
}

fn push_planned(unit: &mut UnitOfWork, planned: Option<&PlannedTask>) {
    if let Some(planned) = planned {
        unit.insert_cards.push(planned.card.clone());
        unit.insert_tasks.push(planned.task.clone());
    }
}

fn push_closed(unit: &mut UnitOfWork, closed: &[ClosedTask]) {
    for closed in closed {
        unit.update_tasks.push(closed.task.clone());
        unit.update_cards.extend(closed.card.clone());
    }
}
