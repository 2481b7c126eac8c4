use crate::model::{CommitReceipt, GraphChangeSet, InstanceFilter, Page, QueryWindow, UnitOfWork};
use crate::StoreResult;
use approvals_types::{
    HistoryEntry, InstanceId, InstanceStatus, SourceRef, Stage, StageId, TaskCard, TaskCardId,
    TemplateId, TenantId, Transition, TransitionId, UserId, WorkflowInstance, WorkflowTask,
    WorkflowTaskId, WorkflowTemplate,
};

/// Storage interface for templates and their stage graphs.
pub trait TemplateStore: Send + Sync {
    /// Insert a new template. Fails with `Conflict` if a non-deleted
    /// template of the same tenant already uses the code.
    fn insert_template(&self, template: WorkflowTemplate) -> StoreResult<WorkflowTemplate>;

    /// Replace existing templates as one atomic batch.
    ///
    /// Each row must carry the `revision` it was read at; any mismatch
    /// rejects the whole batch with `StaleWrite`. Returns the saved rows
    /// with their revision advanced.
    fn save_templates(&self, templates: Vec<WorkflowTemplate>) -> StoreResult<Vec<WorkflowTemplate>>;

    fn get_template(&self, id: &TemplateId) -> StoreResult<Option<WorkflowTemplate>>;

    /// Look up a non-deleted template by tenant and code.
    fn find_template_by_code(
        &self,
        tenant_id: &TenantId,
        code: &str,
    ) -> StoreResult<Option<WorkflowTemplate>>;

    /// Non-deleted templates of a tenant, ordered by code.
    fn list_templates(&self, tenant_id: &TenantId) -> StoreResult<Vec<WorkflowTemplate>>;

    /// Stages of a template, ordered by sequence.
    fn stages_for_template(&self, template_id: &TemplateId) -> StoreResult<Vec<Stage>>;

    fn get_stage(&self, id: &StageId) -> StoreResult<Option<Stage>>;

    fn transitions_for_template(&self, template_id: &TemplateId) -> StoreResult<Vec<Transition>>;

    /// Outgoing transitions of a stage.
    fn transitions_from(&self, stage_id: &StageId) -> StoreResult<Vec<Transition>>;

    fn get_transition(&self, id: &TransitionId) -> StoreResult<Option<Transition>>;

    /// Apply a graph change set atomically and bump the template revision.
    ///
    /// Deleting a stage that an active or suspended instance sits on
    /// fails with `InvariantViolation`.
    fn commit_graph(&self, changes: GraphChangeSet) -> StoreResult<WorkflowTemplate>;
}

/// Storage interface for instances and everything hanging off them.
pub trait InstanceStore: Send + Sync {
    fn get_instance(&self, id: &InstanceId) -> StoreResult<Option<WorkflowInstance>>;

    fn find_instance_by_source(&self, source: &SourceRef) -> StoreResult<Option<WorkflowInstance>>;

    /// Filtered listing, newest-started first.
    fn list_instances(
        &self,
        filter: &InstanceFilter,
        window: QueryWindow,
    ) -> StoreResult<Page<WorkflowInstance>>;

    /// Number of instances in one of `statuses` currently at a stage.
    fn count_instances_at_stage(
        &self,
        stage_id: &StageId,
        statuses: &[InstanceStatus],
    ) -> StoreResult<usize>;

    /// History of one instance, ordered by sequence.
    fn history_for(&self, instance_id: &InstanceId) -> StoreResult<Vec<HistoryEntry>>;

    /// Tasks of one instance, oldest first.
    fn tasks_for_instance(&self, instance_id: &InstanceId) -> StoreResult<Vec<WorkflowTask>>;

    fn get_task(&self, id: &WorkflowTaskId) -> StoreResult<Option<WorkflowTask>>;

    /// Open tasks, optionally restricted to one assignee, oldest first.
    fn open_tasks(&self, assignee: Option<&UserId>) -> StoreResult<Vec<WorkflowTask>>;

    fn get_card(&self, id: &TaskCardId) -> StoreResult<Option<TaskCard>>;

    /// Apply a unit of work atomically.
    ///
    /// An instance write must point at a stage that still exists in the
    /// instance's template.
    fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitReceipt>;
}

/// Unified storage bundle used by the engine.
pub trait WorkflowStore: TemplateStore + InstanceStore + Send + Sync {}

impl<T> WorkflowStore for T where T: TemplateStore + InstanceStore + Send + Sync {}
