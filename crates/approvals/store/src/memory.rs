//! In-memory reference implementation of the workflow storage traits.
//!
//! All tables live behind one lock so that a commit can validate every
//! precondition before touching anything and then apply all of its writes
//! while holding the lock. That gives the same all-or-nothing,
//! serialized-writer behaviour a transactional database would.

use crate::hash::history_hash;
use crate::model::{
    CommitReceipt, GraphChangeSet, InstanceFilter, InstanceWrite, Page, QueryWindow, UnitOfWork,
};
use crate::traits::{InstanceStore, TemplateStore};
use crate::{StoreError, StoreResult};
use approvals_types::{
    HistoryEntry, HistoryEntryId, InstanceId, InstanceStatus, SourceRef, Stage, StageId, TaskCard,
    TaskCardId, TemplateId, TenantId, Transition, TransitionId, UserId, WorkflowInstance,
    WorkflowTask, WorkflowTaskId, WorkflowTemplate,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    templates: HashMap<TemplateId, WorkflowTemplate>,
    stages: HashMap<StageId, Stage>,
    transitions: HashMap<TransitionId, Transition>,
    instances: HashMap<InstanceId, WorkflowInstance>,
    sources: HashMap<SourceRef, InstanceId>,
    history: HashMap<InstanceId, Vec<HistoryEntry>>,
    tasks: HashMap<WorkflowTaskId, WorkflowTask>,
    cards: HashMap<TaskCardId, TaskCard>,
}

/// In-memory workflow storage adapter.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    tables: RwLock<Tables>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("workflow tables lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("workflow tables lock poisoned".to_string()))
    }
}

// ── Templates ────────────────────────────────────────────────────────

fn code_taken(tables: &Tables, template: &WorkflowTemplate) -> bool {
    !template.is_deleted()
        && tables.templates.values().any(|other| {
            other.id != template.id
                && !other.is_deleted()
                && other.tenant_id == template.tenant_id
                && other.code == template.code
        })
}

fn check_stage_set(stages: &HashMap<StageId, Stage>) -> StoreResult<()> {
    let mut keys = HashSet::new();
    for stage in stages.values() {
        if !keys.insert(stage.key.as_str()) {
            return Err(StoreError::InvariantViolation(format!(
                "duplicate stage key '{}'",
                stage.key
            )));
        }
    }

    let mut sequences: Vec<u32> = stages.values().map(|s| s.sequence).collect();
    sequences.sort_unstable();
    for (expected, actual) in sequences.iter().enumerate() {
        if *actual as usize != expected {
            return Err(StoreError::InvariantViolation(format!(
                "stage sequences are not dense: expected {expected}, found {actual}"
            )));
        }
    }

    let initial = stages.values().filter(|s| s.is_initial).count();
    if initial > 1 {
        return Err(StoreError::InvariantViolation(format!(
            "{initial} stages are marked initial"
        )));
    }
    Ok(())
}

impl TemplateStore for InMemoryWorkflowStore {
    fn insert_template(&self, template: WorkflowTemplate) -> StoreResult<WorkflowTemplate> {
        let mut tables = self.write()?;
        if tables.templates.contains_key(&template.id) {
            return Err(StoreError::Conflict(format!(
                "template {} already exists",
                template.id
            )));
        }
        if code_taken(&tables, &template) {
            return Err(StoreError::Conflict(format!(
                "template code '{}' already exists for tenant {}",
                template.code, template.tenant_id
            )));
        }
        tables
            .templates
            .insert(template.id.clone(), template.clone());
        Ok(template)
    }

    fn save_templates(&self, templates: Vec<WorkflowTemplate>) -> StoreResult<Vec<WorkflowTemplate>> {
        let mut tables = self.write()?;
        let mut seen = HashSet::new();
        for template in &templates {
            if !seen.insert(&template.id) {
                return Err(StoreError::InvalidInput(format!(
                    "template {} appears twice in one batch",
                    template.id
                )));
            }
            let stored = tables.templates.get(&template.id).ok_or_else(|| {
                StoreError::NotFound(format!("template {} not found", template.id))
            })?;
            if stored.revision != template.revision {
                return Err(StoreError::StaleWrite(format!(
                    "template {} is at revision {}, expected {}",
                    template.id, stored.revision, template.revision
                )));
            }
        }

        // Check code uniqueness against the batch applied on a scratch copy.
        let mut scratch = tables.templates.clone();
        let saved: Vec<WorkflowTemplate> = templates
            .into_iter()
            .map(|mut template| {
                template.revision += 1;
                template
            })
            .collect();
        for template in &saved {
            scratch.insert(template.id.clone(), template.clone());
        }
        for template in &saved {
            let clash = !template.is_deleted()
                && scratch.values().any(|other| {
                    other.id != template.id
                        && !other.is_deleted()
                        && other.tenant_id == template.tenant_id
                        && other.code == template.code
                });
            if clash {
                return Err(StoreError::Conflict(format!(
                    "template code '{}' already exists for tenant {}",
                    template.code, template.tenant_id
                )));
            }
        }

        for template in &saved {
            let defaults = scratch
                .values()
                .filter(|t| t.tenant_id == template.tenant_id && t.is_default && !t.is_deleted())
                .count();
            if defaults > 1 {
                return Err(StoreError::Conflict(format!(
                    "tenant {} would have {defaults} default templates",
                    template.tenant_id
                )));
            }
        }

        tables.templates = scratch;
        tracing::trace!(templates = saved.len(), "Template rows saved");
        Ok(saved)
    }

    fn get_template(&self, id: &TemplateId) -> StoreResult<Option<WorkflowTemplate>> {
        Ok(self.read()?.templates.get(id).cloned())
    }

    fn find_template_by_code(
        &self,
        tenant_id: &TenantId,
        code: &str,
    ) -> StoreResult<Option<WorkflowTemplate>> {
        Ok(self
            .read()?
            .templates
            .values()
            .find(|t| !t.is_deleted() && &t.tenant_id == tenant_id && t.code == code)
            .cloned())
    }

    fn list_templates(&self, tenant_id: &TenantId) -> StoreResult<Vec<WorkflowTemplate>> {
        let mut templates: Vec<_> = self
            .read()?
            .templates
            .values()
            .filter(|t| !t.is_deleted() && &t.tenant_id == tenant_id)
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(templates)
    }

    fn stages_for_template(&self, template_id: &TemplateId) -> StoreResult<Vec<Stage>> {
        let mut stages: Vec<_> = self
            .read()?
            .stages
            .values()
            .filter(|s| &s.template_id == template_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.sequence);
        Ok(stages)
    }

    fn get_stage(&self, id: &StageId) -> StoreResult<Option<Stage>> {
        Ok(self.read()?.stages.get(id).cloned())
    }

    fn transitions_for_template(&self, template_id: &TemplateId) -> StoreResult<Vec<Transition>> {
        let mut transitions: Vec<_> = self
            .read()?
            .transitions
            .values()
            .filter(|t| &t.template_id == template_id)
            .cloned()
            .collect();
        transitions.sort_by(|a, b| a.button_name.cmp(&b.button_name).then(a.id.cmp(&b.id)));
        Ok(transitions)
    }

    fn transitions_from(&self, stage_id: &StageId) -> StoreResult<Vec<Transition>> {
        let mut transitions: Vec<_> = self
            .read()?
            .transitions
            .values()
            .filter(|t| &t.from_stage_id == stage_id)
            .cloned()
            .collect();
        transitions.sort_by(|a, b| a.button_name.cmp(&b.button_name).then(a.id.cmp(&b.id)));
        Ok(transitions)
    }

    fn get_transition(&self, id: &TransitionId) -> StoreResult<Option<Transition>> {
        Ok(self.read()?.transitions.get(id).cloned())
    }

    fn commit_graph(&self, changes: GraphChangeSet) -> StoreResult<WorkflowTemplate> {
        let mut tables = self.write()?;
        let mut template = tables
            .templates
            .get(&changes.template_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("template {} not found", changes.template_id))
            })?;
        if template.is_deleted() {
            return Err(StoreError::InvariantViolation(format!(
                "template {} is deleted",
                template.id
            )));
        }
        if template.revision != changes.expected_revision {
            return Err(StoreError::StaleWrite(format!(
                "template {} is at revision {}, expected {}",
                template.id, template.revision, changes.expected_revision
            )));
        }

        let mut stages: HashMap<StageId, Stage> = tables
            .stages
            .values()
            .filter(|s| s.template_id == template.id)
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        for id in &changes.delete_stages {
            if stages.remove(id).is_none() {
                return Err(StoreError::NotFound(format!("stage {id} not found")));
            }
            let live = tables
                .instances
                .values()
                .filter(|i| &i.current_stage_id == id && !i.is_terminal())
                .count();
            if live > 0 {
                return Err(StoreError::InvariantViolation(format!(
                    "stage {id} has {live} live instance(s)"
                )));
            }
        }
        for stage in &changes.upsert_stages {
            let foreign = stage.template_id != template.id
                || tables
                    .stages
                    .get(&stage.id)
                    .is_some_and(|existing| existing.template_id != template.id);
            if foreign {
                return Err(StoreError::InvalidInput(format!(
                    "stage {} does not belong to template {}",
                    stage.id, template.id
                )));
            }
            stages.insert(stage.id.clone(), stage.clone());
        }
        check_stage_set(&stages)?;

        let mut transitions: HashMap<TransitionId, Transition> = tables
            .transitions
            .values()
            .filter(|t| t.template_id == template.id)
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        for id in &changes.delete_transitions {
            if transitions.remove(id).is_none() {
                return Err(StoreError::NotFound(format!("transition {id} not found")));
            }
        }
        for transition in &changes.upsert_transitions {
            let foreign = transition.template_id != template.id
                || tables
                    .transitions
                    .get(&transition.id)
                    .is_some_and(|existing| existing.template_id != template.id);
            if foreign {
                return Err(StoreError::InvalidInput(format!(
                    "transition {} does not belong to template {}",
                    transition.id, template.id
                )));
            }
            transitions.insert(transition.id.clone(), transition.clone());
        }
        for transition in transitions.values() {
            let dangling = !stages.contains_key(&transition.from_stage_id)
                || transition
                    .to_stage_id
                    .as_ref()
                    .is_some_and(|to| !stages.contains_key(to));
            if dangling {
                return Err(StoreError::InvariantViolation(format!(
                    "transition {} references a stage outside template {}",
                    transition.id, template.id
                )));
            }
        }

        let template_id = template.id.clone();
        tables.stages.retain(|_, s| s.template_id != template_id);
        tables.stages.extend(stages);
        tables.transitions.retain(|_, t| t.template_id != template_id);
        tables.transitions.extend(transitions);

        template.revision += 1;
        template.updated_at = Utc::now();
        tables
            .templates
            .insert(template.id.clone(), template.clone());

        tracing::trace!(
            template = %template.id,
            revision = template.revision,
            "Graph change set committed"
        );
        Ok(template)
    }
}

// ── Instances ────────────────────────────────────────────────────────

impl InstanceStore for InMemoryWorkflowStore {
    fn get_instance(&self, id: &InstanceId) -> StoreResult<Option<WorkflowInstance>> {
        Ok(self.read()?.instances.get(id).cloned())
    }

    fn find_instance_by_source(&self, source: &SourceRef) -> StoreResult<Option<WorkflowInstance>> {
        let tables = self.read()?;
        Ok(tables
            .sources
            .get(source)
            .and_then(|id| tables.instances.get(id))
            .cloned())
    }

    fn list_instances(
        &self,
        filter: &InstanceFilter,
        window: QueryWindow,
    ) -> StoreResult<Page<WorkflowInstance>> {
        let mut values: Vec<_> = self
            .read()?
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        values.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(Page::from_all(values, window))
    }

    fn count_instances_at_stage(
        &self,
        stage_id: &StageId,
        statuses: &[InstanceStatus],
    ) -> StoreResult<usize> {
        Ok(self
            .read()?
            .instances
            .values()
            .filter(|i| &i.current_stage_id == stage_id && statuses.contains(&i.status))
            .count())
    }

    fn history_for(&self, instance_id: &InstanceId) -> StoreResult<Vec<HistoryEntry>> {
        Ok(self
            .read()?
            .history
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    fn tasks_for_instance(&self, instance_id: &InstanceId) -> StoreResult<Vec<WorkflowTask>> {
        let mut tasks: Vec<_> = self
            .read()?
            .tasks
            .values()
            .filter(|t| &t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn get_task(&self, id: &WorkflowTaskId) -> StoreResult<Option<WorkflowTask>> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    fn open_tasks(&self, assignee: Option<&UserId>) -> StoreResult<Vec<WorkflowTask>> {
        let mut tasks: Vec<_> = self
            .read()?
            .tasks
            .values()
            .filter(|t| t.is_open() && assignee.map_or(true, |a| &t.assignee_id == a))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn get_card(&self, id: &TaskCardId) -> StoreResult<Option<TaskCard>> {
        Ok(self.read()?.cards.get(id).cloned())
    }

    fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitReceipt> {
        let mut tables = self.write()?;

        // ── Validate: nothing below this block may fail ──────────────

        let staged_instance = match &unit.instance {
            None => None,
            Some(InstanceWrite::Insert(instance)) => {
                if tables.instances.contains_key(&instance.id) {
                    return Err(StoreError::Conflict(format!(
                        "instance {} already exists",
                        instance.id
                    )));
                }
                if tables.sources.contains_key(&instance.source) {
                    return Err(StoreError::Conflict(format!(
                        "an instance already exists for source {}",
                        instance.source
                    )));
                }
                let mut staged = instance.clone();
                staged.version = 1;
                Some(staged)
            }
            Some(InstanceWrite::Update {
                instance,
                expected_version,
            }) => {
                let stored = tables.instances.get(&instance.id).ok_or_else(|| {
                    StoreError::NotFound(format!("instance {} not found", instance.id))
                })?;
                if stored.version != *expected_version {
                    return Err(StoreError::StaleWrite(format!(
                        "instance {} is at version {}, expected {}",
                        instance.id, stored.version, expected_version
                    )));
                }
                if stored.is_terminal() {
                    return Err(StoreError::InvariantViolation(format!(
                        "instance {} is {} and can no longer change",
                        instance.id, stored.status
                    )));
                }
                if stored.source != instance.source || stored.template_id != instance.template_id
                {
                    return Err(StoreError::InvariantViolation(format!(
                        "instance {} cannot change its source or template",
                        instance.id
                    )));
                }
                let mut staged = instance.clone();
                staged.version = expected_version + 1;
                Some(staged)
            }
        };

        if let Some(instance) = &staged_instance {
            let on_template = tables
                .stages
                .get(&instance.current_stage_id)
                .is_some_and(|stage| stage.template_id == instance.template_id);
            if !on_template {
                return Err(StoreError::InvariantViolation(format!(
                    "stage {} no longer exists in template {}",
                    instance.current_stage_id, instance.template_id
                )));
            }
        }

        let instance_known = |id: &InstanceId| {
            tables.instances.contains_key(id)
                || staged_instance.as_ref().is_some_and(|i| &i.id == id)
        };

        for entry in &unit.history {
            if !instance_known(&entry.instance_id) {
                return Err(StoreError::NotFound(format!(
                    "history for unknown instance {}",
                    entry.instance_id
                )));
            }
        }

        for card in &unit.insert_cards {
            if tables.cards.contains_key(&card.id) {
                return Err(StoreError::Conflict(format!("card {} already exists", card.id)));
            }
        }
        for card in &unit.update_cards {
            if !tables.cards.contains_key(&card.id) {
                return Err(StoreError::NotFound(format!("card {} not found", card.id)));
            }
        }
        let card_known = |id: &TaskCardId| {
            tables.cards.contains_key(id) || unit.insert_cards.iter().any(|c| &c.id == id)
        };

        for task in &unit.insert_tasks {
            if tables.tasks.contains_key(&task.id) {
                return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
            }
            if !instance_known(&task.instance_id) {
                return Err(StoreError::NotFound(format!(
                    "task {} references unknown instance {}",
                    task.id, task.instance_id
                )));
            }
            if !card_known(&task.card_id) {
                return Err(StoreError::NotFound(format!(
                    "task {} references unknown card {}",
                    task.id, task.card_id
                )));
            }
        }
        for task in &unit.update_tasks {
            let stored = tables
                .tasks
                .get(&task.id)
                .ok_or_else(|| StoreError::NotFound(format!("task {} not found", task.id)))?;
            if !stored.is_open() {
                return Err(StoreError::InvariantViolation(format!(
                    "task {} is closed and can no longer change",
                    task.id
                )));
            }
            if stored.instance_id != task.instance_id
                || stored.stage_id != task.stage_id
                || stored.card_id != task.card_id
            {
                return Err(StoreError::InvariantViolation(format!(
                    "task {} cannot change its instance, stage or card",
                    task.id
                )));
            }
        }

        let affected: HashSet<&InstanceId> = unit
            .insert_tasks
            .iter()
            .chain(unit.update_tasks.iter())
            .map(|t| &t.instance_id)
            .collect();
        for instance_id in affected {
            let updated: HashMap<&WorkflowTaskId, &WorkflowTask> = unit
                .update_tasks
                .iter()
                .filter(|t| &t.instance_id == instance_id)
                .map(|t| (&t.id, t))
                .collect();
            let existing_open = tables
                .tasks
                .values()
                .filter(|t| &t.instance_id == instance_id)
                .filter(|t| updated.get(&t.id).map_or(t.is_open(), |u| u.is_open()))
                .count();
            let inserted_open = unit
                .insert_tasks
                .iter()
                .filter(|t| &t.instance_id == instance_id && t.is_open())
                .count();
            if existing_open + inserted_open > 1 {
                return Err(StoreError::InvariantViolation(format!(
                    "instance {} would have {} open tasks",
                    instance_id,
                    existing_open + inserted_open
                )));
            }
        }

        let mut staged_history: HashMap<InstanceId, Vec<HistoryEntry>> = HashMap::new();
        for append in &unit.history {
            let existing = tables.history.get(&append.instance_id);
            let staged = staged_history.entry(append.instance_id.clone()).or_default();
            let previous_hash = staged
                .last()
                .or_else(|| existing.and_then(|e| e.last()))
                .map(|e| e.hash.clone());
            let sequence = existing.map_or(0, Vec::len) as u64 + staged.len() as u64 + 1;
            let hash = history_hash(append, previous_hash.as_deref(), sequence)?;
            staged.push(HistoryEntry {
                id: HistoryEntryId::generate(),
                instance_id: append.instance_id.clone(),
                sequence,
                from_stage_id: append.from_stage_id.clone(),
                to_stage_id: append.to_stage_id.clone(),
                action: append.action.clone(),
                performed_by: append.performed_by.clone(),
                remarks: append.remarks.clone(),
                metadata: append.metadata.clone(),
                performed_at: append.performed_at,
                previous_hash,
                hash,
            });
        }

        // ── Apply ────────────────────────────────────────────────────

        if let Some(instance) = &staged_instance {
            tables
                .sources
                .insert(instance.source.clone(), instance.id.clone());
            tables
                .instances
                .insert(instance.id.clone(), instance.clone());
        }
        let mut appended = Vec::new();
        for append in &unit.history {
            // Preserve caller order across instances.
            if let Some(staged) = staged_history.get_mut(&append.instance_id) {
                if !staged.is_empty() {
                    let entry = staged.remove(0);
                    tables
                        .history
                        .entry(entry.instance_id.clone())
                        .or_default()
                        .push(entry.clone());
                    appended.push(entry);
                }
            }
        }
        for card in unit.insert_cards.into_iter().chain(unit.update_cards) {
            tables.cards.insert(card.id.clone(), card);
        }
        for task in unit.insert_tasks.into_iter().chain(unit.update_tasks) {
            tables.tasks.insert(task.id.clone(), task);
        }

        tracing::trace!(
            instance = ?staged_instance.as_ref().map(|i| i.id.to_string()),
            history = appended.len(),
            "Unit of work committed"
        );

        Ok(CommitReceipt {
            instance: staged_instance,
            history: appended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::verify_chain;
    use approvals_types::{HistoryAction, HistoryAppend, TaskClosure};
    use chrono::Duration;

    fn seeded_store() -> (InMemoryWorkflowStore, WorkflowTemplate, Vec<Stage>) {
        let store = InMemoryWorkflowStore::new();
        let template = store
            .insert_template(WorkflowTemplate::new(
                TenantId::new("t1"),
                "expense_approval",
                "Expense approval",
            ))
            .unwrap();
        let pending = Stage::new(template.id.clone(), "PENDING", "Pending").initial();
        let approved = Stage::new(template.id.clone(), "APPROVED", "Approved")
            .with_sequence(1)
            .terminal();
        let mut changes = GraphChangeSet::new(template.id.clone(), 0);
        changes.upsert_stages = vec![pending.clone(), approved.clone()];
        changes.upsert_transitions = vec![Transition::new(
            template.id.clone(),
            pending.id.clone(),
            Some(approved.id.clone()),
            "Approve",
        )];
        let template = store.commit_graph(changes).unwrap();
        (store, template, vec![pending, approved])
    }

    fn make_instance(template: &WorkflowTemplate, stage: &Stage, source_id: &str) -> WorkflowInstance {
        WorkflowInstance::new(
            template.id.clone(),
            template.code.clone(),
            template.tenant_id.clone(),
            stage.id.clone(),
            SourceRef::new("EXPENSE", source_id),
            UserId::new("alice"),
        )
    }

    fn make_card(id: &TaskCardId) -> TaskCard {
        let now = Utc::now();
        TaskCard {
            id: id.clone(),
            tenant_id: TenantId::new("t1"),
            title: "Review".into(),
            description: String::new(),
            bucket: "backlog".into(),
            assignee_id: UserId::new("bob"),
            creator_id: UserId::new("alice"),
            watchers: vec![],
            due_at: now + Duration::hours(48),
            created_at: now,
            updated_at: now,
        }
    }

    fn start(store: &InMemoryWorkflowStore, instance: WorkflowInstance) -> WorkflowInstance {
        let mut unit = UnitOfWork::new().with_instance(InstanceWrite::Insert(instance.clone()));
        unit.append_history(HistoryAppend::new(
            instance.id.clone(),
            HistoryAction::WorkflowStarted,
            UserId::new("alice"),
            Utc::now(),
        ));
        store.commit(unit).unwrap().instance.unwrap()
    }

    #[test]
    fn test_graph_commit_bumps_revision() {
        let (store, template, stages) = seeded_store();
        assert_eq!(template.revision, 1);
        let listed = store.stages_for_template(&template.id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, stages[0].id);
        assert_eq!(store.transitions_from(&stages[0].id).unwrap().len(), 1);
    }

    #[test]
    fn test_graph_commit_rejects_stale_revision() {
        let (store, template, _) = seeded_store();
        let changes = GraphChangeSet::new(template.id.clone(), 0);
        assert!(matches!(
            store.commit_graph(changes),
            Err(StoreError::StaleWrite(_))
        ));
    }

    #[test]
    fn test_graph_commit_rejects_gaps_and_double_initial() {
        let (store, template, stages) = seeded_store();
        let mut gap = GraphChangeSet::new(template.id.clone(), template.revision);
        gap.upsert_stages = vec![Stage::new(template.id.clone(), "LATE", "Late").with_sequence(5)];
        assert!(matches!(
            store.commit_graph(gap),
            Err(StoreError::InvariantViolation(_))
        ));

        let mut double = GraphChangeSet::new(template.id.clone(), template.revision);
        let mut second = stages[1].clone();
        second.is_initial = true;
        double.upsert_stages = vec![second];
        assert!(matches!(
            store.commit_graph(double),
            Err(StoreError::InvariantViolation(_))
        ));
        // Nothing applied
        assert_eq!(store.get_template(&template.id).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn test_graph_commit_rejects_dangling_transition() {
        let (store, template, stages) = seeded_store();
        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.delete_stages = vec![stages[1].id.clone()];
        assert!(matches!(
            store.commit_graph(changes),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_duplicate_template_code() {
        let (store, _, _) = seeded_store();
        let result = store.insert_template(WorkflowTemplate::new(
            TenantId::new("t1"),
            "expense_approval",
            "Again",
        ));
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // Another tenant may reuse it
        assert!(store
            .insert_template(WorkflowTemplate::new(
                TenantId::new("t2"),
                "expense_approval",
                "Other tenant",
            ))
            .is_ok());
    }

    #[test]
    fn test_source_uniqueness_is_permanent() {
        let (store, template, stages) = seeded_store();
        let first = start(&store, make_instance(&template, &stages[0], "77"));

        let mut done = first.clone();
        done.enter_stage(stages[1].id.clone(), true, Utc::now());
        store
            .commit(UnitOfWork::new().with_instance(InstanceWrite::Update {
                instance: done,
                expected_version: first.version,
            }))
            .unwrap();

        let again = UnitOfWork::new().with_instance(InstanceWrite::Insert(make_instance(
            &template, &stages[0], "77",
        )));
        assert!(matches!(store.commit(again), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_stale_instance_write_applies_nothing() {
        let (store, template, stages) = seeded_store();
        let inst = start(&store, make_instance(&template, &stages[0], "1"));

        let mut unit = UnitOfWork::new().with_instance(InstanceWrite::Update {
            instance: inst.clone(),
            expected_version: inst.version + 7,
        });
        unit.append_history(HistoryAppend::new(
            inst.id.clone(),
            HistoryAction::Transition("Approve".into()),
            UserId::new("bob"),
            Utc::now(),
        ));
        assert!(matches!(store.commit(unit), Err(StoreError::StaleWrite(_))));
        assert_eq!(store.history_for(&inst.id).unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_instance_is_immutable() {
        let (store, template, stages) = seeded_store();
        let inst = start(&store, make_instance(&template, &stages[0], "2"));
        let mut cancelled = inst.clone();
        cancelled.cancel(Utc::now());
        let stored = store
            .commit(UnitOfWork::new().with_instance(InstanceWrite::Update {
                instance: cancelled.clone(),
                expected_version: inst.version,
            }))
            .unwrap()
            .instance
            .unwrap();

        let result = store.commit(UnitOfWork::new().with_instance(InstanceWrite::Update {
            instance: cancelled,
            expected_version: stored.version,
        }));
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[test]
    fn test_history_chain_links_and_verifies() {
        let (store, template, stages) = seeded_store();
        let inst = start(&store, make_instance(&template, &stages[0], "3"));
        let mut unit = UnitOfWork::new();
        unit.append_history(
            HistoryAppend::new(
                inst.id.clone(),
                HistoryAction::Transition("Comment".into()),
                UserId::new("bob"),
                Utc::now(),
            )
            .with_remarks(Some("looks fine".into())),
        );
        store.commit(unit).unwrap();

        let history = store.history_for(&inst.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sequence, 2);
        assert_eq!(history[1].previous_hash.as_deref(), Some(history[0].hash.as_str()));
        assert_eq!(verify_chain(&history).unwrap(), None);

        let mut tampered = history.clone();
        tampered[1].remarks = Some("rewritten".into());
        assert_eq!(verify_chain(&tampered).unwrap(), Some(2));
    }

    #[test]
    fn test_single_open_task_invariant() {
        let (store, template, stages) = seeded_store();
        let inst = start(&store, make_instance(&template, &stages[0], "4"));
        let now = Utc::now();

        let card_a = make_card(&TaskCardId::generate());
        let task_a = WorkflowTask::new(
            inst.id.clone(),
            stages[0].id.clone(),
            card_a.id.clone(),
            UserId::new("bob"),
            now,
        );
        let mut unit = UnitOfWork::new();
        unit.insert_cards.push(card_a);
        unit.insert_tasks.push(task_a.clone());
        store.commit(unit).unwrap();

        let card_b = make_card(&TaskCardId::generate());
        let task_b = WorkflowTask::new(
            inst.id.clone(),
            stages[0].id.clone(),
            card_b.id.clone(),
            UserId::new("carol"),
            now,
        );
        let mut unit = UnitOfWork::new();
        unit.insert_cards.push(card_b.clone());
        unit.insert_tasks.push(task_b.clone());
        assert!(matches!(
            store.commit(unit),
            Err(StoreError::InvariantViolation(_))
        ));
        assert!(store.get_card(&card_b.id).unwrap().is_none());

        // Closing the first in the same unit makes room for the second
        let mut closed = task_a.clone();
        closed.close(TaskClosure::Completed, now);
        let mut unit = UnitOfWork::new();
        unit.update_tasks.push(closed.clone());
        unit.insert_cards.push(card_b);
        unit.insert_tasks.push(task_b);
        store.commit(unit).unwrap();
        assert_eq!(store.open_tasks(None).unwrap().len(), 1);
        assert_eq!(store.open_tasks(Some(&UserId::new("carol"))).unwrap().len(), 1);

        // Closed tasks never change again
        let mut unit = UnitOfWork::new();
        unit.update_tasks.push(closed);
        assert!(matches!(
            store.commit(unit),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_list_instances_filters_and_pages() {
        let (store, template, stages) = seeded_store();
        for i in 0..5 {
            start(&store, make_instance(&template, &stages[0], &i.to_string()));
        }
        let filter = InstanceFilter {
            status: Some(InstanceStatus::Active),
            ..Default::default()
        };
        let page = store.list_instances(&filter, QueryWindow::new(2, 1)).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);

        let none = InstanceFilter {
            source_module: Some("PURCHASE".into()),
            ..Default::default()
        };
        assert_eq!(store.list_instances(&none, QueryWindow::all()).unwrap().total, 0);
        assert_eq!(
            store
                .count_instances_at_stage(&stages[0].id, &[InstanceStatus::Active])
                .unwrap(),
            5
        );
    }

    fn add_review_stage(store: &InMemoryWorkflowStore, template: &WorkflowTemplate) -> Stage {
        let template = store.get_template(&template.id).unwrap().unwrap();
        let review = Stage::new(template.id.clone(), "REVIEW", "Review").with_sequence(2);
        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_stages = vec![review.clone()];
        store.commit_graph(changes).unwrap();
        review
    }

    fn delete_stage(
        store: &InMemoryWorkflowStore,
        template: &WorkflowTemplate,
        stage: &Stage,
    ) -> StoreResult<WorkflowTemplate> {
        let template = store.get_template(&template.id).unwrap().unwrap();
        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.delete_stages = vec![stage.id.clone()];
        store.commit_graph(changes)
    }

    #[test]
    fn test_graph_commit_refuses_to_delete_occupied_stage() {
        let (store, template, _) = seeded_store();
        let review = add_review_stage(&store, &template);
        let inst = start(&store, make_instance(&template, &review, "10"));

        let mut suspended = inst.clone();
        suspended.suspend(&UserId::new("bob"), None, Utc::now());
        let suspended = store
            .commit(UnitOfWork::new().with_instance(InstanceWrite::Update {
                instance: suspended,
                expected_version: inst.version,
            }))
            .unwrap()
            .instance
            .unwrap();
        assert!(matches!(
            delete_stage(&store, &template, &review),
            Err(StoreError::InvariantViolation(_))
        ));
        assert!(store.get_stage(&review.id).unwrap().is_some());

        let mut cancelled = suspended.clone();
        cancelled.cancel(Utc::now());
        store
            .commit(UnitOfWork::new().with_instance(InstanceWrite::Update {
                instance: cancelled,
                expected_version: suspended.version,
            }))
            .unwrap();
        delete_stage(&store, &template, &review).unwrap();
        assert!(store.get_stage(&review.id).unwrap().is_none());
    }

    #[test]
    fn test_instance_write_requires_a_stage_of_its_template() {
        let (store, template, stages) = seeded_store();
        let review = add_review_stage(&store, &template);
        delete_stage(&store, &template, &review).unwrap();

        let orphan = UnitOfWork::new()
            .with_instance(InstanceWrite::Insert(make_instance(&template, &review, "11")));
        assert!(matches!(
            store.commit(orphan),
            Err(StoreError::InvariantViolation(_))
        ));
        assert!(store
            .find_instance_by_source(&SourceRef::new("EXPENSE", "11"))
            .unwrap()
            .is_none());

        // A stage from another template is refused too
        let travel = store
            .insert_template(WorkflowTemplate::new(TenantId::new("t1"), "travel", "Travel"))
            .unwrap();
        let other_stage = Stage::new(travel.id.clone(), "OPEN", "Open").initial();
        let mut changes = GraphChangeSet::new(travel.id.clone(), travel.revision);
        changes.upsert_stages = vec![other_stage.clone()];
        store.commit_graph(changes).unwrap();

        let inst = start(&store, make_instance(&template, &stages[0], "12"));
        let mut moved = inst.clone();
        moved.current_stage_id = other_stage.id.clone();
        let mut unit = UnitOfWork::new().with_instance(InstanceWrite::Update {
            instance: moved,
            expected_version: inst.version,
        });
        unit.append_history(HistoryAppend::new(
            inst.id.clone(),
            HistoryAction::Transition("Approve".into()),
            UserId::new("bob"),
            Utc::now(),
        ));
        assert!(matches!(
            store.commit(unit),
            Err(StoreError::InvariantViolation(_))
        ));
        assert_eq!(store.history_for(&inst.id).unwrap().len(), 1);
        assert_eq!(
            store.get_instance(&inst.id).unwrap().unwrap().current_stage_id,
            stages[0].id
        );
    }

    #[test]
    fn test_template_save_compares_revision() {
        let store = InMemoryWorkflowStore::new();
        let template = store
            .insert_template(WorkflowTemplate::new(TenantId::new("t1"), "po", "PO"))
            .unwrap();

        let mut deleted = template.clone();
        deleted.deleted_at = Some(Utc::now());
        let saved = store.save_templates(vec![deleted]).unwrap();
        assert_eq!(saved[0].revision, template.revision + 1);

        let mut stale = template.clone();
        stale.name = "Purchase orders".into();
        assert!(matches!(
            store.save_templates(vec![stale]),
            Err(StoreError::StaleWrite(_))
        ));
        let stored = store.get_template(&template.id).unwrap().unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.name, "PO");

        let twice = vec![stored.clone(), stored];
        assert!(matches!(
            store.save_templates(twice),
            Err(StoreError::InvalidInput(_))
        ));
    }
}
