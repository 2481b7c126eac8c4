//! Stage graph manager: structural editing of a template's stages and
//! transitions
//!
//! Every operation reads the current graph, computes the complete set of
//! stage/transition writes it implies (sequence shifts, initial-flag
//! clearing, cascaded transition removal) and commits them as one
//! revision-checked [`GraphChangeSet`]. The graph is therefore never
//! observable with gaps in its sequences or two initial stages.

use approvals_store::{GraphChangeSet, WorkflowStore};
use approvals_types::{
    AssigneePolicy, InstanceStatus, Stage, StageId, TemplateId, Transition, TransitionConditions,
    TransitionId, WorkflowError, WorkflowResult, WorkflowTemplate,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ── Requests ─────────────────────────────────────────────────────────

/// A stage to be created
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewStage {
    pub key: String,
    pub name: String,
    pub color: Option<String>,
    /// Insert position; `None` appends. Positions past the end append.
    pub sequence: Option<u32>,
    pub is_initial: bool,
    pub is_final: bool,
    pub assignee: AssigneePolicy,
}

impl NewStage {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
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

/// Partial stage update; sequence changes go through
/// [`StageGraphManager::reorder_stages`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageUpdate {
    pub key: Option<String>,
    pub name: Option<String>,
    pub color: Option<Option<String>>,
    pub is_initial: Option<bool>,
    pub is_final: Option<bool>,
    pub assignee: Option<AssigneePolicy>,
}

/// A transition to be created
#[derive(Clone, Debug, PartialEq)]
pub struct NewTransition {
    pub from_stage_id: StageId,
    pub to_stage_id: Option<StageId>,
    pub button_name: String,
    pub condition_type: Option<String>,
    pub conditions: TransitionConditions,
}

impl NewTransition {
    pub fn new(from: StageId, to: Option<StageId>, button_name: impl Into<String>) -> Self {
        Self {
            from_stage_id: from,
            to_stage_id: to,
            button_name: button_name.into(),
            condition_type: None,
            conditions: TransitionConditions::default(),
        }
    }

    pub fn with_condition_type(mut self, condition_type: impl Into<String>) -> Self {
        self.condition_type = Some(condition_type.into());
        self
    }

    pub fn with_conditions(mut self, conditions: TransitionConditions) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Partial transition update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransitionUpdate {
    pub to_stage_id: Option<Option<StageId>>,
    pub button_name: Option<String>,
    pub condition_type: Option<Option<String>>,
    pub conditions: Option<TransitionConditions>,
}

// ── Template report ──────────────────────────────────────────────────

/// A structural problem found by [`StageGraphManager::validate_template`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum TemplateProblem {
    NoInitialStage,
    NoFinalStage,
    /// Not reachable from the initial stage
    UnreachableStage { key: String },
    /// Non-final stage with no transition leading elsewhere
    DeadEndStage { key: String },
}

impl std::fmt::Display for TemplateProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoInitialStage => write!(f, "no stage is marked initial"),
            Self::NoFinalStage => write!(f, "no stage is marked final"),
            Self::UnreachableStage { key } => {
                write!(f, "stage '{key}' is unreachable from the initial stage")
            }
            Self::DeadEndStage { key } => {
                write!(f, "stage '{key}' is not final but has no way out")
            }
        }
    }
}

/// Result of a structural template check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReport {
    pub template_id: TemplateId,
    pub stage_count: usize,
    pub transition_count: usize,
    pub problems: Vec<TemplateProblem>,
}

impl TemplateReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

// ── Manager ──────────────────────────────────────────────────────────

/// Stage/transition CRUD with structural integrity
#[derive(Clone)]
pub struct StageGraphManager {
    store: Arc<dyn WorkflowStore>,
}

impl StageGraphManager {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    fn load(&self, template_id: &TemplateId) -> WorkflowResult<(WorkflowTemplate, Vec<Stage>)> {
        let template = self
            .store
            .get_template(template_id)?
            .filter(|t| !t.is_deleted())
            .ok_or_else(|| WorkflowError::TemplateNotFound(template_id.to_string()))?;
        let stages = self.store.stages_for_template(template_id)?;
        Ok((template, stages))
    }

    pub fn stages(&self, template_id: &TemplateId) -> WorkflowResult<Vec<Stage>> {
        Ok(self.load(template_id)?.1)
    }

    pub fn transitions(&self, template_id: &TemplateId) -> WorkflowResult<Vec<Transition>> {
        self.load(template_id)?;
        Ok(self.store.transitions_for_template(template_id)?)
    }

    pub fn get_stage(&self, id: &StageId) -> WorkflowResult<Stage> {
        self.store
            .get_stage(id)?
            .ok_or_else(|| WorkflowError::StageNotFound(id.clone()))
    }

    pub fn get_transition(&self, id: &TransitionId) -> WorkflowResult<Transition> {
        self.store
            .get_transition(id)?
            .ok_or_else(|| WorkflowError::TransitionNotFound(id.clone()))
    }

    // ── Stages ───────────────────────────────────────────────────────

    /// Create a stage, shifting stages at or after its position up by one
    pub fn create_stage(&self, template_id: &TemplateId, new: NewStage) -> WorkflowResult<Stage> {
        check_label("stage key", &new.key)?;
        check_label("stage name", &new.name)?;
        new.assignee.validate()?;

        let (template, stages) = self.load(template_id)?;
        let key = new.key.trim().to_string();
        if stages.iter().any(|s| s.key == key) {
            return Err(WorkflowError::Conflict(format!(
                "stage key '{key}' already exists in template {}",
                template.code
            )));
        }

        let len = stages.len() as u32;
        let position = new.sequence.map_or(len, |s| s.min(len));

        let mut next = stages.clone();
        for stage in &mut next {
            if stage.sequence >= position {
                stage.sequence += 1;
            }
            if new.is_initial {
                stage.is_initial = false;
            }
        }

        let mut stage = Stage::new(template.id.clone(), key, new.name.trim())
            .with_sequence(position)
            .with_assignee(new.assignee);
        stage.color = new.color;
        stage.is_initial = new.is_initial;
        stage.is_final = new.is_final;

        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_stages = changed(&stages, &next);
        changes.upsert_stages.push(stage.clone());
        self.store.commit_graph(changes)?;

        tracing::info!(
            template = %template.id,
            stage = %stage.key,
            sequence = stage.sequence,
            "Stage created"
        );
        Ok(stage)
    }

    pub fn update_stage(&self, id: &StageId, update: StageUpdate) -> WorkflowResult<Stage> {
        let current = self.get_stage(id)?;
        let (template, stages) = self.load(&current.template_id)?;

        let mut next = stages.clone();
        let Some(index) = next.iter().position(|s| &s.id == id) else {
            return Err(WorkflowError::StageNotFound(id.clone()));
        };

        if let Some(key) = &update.key {
            check_label("stage key", key)?;
            let key = key.trim();
            if next.iter().any(|s| &s.id != id && s.key == key) {
                return Err(WorkflowError::Conflict(format!(
                    "stage key '{key}' already exists in template {}",
                    template.code
                )));
            }
            next[index].key = key.to_string();
        }
        if let Some(name) = &update.name {
            check_label("stage name", name)?;
            next[index].name = name.trim().to_string();
        }
        if let Some(color) = update.color {
            next[index].color = color;
        }
        if let Some(assignee) = update.assignee {
            assignee.validate()?;
            next[index].assignee = assignee;
        }
        if let Some(is_final) = update.is_final {
            next[index].is_final = is_final;
        }
        if let Some(is_initial) = update.is_initial {
            if is_initial {
                for stage in &mut next {
                    stage.is_initial = false;
                }
            }
            next[index].is_initial = is_initial;
        }

        let updated = next[index].clone();
        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_stages = changed(&stages, &next);
        if !changes.upsert_stages.is_empty() {
            self.store.commit_graph(changes)?;
            tracing::info!(template = %template.id, stage = %updated.key, "Stage updated");
        }
        Ok(updated)
    }

    /// Delete a stage and its outgoing transitions.
    ///
    /// Fails if another stage has a transition into it, or if an active or
    /// suspended instance currently sits on it.
    pub fn delete_stage(&self, id: &StageId) -> WorkflowResult<()> {
        let stage = self.get_stage(id)?;
        let (template, stages) = self.load(&stage.template_id)?;
        let transitions = self.store.transitions_for_template(&template.id)?;

        let incoming: Vec<&Transition> = transitions
            .iter()
            .filter(|t| t.to_stage_id.as_ref() == Some(id) && &t.from_stage_id != id)
            .collect();
        if !incoming.is_empty() {
            return Err(WorkflowError::IllegalState(format!(
                "stage '{}' is the target of {} transition(s) from other stages",
                stage.key,
                incoming.len()
            )));
        }

        let live = self.store.count_instances_at_stage(
            id,
            &[InstanceStatus::Active, InstanceStatus::Suspended],
        )?;
        if live > 0 {
            return Err(WorkflowError::IllegalState(format!(
                "stage '{}' has {live} live instance(s)",
                stage.key
            )));
        }

        let mut next: Vec<Stage> = stages.iter().filter(|s| &s.id != id).cloned().collect();
        for other in &mut next {
            if other.sequence > stage.sequence {
                other.sequence -= 1;
            }
        }

        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.delete_stages = vec![id.clone()];
        changes.delete_transitions = transitions
            .iter()
            .filter(|t| &t.from_stage_id == id)
            .map(|t| t.id.clone())
            .collect();
        changes.upsert_stages = changed(&stages, &next);
        let removed = changes.delete_transitions.len();
        self.store.commit_graph(changes)?;

        tracing::info!(
            template = %template.id,
            stage = %stage.key,
            transitions_removed = removed,
            "Stage deleted"
        );
        Ok(())
    }

    /// Apply a full permutation of stage positions atomically.
    ///
    /// Any id outside the template rejects the whole batch.
    pub fn reorder_stages(
        &self,
        template_id: &TemplateId,
        order: &[(StageId, u32)],
    ) -> WorkflowResult<Vec<Stage>> {
        let (template, stages) = self.load(template_id)?;
        let by_id: HashMap<&StageId, &Stage> = stages.iter().map(|s| (&s.id, s)).collect();

        if let Some((foreign, _)) = order.iter().find(|(id, _)| !by_id.contains_key(id)) {
            return Err(WorkflowError::IllegalState(format!(
                "stage {foreign} does not belong to template {}",
                template.code
            )));
        }

        let ids: HashSet<&StageId> = order.iter().map(|(id, _)| id).collect();
        let mut positions: Vec<u32> = order.iter().map(|(_, seq)| *seq).collect();
        positions.sort_unstable();
        let dense = positions.iter().enumerate().all(|(i, p)| *p as usize == i);
        if ids.len() != order.len() || order.len() != stages.len() || !dense {
            return Err(WorkflowError::InvalidDefinition(format!(
                "reorder must assign every one of the {} stages a distinct position 0..{}",
                stages.len(),
                stages.len()
            )));
        }

        let mut next = stages.clone();
        let target: HashMap<&StageId, u32> = order.iter().map(|(id, seq)| (id, *seq)).collect();
        for stage in &mut next {
            if let Some(seq) = target.get(&stage.id) {
                stage.sequence = *seq;
            }
        }

        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_stages = changed(&stages, &next);
        if !changes.upsert_stages.is_empty() {
            self.store.commit_graph(changes)?;
            tracing::info!(template = %template.id, stages = next.len(), "Stages reordered");
        }
        next.sort_by_key(|s| s.sequence);
        Ok(next)
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn create_transition(&self, new: NewTransition) -> WorkflowResult<Transition> {
        let from = self.get_stage(&new.from_stage_id)?;
        let (template, _) = self.load(&from.template_id)?;
        self.check_target(&from, new.to_stage_id.as_ref())?;
        check_label("button name", &new.button_name)?;
        new.conditions.validate()?;

        let mut transition = Transition::new(
            template.id.clone(),
            from.id.clone(),
            new.to_stage_id,
            new.button_name.trim(),
        )
        .with_conditions(new.conditions);
        transition.condition_type = normalize_condition_type(new.condition_type);

        let siblings = self.store.transitions_from(&from.id)?;
        check_action_unique(&transition, &siblings, &from)?;

        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_transitions = vec![transition.clone()];
        self.store.commit_graph(changes)?;

        tracing::info!(
            template = %template.id,
            from = %from.key,
            action = %transition.button_name,
            "Transition created"
        );
        Ok(transition)
    }

    pub fn update_transition(
        &self,
        id: &TransitionId,
        update: TransitionUpdate,
    ) -> WorkflowResult<Transition> {
        let mut transition = self.get_transition(id)?;
        let from = self.get_stage(&transition.from_stage_id)?;
        let (template, _) = self.load(&transition.template_id)?;

        if let Some(to) = update.to_stage_id {
            self.check_target(&from, to.as_ref())?;
            transition.to_stage_id = to;
        }
        if let Some(button) = update.button_name {
            check_label("button name", &button)?;
            transition.button_name = button.trim().to_string();
        }
        if let Some(condition_type) = update.condition_type {
            transition.condition_type = normalize_condition_type(condition_type);
        }
        if let Some(conditions) = update.conditions {
            conditions.validate()?;
            transition.conditions = conditions;
        }

        let siblings = self.store.transitions_from(&from.id)?;
        check_action_unique(&transition, &siblings, &from)?;

        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.upsert_transitions = vec![transition.clone()];
        self.store.commit_graph(changes)?;
        tracing::info!(template = %template.id, transition = %transition.id, "Transition updated");
        Ok(transition)
    }

    pub fn delete_transition(&self, id: &TransitionId) -> WorkflowResult<()> {
        let transition = self.get_transition(id)?;
        let (template, _) = self.load(&transition.template_id)?;
        let mut changes = GraphChangeSet::new(template.id.clone(), template.revision);
        changes.delete_transitions = vec![id.clone()];
        self.store.commit_graph(changes)?;
        tracing::info!(template = %template.id, transition = %id, "Transition deleted");
        Ok(())
    }

    fn check_target(&self, from: &Stage, to: Option<&StageId>) -> WorkflowResult<()> {
        let Some(to) = to else {
            return Ok(());
        };
        let target = self.get_stage(to)?;
        if target.template_id != from.template_id {
            return Err(WorkflowError::InvalidDefinition(format!(
                "transition from '{}' cannot target stage '{}' of another template",
                from.key, target.key
            )));
        }
        Ok(())
    }

    // ── Structural report ────────────────────────────────────────────

    /// Check a template for structural problems.
    ///
    /// Stages are placed in an arena indexed by position with an explicit
    /// adjacency list; reachability is an iterative depth-first walk from
    /// the initial stage.
    pub fn validate_template(&self, template_id: &TemplateId) -> WorkflowResult<TemplateReport> {
        let (template, stages) = self.load(template_id)?;
        let transitions = self.store.transitions_for_template(&template.id)?;

        let index: HashMap<&StageId, usize> =
            stages.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for transition in &transitions {
            let (Some(&from), Some(to)) = (
                index.get(&transition.from_stage_id),
                transition.to_stage_id.as_ref().and_then(|to| index.get(to)),
            ) else {
                continue;
            };
            if from != *to {
                adjacency[from].push(*to);
            }
        }

        let mut problems = Vec::new();
        let initial = stages.iter().position(|s| s.is_initial);
        if initial.is_none() {
            problems.push(TemplateProblem::NoInitialStage);
        }
        if !stages.iter().any(|s| s.is_final) {
            problems.push(TemplateProblem::NoFinalStage);
        }

        if let Some(start) = initial {
            let mut visited = vec![false; stages.len()];
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                if std::mem::replace(&mut visited[node], true) {
                    continue;
                }
                stack.extend(adjacency[node].iter().copied().filter(|n| !visited[*n]));
            }
            for (i, stage) in stages.iter().enumerate() {
                if !visited[i] {
                    problems.push(TemplateProblem::UnreachableStage {
                        key: stage.key.clone(),
                    });
                }
            }
        }

        for (i, stage) in stages.iter().enumerate() {
            if !stage.is_final && adjacency[i].is_empty() {
                problems.push(TemplateProblem::DeadEndStage {
                    key: stage.key.clone(),
                });
            }
        }

        tracing::debug!(
            template = %template.id,
            problems = problems.len(),
            "Template validated"
        );
        Ok(TemplateReport {
            template_id: template.id,
            stage_count: stages.len(),
            transition_count: transitions.len(),
            problems,
        })
    }
}

impl std::fmt::Debug for StageGraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraphManager").finish_non_exhaustive()
    }
}

fn check_label(what: &str, value: &str) -> WorkflowResult<()> {
    if value.trim().is_empty() {
        return Err(WorkflowError::InvalidDefinition(format!("{what} must not be blank")));
    }
    Ok(())
}

fn normalize_condition_type(condition_type: Option<String>) -> Option<String> {
    condition_type
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

/// Two transitions leaving one stage may not answer to the same action
fn check_action_unique(
    transition: &Transition,
    siblings: &[Transition],
    from: &Stage,
) -> WorkflowResult<()> {
    let keys: Vec<&str> = std::iter::once(transition.button_name.as_str())
        .chain(transition.condition_type.as_deref())
        .collect();
    let clash = siblings
        .iter()
        .filter(|s| s.id != transition.id)
        .find(|s| keys.iter().any(|k| s.matches_action(k)));
    match clash {
        Some(other) => Err(WorkflowError::Conflict(format!(
            "stage '{}' already has a transition answering to '{}'",
            from.key, other.button_name
        ))),
        None => Ok(()),
    }
}

/// Stages in `after` that differ from their `before` counterpart
fn changed(before: &[Stage], after: &[Stage]) -> Vec<Stage> {
    let before: HashMap<&StageId, &Stage> = before.iter().map(|s| (&s.id, s)).collect();
    after
        .iter()
        .filter(|s| before.get(&s.id).map_or(true, |b| *b != *s))
        .cloned()
        .collect()
}
