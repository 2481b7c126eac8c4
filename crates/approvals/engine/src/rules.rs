//! Domain rule sets: per-module business logic plugged into the engine
//!
//! Each source module (`EXPENSE`, `PURCHASE`, ...) may register one
//! [`DomainRuleSet`]. It loads the business entity behind a source id,
//! adds module-specific validation, formats task cards and receives the
//! status sync after every stage change. The engine only ever talks to the
//! [`RuleRegistry`].

use approvals_types::{
    Metadata, Stage, SyncPayload, Transition, UserId, WorkflowInstance,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Rule set failure
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("source entity {module}/{source_id} not found")]
    EntityNotFound { module: String, source_id: String },

    #[error("rule set failed: {0}")]
    Failed(String),
}

/// The data rules are evaluated against
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleContext {
    /// Flattened view of the source entity (and request metadata)
    pub fields: Metadata,
    /// The person who originally raised the business entity
    pub requester: Option<UserId>,
}

impl RuleContext {
    /// Look up a field by dotted path (`totals.amount`)
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut value = self.fields.get(first)?;
        for part in parts {
            value = match value {
                serde_json::Value::Object(map) => map.get(part)?,
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    /// Numeric field value; numeric strings are accepted
    pub fn number(&self, path: &str) -> Option<f64> {
        match self.field(path)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// What a rule set sees when asked to validate a transition
#[derive(Clone, Copy, Debug)]
pub struct RuleInput<'a> {
    pub instance: &'a WorkflowInstance,
    pub transition: &'a Transition,
    /// `None` for informational actions
    pub target: Option<&'a Stage>,
    pub performer: &'a UserId,
    pub remarks: Option<&'a str>,
    pub metadata: &'a Metadata,
}

/// Human-readable task content
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskDetails {
    pub title: String,
    pub description: String,
    /// Watchers beyond creator and assignee
    pub extra_watchers: Vec<UserId>,
}

/// Module-specific behaviour
pub trait DomainRuleSet: Send + Sync {
    /// The source module this rule set serves
    fn module(&self) -> &str;

    /// Load the source entity behind `source_id`
    fn resolve_context(
        &self,
        source_id: &str,
        instance: &WorkflowInstance,
    ) -> Result<RuleContext, RuleError>;

    /// Extra validation; every returned string is one error
    fn validate(&self, _input: &RuleInput<'_>, _context: &RuleContext) -> Vec<String> {
        Vec::new()
    }

    /// Task card content for an instance entering `stage`
    fn format_task(
        &self,
        instance: &WorkflowInstance,
        stage: &Stage,
        context: &RuleContext,
    ) -> TaskDetails {
        let mut details = default_task_details(instance, stage);
        details.extra_watchers.extend(context.requester.clone());
        details
    }

    /// Mirror the workflow status onto the business entity
    fn sync_status(&self, _payload: &SyncPayload) -> Result<(), RuleError> {
        Ok(())
    }
}

/// Task content used when no rule set is registered for a module
pub fn default_task_details(instance: &WorkflowInstance, stage: &Stage) -> TaskDetails {
    TaskDetails {
        title: format!("{} {}: {}", instance.source.module, instance.source.id, stage.name),
        description: format!(
            "Workflow '{}' is waiting at stage '{}' for {}.",
            instance.template_code, stage.name, instance.source
        ),
        extra_watchers: Vec::new(),
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Module name → rule set
#[derive(Default)]
pub struct RuleRegistry {
    rule_sets: HashMap<String, Arc<dyn DomainRuleSet>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule set, replacing any previous one for the module
    pub fn register(&mut self, rule_set: Arc<dyn DomainRuleSet>) {
        let module = rule_set.module().to_string();
        tracing::debug!(module = %module, "Domain rule set registered");
        self.rule_sets.insert(module, rule_set);
    }

    pub fn with(mut self, rule_set: Arc<dyn DomainRuleSet>) -> Self {
        self.register(rule_set);
        self
    }

    pub fn get(&self, module: &str) -> Option<&Arc<dyn DomainRuleSet>> {
        self.rule_sets.get(module)
    }

    pub fn modules(&self) -> Vec<&str> {
        let mut modules: Vec<_> = self.rule_sets.keys().map(String::as_str).collect();
        modules.sort_unstable();
        modules
    }

    /// Build the rule context for an instance.
    ///
    /// Instance metadata is the base, request metadata overlays it and the
    /// loaded source entity overlays both.
    pub fn context_for(
        &self,
        instance: &WorkflowInstance,
        request_metadata: &Metadata,
    ) -> Result<RuleContext, RuleError> {
        let mut fields = instance.metadata.clone();
        fields.extend(request_metadata.clone());
        let mut context = RuleContext {
            fields,
            requester: None,
        };
        if let Some(rule_set) = self.get(&instance.source.module) {
            let loaded = rule_set.resolve_context(&instance.source.id, instance)?;
            context.fields.extend(loaded.fields);
            context.requester = loaded.requester;
        }
        Ok(context)
    }

    pub fn format_task(
        &self,
        instance: &WorkflowInstance,
        stage: &Stage,
        context: &RuleContext,
    ) -> TaskDetails {
        match self.get(&instance.source.module) {
            Some(rule_set) => rule_set.format_task(instance, stage, context),
            None => default_task_details(instance, stage),
        }
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("modules", &self.modules())
            .finish()
    }
}

// ── Entity-backed rule set ───────────────────────────────────────────

/// A rule set backed by an in-memory table of source entities.
///
/// Suited to embedding hosts that push entity snapshots into the engine,
/// and to tests. Supports a minimum remark length per action and records
/// every status sync it receives.
#[derive(Debug)]
pub struct EntityRuleSet {
    module: String,
    label: String,
    requester_field: Option<String>,
    min_remarks: Vec<(String, usize)>,
    entities: RwLock<HashMap<String, Metadata>>,
    synced: RwLock<Vec<SyncPayload>>,
}

impl EntityRuleSet {
    pub fn new(module: impl Into<String>) -> Self {
        let module = module.into();
        Self {
            label: module.clone(),
            module,
            requester_field: None,
            min_remarks: Vec::new(),
            entities: RwLock::new(HashMap::new()),
            synced: RwLock::new(Vec::new()),
        }
    }

    /// Human label used in task titles (defaults to the module name)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Entity field holding the requester's user id
    pub fn with_requester_field(mut self, field: impl Into<String>) -> Self {
        self.requester_field = Some(field.into());
        self
    }

    /// Require remarks of at least `min` characters for `action`
    pub fn with_min_remarks(mut self, action: impl Into<String>, min: usize) -> Self {
        self.min_remarks.push((action.into(), min));
        self
    }

    pub fn with_entity(self, source_id: impl Into<String>, fields: Metadata) -> Self {
        if let Ok(mut entities) = self.entities.write() {
            entities.insert(source_id.into(), fields);
        }
        self
    }

    pub fn put_entity(&self, source_id: impl Into<String>, fields: Metadata) -> Result<(), RuleError> {
        self.entities
            .write()
            .map_err(|_| RuleError::Failed("entity table lock poisoned".into()))?
            .insert(source_id.into(), fields);
        Ok(())
    }

    /// Current snapshot of an entity, including mirrored workflow status
    pub fn entity(&self, source_id: &str) -> Option<Metadata> {
        self.entities.read().ok()?.get(source_id).cloned()
    }

    /// Every sync payload received so far
    pub fn synced(&self) -> Vec<SyncPayload> {
        self.synced.read().map(|s| s.clone()).unwrap_or_default()
    }
}

impl DomainRuleSet for EntityRuleSet {
    fn module(&self) -> &str {
        &self.module
    }

    fn resolve_context(
        &self,
        source_id: &str,
        _instance: &WorkflowInstance,
    ) -> Result<RuleContext, RuleError> {
        let entities = self
            .entities
            .read()
            .map_err(|_| RuleError::Failed("entity table lock poisoned".into()))?;
        let fields = entities
            .get(source_id)
            .cloned()
            .ok_or_else(|| RuleError::EntityNotFound {
                module: self.module.clone(),
                source_id: source_id.to_string(),
            })?;
        let requester = self
            .requester_field
            .as_ref()
            .and_then(|f| fields.get(f))
            .and_then(|v| v.as_str())
            .map(UserId::new);
        Ok(RuleContext { fields, requester })
    }

    fn validate(&self, input: &RuleInput<'_>, _context: &RuleContext) -> Vec<String> {
        let remarks_len = input.remarks.map_or(0, |r| r.trim().chars().count());
        self.min_remarks
            .iter()
            .filter(|(action, _)| input.transition.matches_action(action))
            .filter(|(_, min)| remarks_len < *min)
            .map(|(action, min)| {
                format!("{} '{action}' requires remarks of at least {min} characters", self.label)
            })
            .collect()
    }

    fn format_task(
        &self,
        instance: &WorkflowInstance,
        stage: &Stage,
        context: &RuleContext,
    ) -> TaskDetails {
        let mut description = format!("{} {} awaits {}.", self.label, instance.source.id, stage.name);
        if let Some(amount) = context.number("amount") {
            description.push_str(&format!(" Amount: {amount:.2}."));
        }
        TaskDetails {
            title: format!("{} {}: {}", self.label, instance.source.id, stage.name),
            description,
            extra_watchers: context.requester.iter().cloned().collect(),
        }
    }

    fn sync_status(&self, payload: &SyncPayload) -> Result<(), RuleError> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| RuleError::Failed("entity table lock poisoned".into()))?;
        if let Some(entity) = entities.get_mut(&payload.source_id) {
            entity.insert(
                "workflow_status".to_string(),
                serde_json::Value::String(payload.stage_key.clone()),
            );
        }
        drop(entities);
        self.synced
            .write()
            .map_err(|_| RuleError::Failed("sync log lock poisoned".into()))?
            .push(payload.clone());
        Ok(())
    }
}
