//! Template manifests: a whole template declared in one JSON or TOML file
//!
//! Stages are referenced by key. Importing goes through the template
//! registry and the stage graph manager, so a manifest is subject to the
//! same structural rules as interactive authoring.

use crate::graph::{NewStage, NewTransition, StageGraphManager, TemplateReport};
use crate::templates::TemplateRegistry;
use approvals_types::{
    AssigneePolicy, AssigneeType, Stage, TenantId, Transition, TransitionConditions,
    WorkflowError, WorkflowResult, WorkflowTemplate,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Manifest loading errors
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML manifest: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported manifest format '{0}' (expected .json or .toml)")]
    UnsupportedFormat(String),
}

/// Declarative template definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateManifest {
    pub tenant_id: TenantId,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub stages: Vec<StageManifest>,
    #[serde(default)]
    pub transitions: Vec<TransitionManifest>,
}

fn default_true() -> bool {
    true
}

/// One stage, listed in sequence order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub initial: bool,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_type: Option<AssigneeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
}

/// One transition between stage keys
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionManifest {
    pub from: String,
    /// Omitted for informational actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub button: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_type: Option<String>,
    #[serde(default)]
    pub conditions: TransitionConditions,
}

impl TemplateManifest {
    pub fn from_json_str(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a manifest, choosing the format by file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            other => Err(ManifestError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Check the manifest without touching any store. Returns every
    /// problem found.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.code.trim().is_empty() {
            problems.push("template code must not be blank".to_string());
        }

        let mut keys = HashSet::new();
        for stage in &self.stages {
            if stage.key.trim().is_empty() {
                problems.push("stage key must not be blank".to_string());
            } else if !keys.insert(stage.key.trim()) {
                problems.push(format!("duplicate stage key '{}'", stage.key));
            }
            if let Err(e) = stage.policy() {
                problems.push(format!("stage '{}': {e}", stage.key));
            }
        }
        let initial = self.stages.iter().filter(|s| s.initial).count();
        if initial > 1 {
            problems.push(format!("{initial} stages are marked initial"));
        }

        for transition in &self.transitions {
            let label = format!("transition '{}' from '{}'", transition.button, transition.from);
            if !keys.contains(transition.from.trim()) {
                problems.push(format!("{label}: unknown stage '{}'", transition.from));
            }
            if let Some(to) = &transition.to {
                if !keys.contains(to.trim()) {
                    problems.push(format!("{label}: unknown stage '{to}'"));
                }
            }
            if transition.button.trim().is_empty() {
                problems.push(format!("{label}: button must not be blank"));
            }
            for problem in transition.conditions.problems() {
                problems.push(format!("{label}: {problem}"));
            }
        }
        problems
    }
}

impl StageManifest {
    fn policy(&self) -> WorkflowResult<AssigneePolicy> {
        AssigneePolicy::from_parts(self.assignee_type, self.assignee_id.as_deref())
    }
}

/// What an import produced
#[derive(Clone, Debug, PartialEq)]
pub struct ImportedTemplate {
    pub template: WorkflowTemplate,
    pub stages: Vec<Stage>,
    pub transitions: Vec<Transition>,
    pub report: TemplateReport,
}

/// Author a manifest into the store.
///
/// The manifest is checked up front; if authoring still fails part way
/// through, the half-built template is soft-deleted.
pub fn import_manifest(
    templates: &TemplateRegistry,
    graph: &StageGraphManager,
    manifest: &TemplateManifest,
) -> WorkflowResult<ImportedTemplate> {
    let problems = manifest.problems();
    if !problems.is_empty() {
        return Err(WorkflowError::Validation(problems.into()));
    }

    let template = templates.create_template(
        manifest.tenant_id.clone(),
        &manifest.code,
        &manifest.name,
        &manifest.description,
    )?;

    match author(templates, graph, manifest, &template) {
        Ok(imported) => {
            tracing::info!(
                template = %imported.template.id,
                code = %imported.template.code,
                stages = imported.stages.len(),
                transitions = imported.transitions.len(),
                "Template manifest imported"
            );
            Ok(imported)
        }
        Err(e) => {
            if let Err(cleanup) = templates.soft_delete_template(&template.id) {
                tracing::warn!(
                    template = %template.id,
                    error = %cleanup,
                    "Failed to retire partially imported template"
                );
            }
            Err(e)
        }
    }
}

fn author(
    templates: &TemplateRegistry,
    graph: &StageGraphManager,
    manifest: &TemplateManifest,
    template: &WorkflowTemplate,
) -> WorkflowResult<ImportedTemplate> {
    let mut by_key = HashMap::new();
    for stage in &manifest.stages {
        let mut new = NewStage::new(stage.key.trim(), &stage.name).with_assignee(stage.policy()?);
        new.color = stage.color.clone();
        new.is_initial = stage.initial;
        new.is_final = stage.is_final;
        let created = graph.create_stage(&template.id, new)?;
        by_key.insert(created.key.clone(), created.id.clone());
    }

    for transition in &manifest.transitions {
        let from = by_key
            .get(transition.from.trim())
            .cloned()
            .ok_or_else(|| WorkflowError::InvalidDefinition(format!("unknown stage '{}'", transition.from)))?;
        let to = match &transition.to {
            Some(key) => Some(
                by_key
                    .get(key.trim())
                    .cloned()
                    .ok_or_else(|| WorkflowError::InvalidDefinition(format!("unknown stage '{key}'")))?,
            ),
            None => None,
        };
        let mut new = NewTransition::new(from, to, &transition.button)
            .with_conditions(transition.conditions.clone());
        new.condition_type = transition.condition_type.clone();
        graph.create_transition(new)?;
    }

    let mut template = templates.get_template(&template.id)?;
    if !manifest.active {
        template = templates.update_template(
            &template.id,
            crate::templates::TemplateUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )?;
    }
    if manifest.default {
        template = templates.set_default_template(&template.id)?;
    }

    Ok(ImportedTemplate {
        stages: graph.stages(&template.id)?,
        transitions: graph.transitions(&template.id)?,
        report: graph.validate_template(&template.id)?,
        template,
    })
}
