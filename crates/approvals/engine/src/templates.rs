//! Template registry: create, look up and retire workflow templates
//!
//! Templates are unique by code per tenant among non-deleted templates.
//! Soft deletion frees the code for reuse. At most one template per tenant
//! is the default.

use approvals_store::{StoreError, WorkflowStore};
use approvals_types::{TemplateId, TenantId, WorkflowError, WorkflowResult, WorkflowTemplate};
use chrono::Utc;
use std::sync::Arc;

/// Partial update of a template's descriptive fields
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// Template CRUD over the store
#[derive(Clone)]
pub struct TemplateRegistry {
    store: Arc<dyn WorkflowStore>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    pub fn create_template(
        &self,
        tenant_id: TenantId,
        code: &str,
        name: &str,
        description: &str,
    ) -> WorkflowResult<WorkflowTemplate> {
        let code = code.trim();
        if code.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "template code must not be blank".to_string(),
            ));
        }
        if name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "template name must not be blank".to_string(),
            ));
        }
        let duplicate = || WorkflowError::DuplicateTemplateCode {
            tenant: tenant_id.to_string(),
            code: code.to_string(),
        };
        if self.store.find_template_by_code(&tenant_id, code)?.is_some() {
            return Err(duplicate());
        }

        let template = WorkflowTemplate::new(tenant_id.clone(), code, name.trim())
            .with_description(description.trim());
        let template = self.store.insert_template(template).map_err(|e| match e {
            StoreError::Conflict(_) => duplicate(),
            other => other.into(),
        })?;

        tracing::info!(
            template = %template.id,
            tenant = %template.tenant_id,
            code = %template.code,
            "Workflow template created"
        );
        Ok(template)
    }

    /// A non-deleted template by id
    pub fn get_template(&self, id: &TemplateId) -> WorkflowResult<WorkflowTemplate> {
        self.store
            .get_template(id)?
            .filter(|t| !t.is_deleted())
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.to_string()))
    }

    pub fn find_by_code(
        &self,
        tenant_id: &TenantId,
        code: &str,
    ) -> WorkflowResult<Option<WorkflowTemplate>> {
        Ok(self.store.find_template_by_code(tenant_id, code)?)
    }

    pub fn list_templates(
        &self,
        tenant_id: &TenantId,
        include_inactive: bool,
    ) -> WorkflowResult<Vec<WorkflowTemplate>> {
        Ok(self
            .store
            .list_templates(tenant_id)?
            .into_iter()
            .filter(|t| include_inactive || t.is_active)
            .collect())
    }

    pub fn update_template(
        &self,
        id: &TemplateId,
        update: TemplateUpdate,
    ) -> WorkflowResult<WorkflowTemplate> {
        let mut template = self.get_template(id)?;
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition(
                    "template name must not be blank".to_string(),
                ));
            }
            template.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            template.description = description.trim().to_string();
        }
        if let Some(active) = update.is_active {
            template.is_active = active;
        }
        template.updated_at = Utc::now();
        let template = self.save_one(template)?;
        tracing::info!(template = %template.id, active = template.is_active, "Workflow template updated");
        Ok(template)
    }

    /// Retire a template. Its code becomes available again.
    pub fn soft_delete_template(&self, id: &TemplateId) -> WorkflowResult<WorkflowTemplate> {
        let mut template = self.get_template(id)?;
        let now = Utc::now();
        template.deleted_at = Some(now);
        template.is_default = false;
        template.is_active = false;
        template.updated_at = now;
        let template = self.save_one(template)?;
        tracing::info!(template = %template.id, code = %template.code, "Workflow template deleted");
        Ok(template)
    }

    /// Make a template its tenant's default, clearing any other default
    pub fn set_default_template(&self, id: &TemplateId) -> WorkflowResult<WorkflowTemplate> {
        let mut target = self.get_template(id)?;
        let now = Utc::now();
        let mut batch: Vec<WorkflowTemplate> = self
            .store
            .list_templates(&target.tenant_id)?
            .into_iter()
            .filter(|t| t.is_default && t.id != target.id)
            .map(|mut t| {
                t.is_default = false;
                t.updated_at = now;
                t
            })
            .collect();
        target.is_default = true;
        target.updated_at = now;
        let target_id = target.id.clone();
        batch.push(target);
        let target = self
            .store
            .save_templates(batch)?
            .into_iter()
            .find(|t| t.id == target_id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(target_id.to_string()))?;
        tracing::info!(template = %target.id, tenant = %target.tenant_id, "Default template set");
        Ok(target)
    }

    fn save_one(&self, template: WorkflowTemplate) -> WorkflowResult<WorkflowTemplate> {
        let id = template.id.clone();
        self.store
            .save_templates(vec![template])?
            .pop()
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.to_string()))
    }

    /// The tenant's default template, if any
    pub fn default_template(&self, tenant_id: &TenantId) -> WorkflowResult<Option<WorkflowTemplate>> {
        Ok(self
            .store
            .list_templates(tenant_id)?
            .into_iter()
            .find(|t| t.is_default))
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry").finish_non_exhaustive()
    }
}
