//! Validator: decides whether a candidate transition may run
//!
//! Two independent passes:
//! - the **validation pass** checks remarks, the transition's generic
//!   [`RuleSpec`]s and the module's domain rules, accumulating every
//!   failure instead of stopping at the first;
//! - the **permission pass** checks the performer's role against the
//!   transition's [`PermissionSpec`].
//!
//! Neither pass has side effects.

use crate::directory::{Directory, RoleInfo};
use crate::rules::{RuleContext, RuleInput, RuleRegistry};
use approvals_types::{
    PermissionSpec, RuleSpec, UserId, ValidationErrors, WorkflowError, WorkflowResult,
};
use std::sync::Arc;

const TOKEN_ADMIN: &str = "admin";
const TOKEN_SUPERVISOR: &str = "supervisor";

// ── Permission pass ──────────────────────────────────────────────────

/// Role-based permission check
#[derive(Clone)]
pub struct PermissionPolicy {
    directory: Arc<dyn Directory>,
    supervisor_level: u8,
}

impl PermissionPolicy {
    pub fn new(directory: Arc<dyn Directory>, supervisor_level: u8) -> Self {
        Self {
            directory,
            supervisor_level,
        }
    }

    /// Whether `performer` satisfies `spec`
    pub fn permits(&self, performer: &UserId, spec: &PermissionSpec) -> WorkflowResult<bool> {
        if spec.is_open() {
            return Ok(true);
        }
        let role = self
            .directory
            .user(performer)?
            .filter(|u| u.active)
            .and_then(|u| u.role);
        let allowed = role.is_some_and(|role| {
            spec.required
                .iter()
                .any(|token| self.token_matches(&role, token.trim()))
        });
        tracing::debug!(
            performer = %performer,
            required = ?spec.required,
            allowed,
            "Permission pass evaluated"
        );
        Ok(allowed)
    }

    /// Fail with `Forbidden` unless `performer` satisfies `spec`.
    ///
    /// The error names the action, never the missing token.
    pub fn check(&self, performer: &UserId, spec: &PermissionSpec, action: &str) -> WorkflowResult<()> {
        if self.permits(performer, spec)? {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!(
                "user {performer} is not allowed to perform '{action}'"
            )))
        }
    }

    fn token_matches(&self, role: &RoleInfo, token: &str) -> bool {
        if role.name.eq_ignore_ascii_case(token) {
            return true;
        }
        if token.eq_ignore_ascii_case(TOKEN_ADMIN) {
            return role.full_access;
        }
        if token.eq_ignore_ascii_case(TOKEN_SUPERVISOR) {
            return role.full_access || role.level >= self.supervisor_level;
        }
        false
    }
}

impl std::fmt::Debug for PermissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionPolicy")
            .field("supervisor_level", &self.supervisor_level)
            .finish_non_exhaustive()
    }
}

// ── Validation pass ──────────────────────────────────────────────────

/// Transition validator
#[derive(Clone, Debug)]
pub struct Validator {
    rules: Arc<RuleRegistry>,
    permissions: PermissionPolicy,
}

impl Validator {
    pub fn new(rules: Arc<RuleRegistry>, permissions: PermissionPolicy) -> Self {
        Self { rules, permissions }
    }

    pub fn permissions(&self) -> &PermissionPolicy {
        &self.permissions
    }

    /// Run the validation pass. Every failure is reported.
    pub fn validate(&self, input: &RuleInput<'_>, context: &RuleContext) -> WorkflowResult<()> {
        let mut errors = ValidationErrors::new();
        let conditions = &input.transition.conditions;
        let action = input.transition.action_key();
        let remarks = input.remarks.map(str::trim).filter(|r| !r.is_empty());

        if conditions.remarks.required && remarks.is_none() {
            errors.push(format!("Remarks are required for '{action}'"));
        }
        if let (Some(min), Some(text)) = (conditions.remarks.min_length, remarks) {
            let len = text.chars().count();
            if len < min {
                errors.push(format!(
                    "Remarks for '{action}' must be at least {min} characters (got {len})"
                ));
            }
        }

        for rule in &conditions.rules {
            if let Some(message) = evaluate_rule(rule, context, remarks) {
                tracing::debug!(rule = rule.name(), action, "Rule failed");
                errors.push(message);
            }
        }

        if let Some(rule_set) = self.rules.get(&input.instance.source.module) {
            errors.extend(rule_set.validate(input, context));
        }

        tracing::debug!(
            instance_id = %input.instance.id,
            action,
            failures = errors.len(),
            "Validation pass evaluated"
        );
        errors.into_result()
    }

    /// Run the permission pass
    pub fn check_permission(&self, input: &RuleInput<'_>) -> WorkflowResult<()> {
        self.permissions.check(
            input.performer,
            &input.transition.conditions.permissions,
            input.transition.action_key(),
        )
    }
}

/// Evaluate one generic rule; `Some(message)` on failure
pub fn evaluate_rule(rule: &RuleSpec, context: &RuleContext, remarks: Option<&str>) -> Option<String> {
    match rule {
        RuleSpec::AmountLimit { field, min, max } => {
            let Some(amount) = context.number(field) else {
                return Some(format!("Field '{field}' is missing or not numeric"));
            };
            if let Some(min) = min {
                if amount < *min {
                    return Some(format!("Field '{field}' ({amount}) is below the minimum of {min}"));
                }
            }
            if let Some(max) = max {
                if amount > *max {
                    return Some(format!("Field '{field}' ({amount}) exceeds the limit of {max}"));
                }
            }
            None
        }
        RuleSpec::RequiredFields { fields } => {
            let missing: Vec<&str> = fields
                .iter()
                .filter(|f| !is_present(context.field(f)))
                .map(String::as_str)
                .collect();
            (!missing.is_empty())
                .then(|| format!("Required fields missing: {}", missing.join(", ")))
        }
        RuleSpec::ReceiptRequired { field } => {
            let attached = match context.field(field) {
                Some(serde_json::Value::Bool(flag)) => *flag,
                other => is_present(other),
            };
            (!attached).then(|| format!("A receipt is required ('{field}' is empty)"))
        }
        RuleSpec::MinRemarksLength { min } => {
            let len = remarks.map_or(0, |r| r.chars().count());
            (len < *min).then(|| format!("Remarks must be at least {min} characters (got {len})"))
        }
        RuleSpec::FieldEquals {
            field,
            value,
            message,
        } => {
            let matches = context.field(field) == Some(value);
            (!matches).then(|| {
                message
                    .clone()
                    .unwrap_or_else(|| format!("Field '{field}' must equal {value}"))
            })
        }
    }
}

fn is_present(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}
