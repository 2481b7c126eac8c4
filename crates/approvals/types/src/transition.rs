//! Transitions: named, gated edges between stages
//!
//! The engine matches an incoming action against `button_name` or
//! `condition_type` of the transitions leaving the instance's current
//! stage. Anything not wired as an edge can never execute.
//!
//! Gating is described by [`TransitionConditions`], a closed set of typed
//! specs validated once at authoring time.

use crate::{StageId, TemplateId, TransitionId, WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};

// ── Transition ───────────────────────────────────────────────────────

/// A directed, named edge between stages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub template_id: TemplateId,
    pub from_stage_id: StageId,
    /// `None` marks an informational action that never moves the instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stage_id: Option<StageId>,
    /// The label of the button performing this action
    pub button_name: String,
    /// Alternative action key (e.g. `approve`, `reject`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_type: Option<String>,
    #[serde(default)]
    pub conditions: TransitionConditions,
}

impl Transition {
    pub fn new(
        template_id: TemplateId,
        from_stage_id: StageId,
        to_stage_id: Option<StageId>,
        button_name: impl Into<String>,
    ) -> Self {
        Self {
            id: TransitionId::generate(),
            template_id,
            from_stage_id,
            to_stage_id,
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

    /// Whether `action` selects this transition
    pub fn matches_action(&self, action: &str) -> bool {
        self.button_name == action || self.condition_type.as_deref() == Some(action)
    }

    pub fn is_informational(&self) -> bool {
        self.to_stage_id.is_none()
    }

    pub fn is_self_loop(&self) -> bool {
        self.to_stage_id.as_ref() == Some(&self.from_stage_id)
    }

    /// The key the transition is canonically known by
    pub fn action_key(&self) -> &str {
        &self.button_name
    }
}

// ── Conditions ───────────────────────────────────────────────────────

/// Everything that gates a transition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionConditions {
    #[serde(default)]
    pub remarks: RemarksRequirement,
    #[serde(default)]
    pub permissions: PermissionSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialog: Option<DialogSpec>,
}

impl TransitionConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_remarks(mut self, min_length: Option<usize>) -> Self {
        self.remarks = RemarksRequirement {
            required: true,
            min_length,
        };
        self
    }

    pub fn with_permission(mut self, token: impl Into<String>) -> Self {
        self.permissions.required.push(token.into());
        self
    }

    pub fn with_rule(mut self, rule: RuleSpec) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_dialog(mut self, dialog: DialogSpec) -> Self {
        self.dialog = Some(dialog);
        self
    }

    /// Authoring-time checks. Returns every problem found.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.remarks.min_length == Some(0) {
            problems.push("remarks min_length must be greater than zero".to_string());
        }
        for token in &self.permissions.required {
            if token.trim().is_empty() {
                problems.push("permission tokens must not be blank".to_string());
            }
        }
        for rule in &self.rules {
            problems.extend(rule.problems());
        }
        problems
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::InvalidDefinition(problems.join("; ")))
        }
    }
}

/// Whether remarks must accompany the action
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemarksRequirement {
    #[serde(default)]
    pub required: bool,
    /// Applied whenever remarks are required or supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
}

/// Tokens the performer's role must match; empty means anyone may act.
///
/// `admin` and `supervisor` are coarse tokens satisfied by the role's
/// full-access flag or level rather than its name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl PermissionSpec {
    pub fn any_of<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.required.is_empty()
    }
}

/// A generic, configurable rule evaluated against the source entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleSpec {
    /// A numeric field must fall within bounds
    AmountLimit {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Every listed field must be present and non-empty
    RequiredFields { fields: Vec<String> },
    /// A receipt/attachment field must be present (non-empty list or `true`)
    ReceiptRequired {
        #[serde(default = "default_receipt_field")]
        field: String,
    },
    /// Remarks must reach a minimum length
    MinRemarksLength { min: usize },
    /// A field must equal a fixed value
    FieldEquals {
        field: String,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

fn default_receipt_field() -> String {
    "receipts".to_string()
}

impl RuleSpec {
    pub fn amount_limit(field: impl Into<String>, max: f64) -> Self {
        Self::AmountLimit {
            field: field.into(),
            min: None,
            max: Some(max),
        }
    }

    pub fn required_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RequiredFields {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn receipt_required() -> Self {
        Self::ReceiptRequired {
            field: default_receipt_field(),
        }
    }

    /// Short name of the rule, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::AmountLimit { .. } => "amount_limit",
            Self::RequiredFields { .. } => "required_fields",
            Self::ReceiptRequired { .. } => "receipt_required",
            Self::MinRemarksLength { .. } => "min_remarks_length",
            Self::FieldEquals { .. } => "field_equals",
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            Self::AmountLimit { field, min, max } => {
                if field.trim().is_empty() {
                    problems.push("amount_limit needs a field".to_string());
                }
                if min.is_none() && max.is_none() {
                    problems.push(format!("amount_limit on '{field}' needs min or max"));
                }
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        problems.push(format!(
                            "amount_limit on '{field}' has min {min} greater than max {max}"
                        ));
                    }
                }
            }
            Self::RequiredFields { fields } => {
                if fields.is_empty() {
                    problems.push("required_fields needs at least one field".to_string());
                }
                if fields.iter().any(|f| f.trim().is_empty()) {
                    problems.push("required_fields contains a blank field name".to_string());
                }
            }
            Self::ReceiptRequired { field } | Self::FieldEquals { field, .. } => {
                if field.trim().is_empty() {
                    problems.push(format!("{} needs a field", self.name()));
                }
            }
            Self::MinRemarksLength { min } => {
                if *min == 0 {
                    problems.push("min_remarks_length must be greater than zero".to_string());
                }
            }
        }
        problems
    }
}

/// Confirmation dialog shown before the action is performed.
///
/// Carried for clients; the engine never interprets it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogSpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_label: Option<String>,
    #[serde(default)]
    pub remarks_field: bool,
}
