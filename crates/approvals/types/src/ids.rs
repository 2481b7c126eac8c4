//! Identifiers used across the approval workflow model

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident) => {
        string_id!($(#[$meta])* $name);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }
    };
}

generated_id!(
    /// Unique identifier for a workflow template
    TemplateId
);
generated_id!(
    /// Unique identifier for a stage
    StageId
);
generated_id!(
    /// Unique identifier for a transition
    TransitionId
);
generated_id!(
    /// Unique identifier for a workflow instance
    InstanceId
);
generated_id!(
    /// Unique identifier for a history entry
    HistoryEntryId
);
generated_id!(
    /// Unique identifier for the link between an instance stage and a task card
    WorkflowTaskId
);
generated_id!(
    /// Unique identifier for a task card on the work board
    TaskCardId
);

string_id!(
    /// A person known to the organisation directory
    UserId
);
string_id!(
    /// Tenant owning templates and instances
    TenantId
);
