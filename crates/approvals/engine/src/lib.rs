//! Approval Workflow Engine
//!
//! Drives business entities through authored stage graphs. Every mutation
//! commits instance, history and task writes as one unit of work; events,
//! notifications and source-module sync run only after the commit and can
//! never undo it.
//!
//! # Architecture
//!
//! The [`WorkflowEngine`] composes specialized components:
//!
//! - [`TemplateRegistry`] - Creates, retires and defaults templates
//! - [`StageGraphManager`] - Authors stages and transitions, validates graphs
//! - [`Validator`] - Remarks, typed rules, domain rules, then permissions
//! - [`TaskOrchestrator`] - Resolves assignees and plans task cards
//! - [`InstanceQueryService`] - Read side: timelines, actions, reports
//!
//! Collaborators plug in as trait objects: [`Directory`],
//! [`DomainRuleSet`], [`Notifier`] and [`WorkflowListener`].
//!
//! # Example
//!
//! ```rust
//! use approvals_engine::{
//!     DirectoryUser, InMemoryDirectory, NewStage, NewTransition, StartRequest,
//!     TransitionRequest, WorkflowEngine,
//! };
//! use approvals_store::InMemoryWorkflowStore;
//! use approvals_types::{InstanceStatus, SourceRef, TenantId, UserId};
//! use std::sync::Arc;
//!
//! let directory = InMemoryDirectory::new().with_user(DirectoryUser::new("alice"));
//! let engine = WorkflowEngine::builder(
//!     Arc::new(InMemoryWorkflowStore::new()),
//!     Arc::new(directory),
//! )
//! .build();
//!
//! let template = engine
//!     .templates()
//!     .create_template(TenantId::new("acme"), "leave", "Leave request", "")
//!     .unwrap();
//! let pending = engine
//!     .graph()
//!     .create_stage(&template.id, NewStage::new("PENDING", "Pending").initial())
//!     .unwrap();
//! let approved = engine
//!     .graph()
//!     .create_stage(&template.id, NewStage::new("APPROVED", "Approved").terminal())
//!     .unwrap();
//! engine
//!     .graph()
//!     .create_transition(NewTransition::new(pending.id, Some(approved.id), "Approve"))
//!     .unwrap();
//!
//! let instance = engine
//!     .start(StartRequest::new(
//!         TenantId::new("acme"),
//!         "leave",
//!         SourceRef::new("LEAVE", "42"),
//!         UserId::new("alice"),
//!     ))
//!     .unwrap();
//! let done = engine
//!     .transition(TransitionRequest::new(instance.id, "Approve", UserId::new("alice")))
//!     .unwrap();
//! assert_eq!(done.status, InstanceStatus::Completed);
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod directory;
pub mod engine;
pub mod graph;
pub mod listener;
pub mod manifest;
pub mod notify;
pub mod query;
pub mod rules;
pub mod tasks;
pub mod templates;
pub mod validator;

// Re-export main types
pub use config::{ConfigError, EngineConfig};
pub use directory::{Directory, DirectoryError, DirectoryUser, InMemoryDirectory, RoleInfo};
pub use engine::{EngineBuilder, StartRequest, TransitionRequest, WorkflowEngine};
pub use graph::{
    NewStage, NewTransition, StageGraphManager, StageUpdate, TemplateProblem, TemplateReport,
    TransitionUpdate,
};
pub use listener::{ListenerError, ListenerSet, RecordingListener, WorkflowListener};
pub use manifest::{import_manifest, ImportedTemplate, ManifestError, TemplateManifest};
pub use notify::{LogNotifier, NoopNotifier, Notification, NotificationKind, Notifier, NotifyError, RecordingNotifier};
pub use query::{
    AvailableAction, InstanceQueryService, OverdueInstance, StageRef, TaskView, TimelineEntry,
    WorkflowStatistics,
};
pub use rules::{DomainRuleSet, EntityRuleSet, RuleContext, RuleError, RuleInput, RuleRegistry, TaskDetails};
pub use tasks::TaskOrchestrator;
pub use templates::{TemplateRegistry, TemplateUpdate};
pub use validator::{PermissionPolicy, Validator};
