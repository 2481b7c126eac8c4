//! Storage contract for approval workflows.
//!
//! Two traits split the data along its lifecycle:
//! - [`TemplateStore`]: templates and their stage graphs, written through
//!   revision-checked [`GraphChangeSet`]s
//! - [`InstanceStore`]: instances, history, tasks and cards, written
//!   through all-or-nothing [`UnitOfWork`] commits
//!
//! Design stance:
//! - A single authoritative store with transactional semantics.
//! - Instance updates are compare-and-swap on `version`; a losing writer
//!   gets [`StoreError::StaleWrite`] and nothing is applied.
//! - Structural invariants (dense stage sequences, one initial stage, one
//!   open task per instance, immutable terminal instances) are re-checked
//!   at commit time regardless of what the caller already verified.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod hash;
pub mod memory;
mod model;
mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryWorkflowStore;
pub use model::{
    CommitReceipt, GraphChangeSet, InstanceFilter, InstanceWrite, Page, QueryWindow, UnitOfWork,
};
pub use traits::{InstanceStore, TemplateStore, WorkflowStore};
