//! Approval Workflow Domain Types
//!
//! An approval workflow is a directed graph of named **stages** joined by
//! **transitions**. A business entity (an expense report, a purchase
//! requisition, ...) is driven through the graph by people performing the
//! actions wired as edges out of the stage the entity currently sits at.
//!
//! # Key Concepts
//!
//! - **WorkflowTemplate**: the authored graph, unique by code per tenant.
//! - **Stage**: one node. At most one stage per template is initial;
//!   final stages complete the instance on entry.
//! - **Transition**: a named edge (`button_name` / `condition_type`) gated
//!   by typed [`TransitionConditions`].
//! - **WorkflowInstance**: one execution bound to exactly one
//!   `(source_module, source_id)` pair, forever.
//! - **HistoryEntry**: append-only, hash-chained audit trail.
//! - **WorkflowTask** / **TaskCard**: the unit of work for the current stage
//!   and the board card it is tracked on.
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]

mod errors;
mod event;
mod history;
mod ids;
mod instance;
mod task;
mod template;
mod transition;

pub use errors::*;
pub use event::*;
pub use history::*;
pub use ids::*;
pub use instance::*;
pub use task::*;
pub use template::*;
pub use transition::*;
