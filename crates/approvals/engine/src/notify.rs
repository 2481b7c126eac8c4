//! Outbound notifications
//!
//! Delivery is someone else's problem: the engine hands a [`Notification`]
//! to a [`Notifier`] after the commit and logs any failure.

use approvals_types::{InstanceId, UserId, WorkflowTaskId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Notification delivery failure
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Why someone is being notified
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskAssigned,
    TaskReassigned,
    WorkflowTransitioned,
}

/// One message for one recipient
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: UserId,
    pub instance_id: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<WorkflowTaskId>,
    pub title: String,
    pub message: String,
}

/// Notification sink
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes notifications to the tracing log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient,
            instance_id = %notification.instance_id,
            kind = ?notification.kind,
            title = %notification.title,
            "Notification"
        );
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, recipient: &UserId) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| &n.recipient == recipient)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Delivery("recording lock poisoned".into()))?
            .push(notification.clone());
        Ok(())
    }
}
