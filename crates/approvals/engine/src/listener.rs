//! Lifecycle listeners
//!
//! The engine holds an explicit list of [`WorkflowListener`]s and calls
//! each one after a commit. A listener that errors or panics is logged and
//! skipped; the remaining listeners still run and the caller never sees
//! the failure.

use approvals_types::WorkflowEvent;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Listener failure
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
}

/// Receives every event the engine emits
pub trait WorkflowListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "listener"
    }

    fn on_event(&self, event: &WorkflowEvent) -> Result<(), ListenerError>;
}

/// Run a side effect, absorbing errors and panics into a warning.
///
/// Returns whether the side effect succeeded.
pub(crate) fn run_isolated<E, F>(what: &str, f: F) -> bool
where
    E: Display,
    F: FnOnce() -> Result<(), E>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(side_effect = what, error = %e, "Side effect failed");
            false
        }
        Err(_) => {
            tracing::warn!(side_effect = what, "Side effect panicked");
            false
        }
    }
}

/// Ordered listener list
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn WorkflowListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn WorkflowListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver an event to every listener in registration order
    pub fn emit(&self, event: &WorkflowEvent) {
        let name = event.name();
        for listener in &self.listeners {
            let label = format!("{}:{}", listener.name(), name);
            run_isolated(&label, || listener.on_event(event));
        }
        tracing::trace!(event = %name, listeners = self.listeners.len(), "Event emitted");
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.listeners.iter().map(|l| l.name().to_string()))
            .finish()
    }
}

/// Records every event; handy for hosts that poll and for tests
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event names in emission order
    pub fn names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.name().into_owned())
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl WorkflowListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_event(&self, event: &WorkflowEvent) -> Result<(), ListenerError> {
        self.events
            .lock()
            .map_err(|_| ListenerError::Failed("recording lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approvals_types::{InstanceId, SourceRef, UserId};
    use chrono::Utc;

    struct Panicking;

    impl WorkflowListener for Panicking {
        fn on_event(&self, _event: &WorkflowEvent) -> Result<(), ListenerError> {
            panic!("listener blew up");
        }
    }

    struct Failing;

    impl WorkflowListener for Failing {
        fn on_event(&self, _event: &WorkflowEvent) -> Result<(), ListenerError> {
            Err(ListenerError::Failed("downstream offline".into()))
        }
    }

    fn event() -> WorkflowEvent {
        WorkflowEvent::Resumed {
            instance_id: InstanceId::new("i-1"),
            source: SourceRef::new("EXPENSE", "77"),
            performed_by: UserId::new("boss"),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_failures_are_isolated() {
        let recording = Arc::new(RecordingListener::new());
        let mut set = ListenerSet::new();
        set.add(Arc::new(Panicking));
        set.add(Arc::new(Failing));
        set.add(recording.clone());

        set.emit(&event());
        assert_eq!(recording.names(), vec!["workflow.resumed".to_string()]);
    }

    #[test]
    fn test_run_isolated_reports_outcome() {
        assert!(run_isolated("ok", || Ok::<(), String>(())));
        assert!(!run_isolated("err", || Err::<(), _>("nope")));
        assert!(!run_isolated("panic", || -> Result<(), String> { panic!("boom") }));
    }
}
