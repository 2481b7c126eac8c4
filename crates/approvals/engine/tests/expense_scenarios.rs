//! End-to-end scenarios over the expense approval template

mod common;

use approvals_engine::{
    EngineBuilder, ListenerError, Notification, Notifier, NotifyError, StartRequest,
    TransitionRequest, WorkflowListener,
};
use approvals_store::InstanceStore;
use approvals_types::{
    ErrorKind, HistoryAction, InstanceStatus, SourceRef, WorkflowError, WorkflowEvent,
};
use common::{expense, fixture, tenant, user};
use std::sync::Arc;

fn open_tasks(f: &common::Fixture, instance_id: &approvals_types::InstanceId) -> usize {
    f.store
        .tasks_for_instance(instance_id)
        .unwrap()
        .iter()
        .filter(|t| t.is_open())
        .count()
}

#[test]
fn test_expense_rejection_flow() {
    let f = fixture();
    assert!(f.imported.report.is_valid(), "{:?}", f.imported.report.problems);

    let instance = f.start("77");
    assert_eq!(instance.current_stage_id, f.stage_id("PENDING"));
    assert_eq!(instance.status, InstanceStatus::Active);
    let tasks = f.store.tasks_for_instance(&instance.id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].is_open());
    assert_eq!(tasks[0].assignee_id, user("bob"));

    // Too-short remarks: rejected with the length rule, nothing written
    let err = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "Reject", user("bob")).with_remarks("no"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let messages = err.validation_messages().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("at least 10 characters"), "{messages:?}");
    let unchanged = f.engine.query().get(&instance.id).unwrap();
    assert_eq!(unchanged.current_stage_id, f.stage_id("PENDING"));
    assert_eq!(unchanged.version, instance.version);
    assert_eq!(f.store.history_for(&instance.id).unwrap().len(), 1);

    f.events.clear();
    let rejected = f
        .engine
        .transition(
            TransitionRequest::new(instance.id.clone(), "Reject", user("bob"))
                .with_remarks("Insufficient documentation provided"),
        )
        .unwrap();
    assert_eq!(rejected.status, InstanceStatus::Completed);
    assert_eq!(rejected.current_stage_id, f.stage_id("REJECTED"));
    assert!(rejected.completed_at.is_some());
    assert_eq!(open_tasks(&f, &instance.id), 0);

    let sync = f
        .events
        .events()
        .into_iter()
        .find_map(|e| match e {
            WorkflowEvent::Sync { module, payload } => Some((module, payload)),
            _ => None,
        })
        .unwrap();
    assert_eq!(sync.0, "EXPENSE");
    assert_eq!(sync.1.stage_key, "REJECTED");
    assert!(sync.1.is_final);
    assert_eq!(f.rules.entity("77").unwrap()["workflow_status"], "REJECTED");

    let history = f.store.history_for(&instance.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].action, HistoryAction::Transition("Reject".into()));
    assert_eq!(
        history[1].remarks.as_deref(),
        Some("Insufficient documentation provided")
    );

    // Completed instances accept nothing further
    let err = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "Approve", user("bob")))
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WrongStatus { .. }));

    // One instance per source, forever
    let again = f.engine.start(StartRequest::new(
        tenant(),
        "expense_approval",
        SourceRef::new("EXPENSE", "77"),
        user("alice"),
    ));
    let err = again.unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateInstance { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_approval_checks_rules_before_permissions() {
    let f = fixture();
    f.rules.put_entity("78", expense(900.0)).unwrap();
    let instance = f.start("78");

    // Over the limit: validation fails even for a permitted approver
    let err = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "approve", user("bob")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.validation_messages().unwrap()[0].contains("exceeds the limit"));

    f.rules.put_entity("78", expense(100.0)).unwrap();
    let err = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "approve", user("alice")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(!err.to_string().contains("supervisor"));

    let approved = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "approve", user("bob")))
        .unwrap();
    assert_eq!(approved.current_stage_id, f.stage_id("APPROVED"));
    assert_eq!(approved.status, InstanceStatus::Completed);
    assert_eq!(f.store.history_for(&instance.id).unwrap().len(), 2);
}

#[test]
fn test_unwired_actions_never_execute() {
    let f = fixture();
    let instance = f.start("77");
    for action in ["Escalate", "approved", "REJECT", ""] {
        let err = f
            .engine
            .transition(TransitionRequest::new(instance.id.clone(), action, user("bob")))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidAction { .. }), "{action}: {err}");
    }
    assert_eq!(f.store.history_for(&instance.id).unwrap().len(), 1);
}

#[test]
fn test_missing_source_entity_fails_validation() {
    let f = fixture();
    let instance = f.start("404");
    // Start still planned a task from instance metadata alone
    assert_eq!(open_tasks(&f, &instance.id), 1);

    let err = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "Comment", user("bob")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.validation_messages().unwrap()[0].contains("404"));
}

#[test]
fn test_history_grows_by_one_per_successful_call() {
    let f = fixture();
    let instance = f.start("77");
    let count = || f.store.history_for(&instance.id).unwrap().len();
    assert_eq!(count(), 1);

    f.engine
        .transition(
            TransitionRequest::new(instance.id.clone(), "Comment", user("alice"))
                .with_remarks("Receipt uploaded"),
        )
        .unwrap();
    assert_eq!(count(), 2);

    f.engine
        .suspend(&instance.id, &user("bob"), Some("Awaiting budget".into()))
        .unwrap();
    assert_eq!(count(), 3);
    assert!(f.engine.suspend(&instance.id, &user("bob"), None).is_err());
    assert_eq!(count(), 3);

    f.engine.resume(&instance.id, &user("bob")).unwrap();
    assert_eq!(count(), 4);
    assert!(f.engine.resume(&instance.id, &user("bob")).is_err());

    f.engine.cancel(&instance.id, &user("alice"), None).unwrap();
    assert_eq!(count(), 5);
    assert!(f.engine.cancel(&instance.id, &user("alice"), None).is_err());
    assert_eq!(count(), 5);

    let query = f.engine.query();
    assert_eq!(query.verify_history(&instance.id).unwrap(), None);
    let timeline = query.timeline(&instance.id).unwrap();
    let actions: Vec<String> = timeline.iter().map(|e| e.action.to_string()).collect();
    assert_eq!(
        actions,
        vec![
            "WORKFLOW_STARTED",
            "Comment",
            "WORKFLOW_SUSPENDED",
            "WORKFLOW_RESUMED",
            "WORKFLOW_CANCELLED"
        ]
    );
    assert!(timeline.iter().skip(1).all(|e| e.from == e.to));
}

#[test]
fn test_informational_action_keeps_stage_and_task() {
    let f = fixture();
    let instance = f.start("77");
    let task_before = f.store.tasks_for_instance(&instance.id).unwrap();
    f.events.clear();

    let after = f
        .engine
        .transition(TransitionRequest::new(instance.id.clone(), "Comment", user("alice")))
        .unwrap();
    assert_eq!(after.current_stage_id, instance.current_stage_id);
    assert_eq!(after.status, InstanceStatus::Active);
    assert_eq!(f.store.tasks_for_instance(&instance.id).unwrap(), task_before);
    assert_eq!(f.events.names(), vec!["workflow.transitioned".to_string()]);
    assert!(f.rules.synced().is_empty());
}

#[test]
fn test_available_actions_and_pending_tasks() {
    let f = fixture();
    let instance = f.start("77");
    let query = f.engine.query();

    let for_bob: Vec<String> = query
        .available_actions(&instance.id, &user("bob"))
        .unwrap()
        .into_iter()
        .map(|a| a.button_name)
        .collect();
    assert_eq!(for_bob.len(), 3);
    assert!(for_bob.contains(&"Approve".to_string()));

    let for_alice = query.available_actions(&instance.id, &user("alice")).unwrap();
    assert_eq!(for_alice.len(), 2);
    let reject = for_alice.iter().find(|a| a.button_name == "Reject").unwrap();
    assert!(reject.remarks.required);
    assert_eq!(reject.to_stage.as_ref().unwrap().key, "REJECTED");

    let pending = query.pending_for_user(&user("bob")).unwrap();
    assert_eq!(pending.len(), 1);
    let card = pending[0].card.as_ref().unwrap();
    assert_eq!(card.title, "Expense 77: Pending approval");
    assert!(card.description.contains("120.00"));
    assert!(card.watchers.contains(&user("alice")));
    assert_eq!(f.notifier.sent_to(&user("bob")).len(), 1);
}

#[test]
fn test_reassignment_moves_card_and_notifies() {
    let f = fixture();
    let instance = f.start("77");
    let task = f.store.open_tasks(Some(&user("bob"))).unwrap().remove(0);

    f.engine
        .reassign_task(&task.id, &user("carol"), &user("bob"))
        .unwrap();
    let views = f.engine.query().tasks_for_instance(&instance.id).unwrap();
    assert_eq!(views[0].task.assignee_id, user("carol"));
    assert_eq!(views[0].card.as_ref().unwrap().assignee_id, user("carol"));
    assert!(f.engine.query().pending_for_user(&user("bob")).unwrap().is_empty());
    assert_eq!(f.notifier.sent_to(&user("carol")).len(), 1);
}

// ── Side-effect isolation ────────────────────────────────────────────

struct PanickingListener;

impl WorkflowListener for PanickingListener {
    fn name(&self) -> &str {
        "panicking"
    }

    fn on_event(&self, _event: &WorkflowEvent) -> Result<(), ListenerError> {
        panic!("listener exploded")
    }
}

struct FailingListener;

impl WorkflowListener for FailingListener {
    fn on_event(&self, _event: &WorkflowEvent) -> Result<(), ListenerError> {
        Err(ListenerError::Failed("queue full".into()))
    }
}

struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("smtp down".into()))
    }
}

#[test]
fn test_side_effect_failures_do_not_undo_commits() {
    let f = fixture();
    let store = f.store.clone();
    let directory = approvals_engine::InMemoryDirectory::new()
        .with_user(approvals_engine::DirectoryUser::new("alice").with_supervisor("bob"))
        .with_user(approvals_engine::DirectoryUser::new("bob"));
    let engine = EngineBuilder::new(store.clone(), Arc::new(directory))
        .with_rule_set(f.rules.clone())
        .with_listener(Arc::new(PanickingListener))
        .with_listener(Arc::new(FailingListener))
        .with_listener(f.events.clone())
        .with_notifier(Arc::new(FailingNotifier))
        .build();

    let instance = engine
        .start(StartRequest::new(
            tenant(),
            "expense_approval",
            SourceRef::new("EXPENSE", "77"),
            user("alice"),
        ))
        .unwrap();
    let rejected = engine
        .transition(
            TransitionRequest::new(instance.id.clone(), "Reject", user("bob"))
                .with_remarks("Duplicate of an earlier claim"),
        )
        .unwrap();
    assert_eq!(rejected.status, InstanceStatus::Completed);
    assert_eq!(store.history_for(&instance.id).unwrap().len(), 2);
    // Listeners after a failing one still hear every event
    assert!(f.events.names().contains(&"workflow.transitioned".to_string()));
}
