//! Concurrent writers against one engine

mod common;

use approvals_engine::{StartRequest, TransitionRequest};
use approvals_store::InstanceStore;
use approvals_types::{ErrorKind, InstanceStatus, SourceRef, WorkflowError};
use common::{expense, fixture, tenant, user};
use std::sync::Barrier;
use std::thread;

#[test]
fn test_racing_transitions_have_one_winner() {
    for round in 0..20 {
        let f = fixture();
        let instance = f.start("77");
        let barrier = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let reject = s.spawn(|| {
                barrier.wait();
                f.engine.transition(
                    TransitionRequest::new(instance.id.clone(), "Reject", user("bob"))
                        .with_remarks("Missing the hotel receipt"),
                )
            });
            let second = s.spawn(|| {
                barrier.wait();
                f.engine.transition(
                    TransitionRequest::new(instance.id.clone(), "Reject", user("carol"))
                        .with_remarks("Over the quarterly budget"),
                )
            });
            vec![reject.join().unwrap(), second.join().unwrap()]
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {round}: {results:?}");
        for result in &results {
            if let Err(err) = result {
                // Lost the compare-and-swap, or read the already-completed row
                assert!(
                    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::IllegalState),
                    "round {round}: {err}"
                );
            }
        }

        let history = f.store.history_for(&instance.id).unwrap();
        assert_eq!(history.len(), 2, "round {round}");
        let stored = f.engine.query().get(&instance.id).unwrap();
        assert_eq!(stored.status, InstanceStatus::Completed);
        assert_eq!(stored.version, 2);
        assert!(f
            .store
            .tasks_for_instance(&instance.id)
            .unwrap()
            .iter()
            .all(|t| !t.is_open()));
    }
}

#[test]
fn test_racing_starts_create_one_instance() {
    let f = fixture();
    let barrier = Barrier::new(4);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    f.engine.start(StartRequest::new(
                        tenant(),
                        "expense_approval",
                        SourceRef::new("EXPENSE", "77"),
                        user("alice"),
                    ))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, WorkflowError::DuplicateInstance { .. })));
    assert_eq!(f.store.open_tasks(None).unwrap().len(), 1);
}

#[test]
fn test_independent_instances_progress_in_parallel() {
    let f = fixture();
    let ids: Vec<String> = (100..108).map(|i| i.to_string()).collect();
    for id in &ids {
        f.rules.put_entity(id.clone(), expense(50.0)).unwrap();
    }
    let instances: Vec<_> = ids.iter().map(|id| f.start(id)).collect();

    thread::scope(|s| {
        for instance in &instances {
            let engine = &f.engine;
            s.spawn(move || {
                engine
                    .transition(TransitionRequest::new(instance.id.clone(), "Approve", user("bob")))
                    .unwrap();
            });
        }
    });

    for instance in &instances {
        let stored = f.engine.query().get(&instance.id).unwrap();
        assert_eq!(stored.status, InstanceStatus::Completed);
        assert_eq!(stored.current_stage_id, f.stage_id("APPROVED"));
    }
    assert!(f.store.open_tasks(None).unwrap().is_empty());
}
