//! Property tests for stage graph authoring

use approvals_engine::{NewStage, NewTransition, StageGraphManager, TemplateRegistry};
use approvals_store::{InMemoryWorkflowStore, WorkflowStore};
use approvals_types::{Stage, StageId, TemplateId, TenantId, WorkflowError};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Create { position: Option<u32>, initial: bool },
    Delete(usize),
    Link(usize, usize),
    Reorder(Vec<usize>),
    ReorderWithForeign,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (proptest::option::of(0u32..8), any::<bool>())
            .prop_map(|(position, initial)| Op::Create { position, initial }),
        2 => (0usize..8).prop_map(Op::Delete),
        2 => (0usize..8, 0usize..8).prop_map(|(a, b)| Op::Link(a, b)),
        1 => Just((0..8usize).collect::<Vec<_>>())
            .prop_shuffle()
            .prop_map(Op::Reorder),
        1 => Just(Op::ReorderWithForeign),
    ]
}

fn setup() -> (StageGraphManager, TemplateId) {
    let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
    let template = TemplateRegistry::new(store.clone())
        .create_template(TenantId::new("t1"), "prop", "Property template", "")
        .unwrap();
    (StageGraphManager::new(store), template.id)
}

fn snapshot(stages: &[Stage]) -> Vec<(StageId, u32, bool)> {
    stages
        .iter()
        .map(|s| (s.id.clone(), s.sequence, s.is_initial))
        .collect()
}

fn assert_invariants(stages: &[Stage]) {
    let initial = stages.iter().filter(|s| s.is_initial).count();
    assert!(initial <= 1, "{initial} initial stages");
    for (i, stage) in stages.iter().enumerate() {
        assert_eq!(stage.sequence as usize, i, "sequences not dense: {stages:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_authoring_preserves_graph_invariants(ops in proptest::collection::vec(op(), 1..30)) {
        let (graph, template_id) = setup();
        let mut counter = 0;

        for op in ops {
            let before = graph.stages(&template_id).unwrap();
            match op {
                Op::Create { position, initial } => {
                    counter += 1;
                    let mut new = NewStage::new(format!("S{counter}"), format!("Stage {counter}"));
                    new.sequence = position;
                    new.is_initial = initial;
                    let created = graph.create_stage(&template_id, new).unwrap();
                    let after = graph.stages(&template_id).unwrap();
                    prop_assert_eq!(after.len(), before.len() + 1);
                    if initial {
                        prop_assert!(after.iter().all(|s| s.is_initial == (s.id == created.id)));
                    }
                }
                Op::Delete(index) => {
                    let Some(stage) = before.get(index % before.len().max(1)) else { continue };
                    match graph.delete_stage(&stage.id) {
                        Ok(()) => {
                            let after = graph.stages(&template_id).unwrap();
                            prop_assert_eq!(after.len(), before.len() - 1);
                        }
                        Err(WorkflowError::IllegalState(_)) => {
                            prop_assert_eq!(
                                snapshot(&graph.stages(&template_id).unwrap()),
                                snapshot(&before)
                            );
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {other}"),
                    }
                }
                Op::Link(a, b) => {
                    if before.is_empty() {
                        continue;
                    }
                    let from = &before[a % before.len()];
                    let to = &before[b % before.len()];
                    counter += 1;
                    graph
                        .create_transition(NewTransition::new(
                            from.id.clone(),
                            Some(to.id.clone()),
                            format!("Go{counter}"),
                        ))
                        .unwrap();
                }
                Op::Reorder(permutation) => {
                    let positions: Vec<usize> =
                        permutation.into_iter().filter(|p| *p < before.len()).collect();
                    let order: Vec<(StageId, u32)> = before
                        .iter()
                        .zip(positions)
                        .map(|(s, p)| (s.id.clone(), p as u32))
                        .collect();
                    let reordered = graph.reorder_stages(&template_id, &order).unwrap();
                    for (id, position) in &order {
                        let stage = reordered.iter().find(|s| &s.id == id).unwrap();
                        prop_assert_eq!(stage.sequence, *position);
                    }
                }
                Op::ReorderWithForeign => {
                    let mut order: Vec<(StageId, u32)> = before
                        .iter()
                        .map(|s| (s.id.clone(), s.sequence))
                        .collect();
                    order.push((StageId::new("foreign"), before.len() as u32));
                    prop_assert!(graph.reorder_stages(&template_id, &order).is_err());
                    prop_assert_eq!(
                        snapshot(&graph.stages(&template_id).unwrap()),
                        snapshot(&before)
                    );
                }
            }
            assert_invariants(&graph.stages(&template_id).unwrap());
        }
    }
}
