//! Authoring writes racing runtime writes

mod common;

use approvals_engine::{
    import_manifest, Directory, DirectoryError, DirectoryUser, InMemoryDirectory,
    StageGraphManager, StartRequest, TemplateManifest, WorkflowEngine,
};
use approvals_store::{InMemoryWorkflowStore, InstanceFilter, InstanceStore, QueryWindow, TemplateStore};
use approvals_types::{ErrorKind, SourceRef, StageId, UserId, WorkflowResult};
use common::{tenant, user, EXPENSE_MANIFEST};
use std::sync::{Arc, Mutex};

/// Deletes an armed stage the first time a supervisor is resolved, which
/// happens after `start` has read the initial stage and before it commits.
struct DeletingDirectory {
    inner: InMemoryDirectory,
    graph: StageGraphManager,
    armed: Mutex<Option<StageId>>,
    outcome: Mutex<Option<WorkflowResult<()>>>,
}

impl Directory for DeletingDirectory {
    fn user(&self, id: &UserId) -> Result<Option<DirectoryUser>, DirectoryError> {
        self.inner.user(id)
    }

    fn direct_supervisor(&self, id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let target = self
            .armed
            .lock()
            .map_err(|_| DirectoryError::Unavailable("poisoned".into()))?
            .take();
        if let Some(stage_id) = target {
            let result = self.graph.delete_stage(&stage_id);
            if let Ok(mut outcome) = self.outcome.lock() {
                *outcome = Some(result);
            }
        }
        self.inner.direct_supervisor(id)
    }

    fn department_representative(
        &self,
        department_id: &str,
        supervisor_level: u8,
    ) -> Result<Option<UserId>, DirectoryError> {
        self.inner.department_representative(department_id, supervisor_level)
    }

    fn role_member(&self, role_id: &str) -> Result<Option<UserId>, DirectoryError> {
        self.inner.role_member(role_id)
    }
}

#[test]
fn test_start_never_lands_on_a_stage_deleted_mid_flight() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let directory = Arc::new(DeletingDirectory {
        inner: InMemoryDirectory::new()
            .with_user(DirectoryUser::new("alice").with_supervisor("bob"))
            .with_user(DirectoryUser::new("bob")),
        graph: StageGraphManager::new(store.clone()),
        armed: Mutex::new(None),
        outcome: Mutex::new(None),
    });
    let engine = WorkflowEngine::builder(store.clone(), directory.clone()).build();
    let manifest = TemplateManifest::from_toml_str(EXPENSE_MANIFEST).unwrap();
    let imported = import_manifest(engine.templates(), engine.graph(), &manifest).unwrap();
    let pending = imported
        .stages
        .iter()
        .find(|s| s.key == "PENDING")
        .map(|s| s.id.clone())
        .unwrap();
    *directory.armed.lock().unwrap() = Some(pending.clone());

    let result = engine.start(StartRequest::new(
        tenant(),
        "expense_approval",
        SourceRef::new("EXPENSE", "77"),
        user("alice"),
    ));

    // The delete ran first, so the start must not commit onto the removed stage.
    let deleted = directory.outcome.lock().unwrap().take().unwrap();
    assert!(deleted.is_ok(), "{deleted:?}");
    assert!(store.get_stage(&pending).unwrap().is_none());
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState, "{err}");

    assert!(store
        .find_instance_by_source(&SourceRef::new("EXPENSE", "77"))
        .unwrap()
        .is_none());
    assert_eq!(
        store
            .list_instances(&InstanceFilter::default(), QueryWindow::all())
            .unwrap()
            .total,
        0
    );
    assert!(store.open_tasks(None).unwrap().is_empty());
}

#[test]
fn test_stage_with_live_instance_cannot_be_deleted() {
    let f = common::fixture();
    let instance = f.start("77");
    let pending = f.stage_id("PENDING");

    let err = f.engine.graph().delete_stage(&pending).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert!(f.store.get_stage(&pending).unwrap().is_some());

    f.engine.cancel(&instance.id, &user("alice"), None).unwrap();
    f.engine.graph().delete_stage(&pending).unwrap();
}
