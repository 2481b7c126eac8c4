//! Shared fixture: an expense approval template wired to an in-memory
//! store, directory and entity-backed rule set.

#![allow(dead_code)]

use approvals_engine::{
    import_manifest, DirectoryUser, EntityRuleSet, ImportedTemplate, InMemoryDirectory,
    RecordingListener, RecordingNotifier, RoleInfo, StartRequest, TemplateManifest,
    WorkflowEngine,
};
use approvals_store::InMemoryWorkflowStore;
use approvals_types::{Metadata, SourceRef, TenantId, UserId, WorkflowInstance};
use serde_json::json;
use std::sync::Arc;

pub const EXPENSE_MANIFEST: &str = r#"
tenant_id = "acme"
code = "expense_approval"
name = "Expense approval"

[[stages]]
key = "PENDING"
name = "Pending approval"
initial = true
assignee_type = "DIRECT_SUPERVISOR"

[[stages]]
key = "APPROVED"
name = "Approved"
final = true

[[stages]]
key = "REJECTED"
name = "Rejected"
final = true

[[transitions]]
from = "PENDING"
to = "APPROVED"
button = "Approve"
condition_type = "approve"

[transitions.conditions.permissions]
required = ["supervisor"]

[[transitions.conditions.rules]]
rule = "amount_limit"
field = "amount"
max = 500.0

[[transitions]]
from = "PENDING"
to = "REJECTED"
button = "Reject"
condition_type = "reject"

[transitions.conditions.remarks]
required = true
min_length = 10

[[transitions]]
from = "PENDING"
button = "Comment"
"#;

pub struct Fixture {
    pub engine: WorkflowEngine,
    pub store: Arc<InMemoryWorkflowStore>,
    pub rules: Arc<EntityRuleSet>,
    pub events: Arc<RecordingListener>,
    pub notifier: Arc<RecordingNotifier>,
    pub imported: ImportedTemplate,
}

pub fn tenant() -> TenantId {
    TenantId::new("acme")
}

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

pub fn expense(amount: f64) -> Metadata {
    let mut fields = Metadata::new();
    fields.insert("amount".into(), json!(amount));
    fields.insert("requester".into(), json!("alice"));
    fields
}

/// alice reports to bob (manager); bob reports to carol (director)
pub fn fixture() -> Fixture {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let directory = InMemoryDirectory::new()
        .with_user(DirectoryUser::new("alice").with_supervisor("bob"))
        .with_user(
            DirectoryUser::new("bob")
                .with_supervisor("carol")
                .with_role(RoleInfo::new("r-mgr", "Manager").with_level(2)),
        )
        .with_user(
            DirectoryUser::new("carol").with_role(RoleInfo::new("r-dir", "Director").with_level(3)),
        );
    let rules = Arc::new(
        EntityRuleSet::new("EXPENSE")
            .with_label("Expense")
            .with_requester_field("requester")
            .with_entity("77", expense(120.0)),
    );
    let events = Arc::new(RecordingListener::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let engine = WorkflowEngine::builder(store.clone(), Arc::new(directory))
        .with_rule_set(rules.clone())
        .with_listener(events.clone())
        .with_notifier(notifier.clone())
        .build();

    let manifest = TemplateManifest::from_toml_str(EXPENSE_MANIFEST).unwrap();
    let imported = import_manifest(engine.templates(), engine.graph(), &manifest).unwrap();

    Fixture {
        engine,
        store,
        rules,
        events,
        notifier,
        imported,
    }
}

impl Fixture {
    pub fn stage_id(&self, key: &str) -> approvals_types::StageId {
        self.imported
            .stages
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.id.clone())
            .unwrap()
    }

    pub fn start(&self, source_id: &str) -> WorkflowInstance {
        self.engine
            .start(StartRequest::new(
                tenant(),
                "expense_approval",
                SourceRef::new("EXPENSE", source_id),
                user("alice"),
            ))
            .unwrap()
    }
}
