use approvals_types::{
    HistoryAppend, HistoryEntry, InstanceStatus, Stage, StageId, TaskCard, TemplateId, TenantId,
    Transition, TransitionId, UserId, WorkflowInstance, WorkflowTask,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    /// `0` means unbounded
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

/// One page of results with the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn from_all(all: Vec<T>, window: QueryWindow) -> Self {
        let total = all.len();
        Self {
            items: window.apply(all),
            total,
            limit: window.limit,
            offset: window.offset,
        }
    }
}

/// Filters for instance listing. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub tenant_id: Option<TenantId>,
    pub template_code: Option<String>,
    pub status: Option<InstanceStatus>,
    pub source_module: Option<String>,
    pub started_by: Option<UserId>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.tenant_id
            .as_ref()
            .map_or(true, |t| &instance.tenant_id == t)
            && self
                .template_code
                .as_ref()
                .map_or(true, |c| &instance.template_code == c)
            && self.status.map_or(true, |s| instance.status == s)
            && self
                .source_module
                .as_ref()
                .map_or(true, |m| &instance.source.module == m)
            && self
                .started_by
                .as_ref()
                .map_or(true, |u| &instance.started_by == u)
            && self.started_after.map_or(true, |t| instance.started_at >= t)
            && self.started_before.map_or(true, |t| instance.started_at < t)
    }
}

/// How the instance row is written in a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceWrite {
    /// A new instance; its `(source.module, source.id)` must be unused
    Insert(WorkflowInstance),
    /// Replace an instance whose stored `version` equals `expected_version`
    Update {
        instance: WorkflowInstance,
        expected_version: u64,
    },
}

impl InstanceWrite {
    pub fn instance(&self) -> &WorkflowInstance {
        match self {
            Self::Insert(instance) | Self::Update { instance, .. } => instance,
        }
    }
}

/// An all-or-nothing batch of instance-side writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    pub instance: Option<InstanceWrite>,
    pub history: Vec<HistoryAppend>,
    pub insert_cards: Vec<TaskCard>,
    pub update_cards: Vec<TaskCard>,
    pub insert_tasks: Vec<WorkflowTask>,
    /// Only open tasks may be updated
    pub update_tasks: Vec<WorkflowTask>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, write: InstanceWrite) -> Self {
        self.instance = Some(write);
        self
    }

    pub fn append_history(&mut self, entry: HistoryAppend) {
        self.history.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_none()
            && self.history.is_empty()
            && self.insert_cards.is_empty()
            && self.update_cards.is_empty()
            && self.insert_tasks.is_empty()
            && self.update_tasks.is_empty()
    }
}

/// What a successful commit produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// The instance as stored (with its new version)
    pub instance: Option<WorkflowInstance>,
    pub history: Vec<HistoryEntry>,
}

/// A revision-checked batch of graph writes for one template.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphChangeSet {
    pub template_id: TemplateId,
    pub expected_revision: u64,
    pub upsert_stages: Vec<Stage>,
    pub delete_stages: Vec<StageId>,
    pub upsert_transitions: Vec<Transition>,
    pub delete_transitions: Vec<TransitionId>,
}

impl GraphChangeSet {
    pub fn new(template_id: TemplateId, expected_revision: u64) -> Self {
        Self {
            template_id,
            expected_revision,
            upsert_stages: Vec::new(),
            delete_stages: Vec::new(),
            upsert_transitions: Vec::new(),
            delete_transitions: Vec::new(),
        }
    }
}
