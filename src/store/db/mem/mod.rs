mod collect;
mod r#impl;

use std::{collections::HashMap, sync::Arc};

use serde_json::Value as JsonValue;

use crate::{
    hitl::ApprovalRequest,
    runtime::WorkflowRun,
    store::{DbCollection, DbStore, data::*},
};
pub use collect::Collect;

#[derive(Debug, Clone)]
pub struct MemStore {
    workflows: Arc<Collect<WorkflowRecord>>,
    runs: Arc<Collect<WorkflowRun>>,
    archive: Arc<Collect<WorkflowRun>>,
    events: Arc<Collect<EventRecord>>,
    approvals: Arc<Collect<ApprovalRequest>>,
}

/// A record the in-memory collections can index and filter.
trait DbDocument: Clone + Send + Sync {
    fn id(&self) -> &str;
    /// queryable fields
    fn doc(&self) -> HashMap<String, JsonValue>;
}

impl DbStore for MemStore {
    fn workflows(&self) -> Arc<dyn DbCollection<Item = WorkflowRecord>> {
        self.workflows.clone()
    }

    fn runs(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>> {
        self.runs.clone()
    }

    fn archive(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>> {
        self.archive.clone()
    }

    fn events(&self) -> Arc<dyn DbCollection<Item = EventRecord>> {
        self.events.clone()
    }

    fn approvals(&self) -> Arc<dyn DbCollection<Item = ApprovalRequest>> {
        self.approvals.clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(Collect::new("workflows")),
            runs: Arc::new(Collect::new("runs")),
            archive: Arc::new(Collect::new("archive")),
            events: Arc::new(Collect::new("events")),
            approvals: Arc::new(Collect::new("approvals")),
        }
    }
}
