use std::sync::Arc;

use tracing::{debug, trace};

use crate::{OrchflowError, Result, hitl::ApprovalRequest, model::WorkflowModel, runtime::WorkflowRun, utils};

use super::{DbCollection, DbStore, data::*, query::Query};

pub struct Store {
    workflows: Arc<dyn DbCollection<Item = WorkflowRecord>>,
    runs: Arc<dyn DbCollection<Item = WorkflowRun>>,
    archive: Arc<dyn DbCollection<Item = WorkflowRun>>,
    events: Arc<dyn DbCollection<Item = EventRecord>>,
    approvals: Arc<dyn DbCollection<Item = ApprovalRequest>>,
}

impl Store {
    pub fn new(db: &dyn DbStore) -> Self {
        Self {
            workflows: db.workflows(),
            runs: db.runs(),
            archive: db.archive(),
            events: db.events(),
            approvals: db.approvals(),
        }
    }

    pub fn workflows(&self) -> Arc<dyn DbCollection<Item = WorkflowRecord>> {
        self.workflows.clone()
    }

    pub fn runs(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>> {
        self.runs.clone()
    }

    pub fn archive(&self) -> Arc<dyn DbCollection<Item = WorkflowRun>> {
        self.archive.clone()
    }

    pub fn events(&self) -> Arc<dyn DbCollection<Item = EventRecord>> {
        self.events.clone()
    }

    pub fn approvals(&self) -> Arc<dyn DbCollection<Item = ApprovalRequest>> {
        self.approvals.clone()
    }

    pub fn deploy(
        &self,
        workflow: &WorkflowModel,
    ) -> Result<bool> {
        trace!("store::deploy({})", workflow.id);
        if workflow.id.is_empty() {
            return Err(OrchflowError::Validation("missing id in workflow".into()));
        }
        let text = serde_json::to_string(workflow)?;
        match self.workflows.find(&workflow.id) {
            Ok(m) => self.workflows.update(&WorkflowRecord {
                id: workflow.id.clone(),
                name: workflow.name.clone(),
                desc: workflow.desc.clone(),
                data: text,
                create_time: m.create_time,
                update_time: utils::time::time_millis(),
            }),
            Err(_) => self.workflows.create(&WorkflowRecord {
                id: workflow.id.clone(),
                name: workflow.name.clone(),
                desc: workflow.desc.clone(),
                data: text,
                create_time: utils::time::time_millis(),
                update_time: 0,
            }),
        }
    }

    /// Load a deployed definition.
    pub fn workflow(
        &self,
        id: &str,
    ) -> Result<WorkflowModel> {
        let record = self.workflows.find(id).map_err(|_| OrchflowError::Run(format!("workflow {} is not deployed", id)))?;
        WorkflowModel::from_json(&record.data)
    }

    pub fn save_run(
        &self,
        run: &WorkflowRun,
    ) -> Result<bool> {
        upsert(self.runs.as_ref(), &run.id, run)
    }

    /// A run from the active set, falling back to the archive.
    pub fn find_run(
        &self,
        id: &str,
    ) -> Result<WorkflowRun> {
        match self.runs.find(id) {
            Ok(run) => Ok(run),
            Err(_) => self.archive.find(id).map_err(|_| OrchflowError::Run(format!("run {} not found", id))),
        }
    }

    /// Runs of a workflow from the active set and the archive, oldest first.
    pub fn runs_of(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let q = Query::new().with_filter("workflow_id", workflow_id).with_order("created_at", false).with_limit(usize::MAX);
        let mut runs = self.runs.query(&q)?.rows;
        runs.extend(self.archive.query(&q)?.rows);
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    /// Terminal runs still in the active set.
    pub fn terminal_runs(&self) -> Result<Vec<WorkflowRun>> {
        let q = Query::new().with_limit(usize::MAX);
        Ok(self.runs.query(&q)?.rows.into_iter().filter(|r| r.status.is_terminal()).collect())
    }

    /// Move a terminal run from the active set into the archive.
    pub fn archive_run(
        &self,
        id: &str,
    ) -> Result<bool> {
        let run = self.runs.find(id)?;
        if !run.status.is_terminal() {
            return Err(OrchflowError::Run(format!("run {} is still {}", id, run.status)));
        }
        upsert(self.archive.as_ref(), id, &run)?;
        debug!(run_id = id, "run archived");
        self.runs.delete(id)
    }

    /// Events of a run in emission order.
    pub fn events_of(
        &self,
        run_id: &str,
    ) -> Result<Vec<EventRecord>> {
        let q = Query::new().with_filter("run_id", run_id).with_limit(usize::MAX);
        Ok(self.events.query(&q)?.rows)
    }

    pub fn save_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<bool> {
        upsert(self.approvals.as_ref(), &request.id, request)
    }
}

fn upsert<T>(
    collection: &dyn DbCollection<Item = T>,
    id: &str,
    data: &T,
) -> Result<bool> {
    if collection.exists(id)? { collection.update(data) } else { collection.create(data) }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        runtime::RunStatus,
        store::MemStore,
    };

    fn run(
        id: &str,
        status: RunStatus,
        created_at: i64,
    ) -> WorkflowRun {
        WorkflowRun {
            id: id.to_string(),
            workflow_id: "wf".to_string(),
            status,
            input: json!({}),
            output: None,
            error: None,
            node_runs: Vec::new(),
            created_at,
            terminal_at: None,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_deploy_and_load() {
        let store = Store::new(&MemStore::new());
        let model = WorkflowModel::from_json(r#"{ "id": "wf", "name": "demo", "nodes": [{ "id": "start", "type": "trigger" }] }"#).unwrap();
        assert!(store.deploy(&model).unwrap());
        assert!(store.deploy(&model).unwrap());
        assert_eq!(store.workflow("wf").unwrap().name, "demo");
        assert!(matches!(store.workflow("nope"), Err(OrchflowError::Run(_))));
    }

    #[test]
    fn test_archive_keeps_runs_queryable() {
        let store = Store::new(&MemStore::new());
        store.save_run(&run("r1", RunStatus::Succeeded, 1)).unwrap();
        store.save_run(&run("r2", RunStatus::Running, 2)).unwrap();

        assert_eq!(store.terminal_runs().unwrap().len(), 1);
        assert!(store.archive_run("r2").is_err());
        assert!(store.archive_run("r1").unwrap());
        assert!(!store.runs().exists("r1").unwrap());
        assert_eq!(store.find_run("r1").unwrap().status, RunStatus::Succeeded);
        assert_eq!(store.runs_of("wf").unwrap().iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
    }
}
