//! Human-in-the-loop approval gates.
//!
//! When an agent node with an approval policy succeeds, its run parks the node
//! in `awaiting_approval` and opens an [`ApprovalRequest`] here. A reviewer's
//! decision is forwarded to the run's coordinator queue; the node run only
//! changes once the coordinator applies it.

mod policy;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    OrchflowError, Result, ShareLock,
    coordinator::{RunDirectory, RunInput},
    runtime::{NodeRunKey, RunId},
    store::Store,
    utils,
    workflow::node::NodeId,
};

pub use policy::{ApprovalMode, ApprovalPolicy, GateCheck};

/// Reviewer verdict submitted through [`ApprovalManager::decide`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// Recorded outcome of an approval request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    /// the policy was satisfied without a reviewer
    AutoApproved,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub generation: u32,
    pub attempt: u32,
    /// agent output held back until the decision
    pub output: Value,
    pub decision: Option<ApprovalDecision>,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
    /// the run was cancelled before anyone decided
    pub withdrawn: bool,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.decision.is_none() && !self.withdrawn
    }

    fn key(&self) -> NodeRunKey {
        NodeRunKey::new(self.node_id.clone(), self.generation)
    }
}

pub struct ApprovalManager {
    requests: ShareLock<HashMap<String, ApprovalRequest>>,
    runs: Arc<RunDirectory>,
    store: Arc<Store>,
}

impl ApprovalManager {
    pub fn new(
        runs: Arc<RunDirectory>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            runs,
            store,
        }
    }

    /// Open a pending request for a gated node run.
    pub fn open(
        &self,
        approval_id: &str,
        run_id: &str,
        key: &NodeRunKey,
        attempt: u32,
        output: Value,
    ) -> Result<ApprovalRequest> {
        let request = ApprovalRequest {
            id: approval_id.to_string(),
            run_id: run_id.to_string(),
            node_id: key.node_id.clone(),
            generation: key.generation,
            attempt,
            output,
            decision: None,
            decided_by: None,
            comment: None,
            created_at: utils::time::time_millis(),
            decided_at: None,
            withdrawn: false,
        };
        self.insert(request.clone())?;
        info!(run_id, approval_id, node_id = %key.node_id, "approval requested");
        Ok(request)
    }

    /// Record a decision the policy made on its own, for audit.
    pub fn record_auto(
        &self,
        run_id: &str,
        key: &NodeRunKey,
        attempt: u32,
        output: Value,
    ) -> Result<ApprovalRequest> {
        let now = utils::time::time_millis();
        let request = ApprovalRequest {
            id: utils::shortid(),
            run_id: run_id.to_string(),
            node_id: key.node_id.clone(),
            generation: key.generation,
            attempt,
            output,
            decision: Some(ApprovalDecision::AutoApproved),
            decided_by: Some("policy".to_string()),
            comment: None,
            created_at: now,
            decided_at: Some(now),
            withdrawn: false,
        };
        self.insert(request.clone())?;
        Ok(request)
    }

    /// Withdraw every pending request of a run.
    pub fn withdraw(
        &self,
        run_id: &str,
    ) -> Result<usize> {
        let mut requests = self.requests.write().map_err(|e| OrchflowError::Approval(e.to_string()))?;
        let mut withdrawn = 0;
        for request in requests.values_mut().filter(|r| r.run_id == run_id && r.is_pending()) {
            request.withdrawn = true;
            self.store.save_approval(request)?;
            withdrawn += 1;
        }
        Ok(withdrawn)
    }

    /// Decide a pending request.
    ///
    /// The decision is only recorded once the run's coordinator accepted it,
    /// so a request whose run is gone stays pending and reports an error.
    pub fn decide(
        &self,
        id: &str,
        decision: Decision,
        comment: &str,
        decided_by: &str,
    ) -> Result<ApprovalRequest> {
        if comment.trim().is_empty() {
            return Err(OrchflowError::Approval("a comment is required to decide an approval".to_string()));
        }

        let mut requests = self.requests.write().map_err(|e| OrchflowError::Approval(e.to_string()))?;
        let request = requests.get_mut(id).ok_or_else(|| OrchflowError::Approval(format!("approval request {} not found", id)))?;
        if request.withdrawn {
            return Err(OrchflowError::Approval(format!("approval request {} was withdrawn", id)));
        }
        if request.decision.is_some() {
            return Err(OrchflowError::Approval(format!("approval request {} is already decided", id)));
        }

        let approved = decision == Decision::Approve;
        let input = RunInput::ApprovalDecided {
            key: request.key(),
            approval_id: request.id.clone(),
            approved,
            comment: comment.to_string(),
            decided_by: decided_by.to_string(),
        };
        // the request stays undecided if the run cannot take the decision
        if let Err(e) = self.runs.deliver(&request.run_id, input) {
            warn!(approval_id = id, run_id = %request.run_id, error = %e, "approval decision not delivered");
            return Err(e);
        }

        request.decision = Some(if approved { ApprovalDecision::Approved } else { ApprovalDecision::Rejected });
        request.decided_by = Some(decided_by.to_string());
        request.comment = Some(comment.to_string());
        request.decided_at = Some(utils::time::time_millis());
        self.store.save_approval(request)?;
        info!(approval_id = id, run_id = %request.run_id, decision = decision.as_ref(), decided_by, "approval decided");

        Ok(request.clone())
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<ApprovalRequest> {
        self.requests.read().ok()?.get(id).cloned()
    }

    /// Pending requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let Ok(requests) = self.requests.read() else {
            return Vec::new();
        };
        let mut pending: Vec<ApprovalRequest> = requests.values().filter(|r| r.is_pending()).cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    fn insert(
        &self,
        request: ApprovalRequest,
    ) -> Result<()> {
        self.store.save_approval(&request)?;
        let mut requests = self.requests.write().map_err(|e| OrchflowError::Approval(e.to_string()))?;
        requests.insert(request.id.clone(), request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{common::Queue, coordinator::RunHandle, store::MemStore};

    fn manager() -> (ApprovalManager, Arc<RunDirectory>) {
        let runs = Arc::new(RunDirectory::new(16));
        let store = Arc::new(Store::new(&MemStore::new()));
        (ApprovalManager::new(runs.clone(), store), runs)
    }

    #[test]
    fn test_decide_requires_comment() {
        let (manager, _) = manager();
        manager.open("ap1", "run1", &NodeRunKey::new("review", 0), 1, json!({})).unwrap();
        let err = manager.decide("ap1", Decision::Approve, "  ", "alice").unwrap_err();
        assert!(matches!(err, OrchflowError::Approval(_)));
        assert!(manager.get("ap1").unwrap().is_pending());
    }

    #[test]
    fn test_decide_forwards_to_run() {
        let (manager, runs) = manager();
        let queue = Queue::new(8);
        runs.register("run1", RunHandle::new("wf", queue.clone())).unwrap();
        manager.open("ap1", "run1", &NodeRunKey::new("review", 2), 1, json!({ "draft": "x" })).unwrap();

        let decided = manager.decide("ap1", Decision::Reject, "tone is off", "alice").unwrap();
        assert_eq!(decided.decision, Some(ApprovalDecision::Rejected));
        assert!(manager.pending().is_empty());

        match queue.try_next() {
            Some(RunInput::ApprovalDecided {
                key,
                approved,
                ..
            }) => {
                assert_eq!(key, NodeRunKey::new("review", 2));
                assert!(!approved);
            }
            other => panic!("unexpected input {:?}", other),
        }

        assert!(manager.decide("ap1", Decision::Approve, "changed my mind", "bob").is_err());
    }

    #[test]
    fn test_decide_for_inactive_run_keeps_request_pending() {
        let (manager, _) = manager();
        manager.open("ap1", "gone", &NodeRunKey::new("review", 0), 1, json!({})).unwrap();
        assert!(matches!(manager.decide("ap1", Decision::Approve, "ok", "alice"), Err(OrchflowError::Run(_))));
        assert_eq!(manager.pending().len(), 1);
    }

    #[test]
    fn test_withdraw_and_auto_records() {
        let (manager, _) = manager();
        manager.open("ap1", "run1", &NodeRunKey::new("a", 0), 1, json!({})).unwrap();
        manager.open("ap2", "run2", &NodeRunKey::new("a", 0), 1, json!({})).unwrap();
        let auto = manager.record_auto("run1", &NodeRunKey::new("b", 0), 1, json!({})).unwrap();

        assert_eq!(manager.withdraw("run1").unwrap(), 1);
        assert!(manager.get("ap1").unwrap().withdrawn);
        assert_eq!(manager.get(&auto.id).unwrap().decision, Some(ApprovalDecision::AutoApproved));
        assert_eq!(manager.pending().iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["ap2"]);
        assert!(manager.decide("ap1", Decision::Approve, "late", "alice").is_err());
    }
}
