//! Run and node run records.
//!
//! A [`NodeRun`] is one execution instance of a plan node inside a run,
//! identified by the node id and the loop generation. Its status only ever moves
//! forward through the transition table in [`NodeRunStatus::can_transition`];
//! the single way back to `pending` is a retry, which opens a new attempt.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{OrchflowError, Result, utils, workflow::node::NodeId};

/// workflow run id
pub type RunId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Dispatched,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeRunStatus::Succeeded | NodeRunStatus::Failed | NodeRunStatus::Skipped | NodeRunStatus::TimedOut | NodeRunStatus::Cancelled)
    }

    /// Terminal without a usable output.
    pub fn is_dead(self) -> bool {
        self.is_terminal() && self != NodeRunStatus::Succeeded
    }

    pub fn can_transition(
        self,
        to: NodeRunStatus,
    ) -> bool {
        use NodeRunStatus::*;

        match (self, to) {
            (Pending, Dispatched | Running | Skipped | Cancelled) => true,
            (Dispatched, Running | Failed | TimedOut | Cancelled) => true,
            (Running, Succeeded | Failed | TimedOut | AwaitingApproval | Cancelled) => true,
            (AwaitingApproval, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Identity of a node run inside its workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRunKey {
    pub node_id: NodeId,
    pub generation: u32,
}

impl NodeRunKey {
    pub fn new(
        node_id: impl Into<NodeId>,
        generation: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            generation,
        }
    }
}

impl std::fmt::Display for NodeRunKey {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}#{}", self.node_id, self.generation)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeRun {
    pub node_id: NodeId,
    /// loop iteration index, 0 outside loop bodies
    pub generation: u32,
    pub status: NodeRunStatus,
    /// 1-based attempt counter, bumped by retries
    pub attempt: u32,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// agent run of the current attempt
    pub agent_run_id: Option<String>,
    pub approval_id: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl NodeRun {
    pub fn new(
        key: &NodeRunKey,
        input: Value,
    ) -> Self {
        Self {
            node_id: key.node_id.clone(),
            generation: key.generation,
            status: NodeRunStatus::Pending,
            attempt: 1,
            input,
            output: None,
            error: None,
            agent_run_id: None,
            approval_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn key(&self) -> NodeRunKey {
        NodeRunKey::new(self.node_id.clone(), self.generation)
    }

    pub fn transition(
        &mut self,
        to: NodeRunStatus,
    ) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(OrchflowError::Transition(format!("node run {} cannot move from {} to {}", self.key(), self.status, to)));
        }

        let now = utils::time::time_millis();
        if matches!(to, NodeRunStatus::Dispatched | NodeRunStatus::Running) && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Re-queue a failed or timed out node run for its next attempt.
    pub fn requeue(&mut self) -> Result<u32> {
        if !matches!(self.status, NodeRunStatus::Failed | NodeRunStatus::TimedOut) {
            return Err(OrchflowError::Transition(format!("node run {} cannot be retried from {}", self.key(), self.status)));
        }
        self.status = NodeRunStatus::Pending;
        self.attempt += 1;
        self.agent_run_id = None;
        self.completed_at = None;
        Ok(self.attempt)
    }
}

/// Queryable view of a workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// node runs in definition order, then by generation
    pub node_runs: Vec<NodeRun>,
    pub created_at: i64,
    pub terminal_at: Option<i64>,
    pub updated_at: i64,
}

impl WorkflowRun {
    pub fn node_run(
        &self,
        node_id: &str,
        generation: u32,
    ) -> Option<&NodeRun> {
        self.node_runs.iter().find(|n| n.node_id == node_id && n.generation == generation)
    }

    /// All generations of one node.
    pub fn generations(
        &self,
        node_id: &str,
    ) -> Vec<&NodeRun> {
        self.node_runs.iter().filter(|n| n.node_id == node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut run = NodeRun::new(&NodeRunKey::new("a", 0), json!({}));
        run.transition(NodeRunStatus::Dispatched).unwrap();
        run.transition(NodeRunStatus::Running).unwrap();
        run.transition(NodeRunStatus::AwaitingApproval).unwrap();
        run.transition(NodeRunStatus::Succeeded).unwrap();
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_no_backward_transitions() {
        let mut run = NodeRun::new(&NodeRunKey::new("a", 0), json!({}));
        run.transition(NodeRunStatus::Running).unwrap();
        run.transition(NodeRunStatus::Succeeded).unwrap();
        assert!(run.transition(NodeRunStatus::Running).is_err());
        assert!(run.transition(NodeRunStatus::Failed).is_err());
        assert!(run.requeue().is_err());
        assert_eq!(run.status, NodeRunStatus::Succeeded);
    }

    #[test]
    fn test_requeue_opens_new_attempt() {
        let mut run = NodeRun::new(&NodeRunKey::new("a", 0), json!({}));
        run.transition(NodeRunStatus::Dispatched).unwrap();
        run.transition(NodeRunStatus::TimedOut).unwrap();
        assert_eq!(run.requeue().unwrap(), 2);
        assert_eq!(run.status, NodeRunStatus::Pending);
    }

    #[test]
    fn test_terminal_sets() {
        assert!(NodeRunStatus::Skipped.is_dead());
        assert!(!NodeRunStatus::Succeeded.is_dead());
        assert!(!NodeRunStatus::AwaitingApproval.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
