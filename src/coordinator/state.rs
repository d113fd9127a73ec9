//! Per-run state machine.
//!
//! `RunState` owns every node run of one workflow run. It is synchronous and
//! side-effect free: the coordinator loop feeds it [`RunInput`]s one at a time
//! and executes the [`Effect`]s it hands back (dispatches, timers, approval
//! requests, events). After every input the ready-set is recomputed until no
//! more progress is possible.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    ExecutionMode, OrchflowError,
    events::{Message, NodeEvent, RunEvent},
    hitl::GateCheck,
    runtime::{NodeRun, NodeRunKey, NodeRunStatus, RunId, RunStatus, WorkflowRun},
    utils,
    workflow::{
        ExecutionPlan,
        edge::SourceHandle,
        eval::{LoopCursor, MergeStrategy, apply_filter, lookup, merge},
        node::{FailurePolicy, Node, NodeId, NodeKind},
        template::{TemplateScope, resolve_json_value},
    },
};

/// Events consumed by a run's coordinator loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RunInput {
    Cancel,
    /// the agent runtime accepted the dispatch
    DispatchAccepted {
        key: NodeRunKey,
        attempt: u32,
        agent_run_id: String,
    },
    /// the agent runtime could not be reached, or quota denied the dispatch
    DispatchFailed {
        key: NodeRunKey,
        attempt: u32,
        error: String,
    },
    AgentCompleted {
        key: NodeRunKey,
        attempt: u32,
        output: Value,
    },
    AgentFailed {
        key: NodeRunKey,
        attempt: u32,
        error: String,
    },
    AgentTimedOut {
        key: NodeRunKey,
        attempt: u32,
    },
    DelayElapsed {
        key: NodeRunKey,
        attempt: u32,
    },
    RetryDue {
        key: NodeRunKey,
        attempt: u32,
    },
    ApprovalDecided {
        key: NodeRunKey,
        approval_id: String,
        approved: bool,
        comment: String,
        decided_by: String,
    },
}

/// Work the coordinator loop performs on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DispatchAgent {
        key: NodeRunKey,
        attempt: u32,
        agent_id: String,
        input: Value,
        timeout: Duration,
    },
    StartDelay {
        key: NodeRunKey,
        attempt: u32,
        delay: Duration,
    },
    ScheduleRetry {
        key: NodeRunKey,
        attempt: u32,
        delay: Duration,
    },
    RequestApproval {
        approval_id: String,
        key: NodeRunKey,
        attempt: u32,
        output: Value,
    },
    RecordAutoApproval {
        key: NodeRunKey,
        attempt: u32,
        output: Value,
    },
    /// best-effort abort of every outstanding agent run
    AbortAgents,
    /// drop every pending approval request of the run
    WithdrawApprovals,
    Emit(Message),
    Finished(RunStatus),
}

/// Iteration in progress of a loop node.
#[derive(Debug)]
struct LoopFrame {
    cursor: LoopCursor,
    generation: u32,
    body_input: Value,
}

enum Readiness {
    Wait,
    Skip,
    /// live predecessor outputs, in edge order
    Ready(Vec<(NodeId, Value)>),
}

enum Outcome {
    Failed,
    TimedOut,
}

pub struct RunState {
    id: RunId,
    plan: Arc<ExecutionPlan>,
    ceiling: usize,
    default_timeout: Duration,

    status: RunStatus,
    input: Value,
    output: Option<Value>,
    error: Option<String>,
    created_at: i64,
    terminal_at: Option<i64>,
    updated_at: i64,

    node_runs: HashMap<NodeRunKey, NodeRun>,
    /// branch selected by each condition node run
    branches: HashMap<NodeRunKey, SourceHandle>,
    loops: HashMap<NodeId, LoopFrame>,
    /// number of iterations each loop node started
    iterations: HashMap<NodeId, u32>,
    /// re-queued node runs waiting for their retry backoff
    backoff: HashSet<NodeRunKey>,
    completion_seq: u64,
    completed: HashMap<NodeRunKey, u64>,

    effects: Vec<Effect>,
}

impl RunState {
    pub fn new(
        id: RunId,
        plan: Arc<ExecutionPlan>,
        input: Value,
        ceiling: usize,
        default_timeout: Duration,
    ) -> Self {
        let now = utils::time::time_millis();
        let ceiling = match plan.mode() {
            ExecutionMode::Sequential => 1,
            _ => plan.concurrency().unwrap_or(ceiling).max(1),
        };

        Self {
            id,
            plan,
            ceiling,
            default_timeout,
            status: RunStatus::Running,
            input,
            output: None,
            error: None,
            created_at: now,
            terminal_at: None,
            updated_at: now,
            node_runs: HashMap::new(),
            branches: HashMap::new(),
            loops: HashMap::new(),
            iterations: HashMap::new(),
            backoff: HashSet::new(),
            completion_seq: 0,
            completed: HashMap::new(),
            effects: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seed the trigger node runs and drive the run as far as it goes.
    pub fn start(&mut self) -> Vec<Effect> {
        info!(run_id = %self.id, workflow_id = %self.plan.id(), "run started");
        self.emit(Message::run(&self.id, RunEvent::Started));
        self.advance();
        std::mem::take(&mut self.effects)
    }

    pub fn apply(
        &mut self,
        input: RunInput,
    ) -> Vec<Effect> {
        if self.is_terminal() {
            debug!(run_id = %self.id, ?input, "run is terminal, input discarded");
            return Vec::new();
        }

        match input {
            RunInput::Cancel => self.cancel(),
            RunInput::DispatchAccepted {
                key,
                attempt,
                agent_run_id,
            } => self.on_dispatch_accepted(&key, attempt, agent_run_id),
            RunInput::DispatchFailed {
                key,
                attempt,
                error,
            } => {
                if self.is_active_attempt(&key, attempt) {
                    self.fail_node(&key, Outcome::Failed, format!("dispatch failed: {}", error), true);
                }
            }
            RunInput::AgentCompleted {
                key,
                attempt,
                output,
            } => self.on_agent_completed(&key, attempt, output),
            RunInput::AgentFailed {
                key,
                attempt,
                error,
            } => {
                if self.is_active_attempt(&key, attempt) {
                    self.fail_node(&key, Outcome::Failed, error, true);
                }
            }
            RunInput::AgentTimedOut {
                key,
                attempt,
            } => {
                if self.is_active_attempt(&key, attempt) {
                    let error = OrchflowError::Timeout(format!("attempt {} exceeded its deadline", attempt));
                    self.fail_node(&key, Outcome::TimedOut, error.to_string(), true);
                }
            }
            RunInput::DelayElapsed {
                key,
                attempt,
            } => {
                if self.is_active_attempt(&key, attempt) {
                    let output = self.node_runs.get(&key).map(|r| r.input.clone()).unwrap_or(Value::Null);
                    self.succeed(&key, output);
                }
            }
            RunInput::RetryDue {
                key,
                attempt,
            } => {
                if self.node_runs.get(&key).is_some_and(|r| r.attempt == attempt) {
                    self.backoff.remove(&key);
                }
            }
            RunInput::ApprovalDecided {
                key,
                approval_id,
                approved,
                comment,
                decided_by,
            } => self.on_approval_decided(&key, &approval_id, approved, &comment, &decided_by),
        }

        if !self.is_terminal() {
            self.advance();
        }
        self.updated_at = utils::time::time_millis();
        std::mem::take(&mut self.effects)
    }

    /// Queryable view of the run.
    pub fn snapshot(&self) -> WorkflowRun {
        let mut node_runs: Vec<NodeRun> = self.node_runs.values().cloned().collect();
        node_runs.sort_by_key(|r| (self.plan.node(&r.node_id).map(|n| n.index).unwrap_or(usize::MAX), r.generation));

        WorkflowRun {
            id: self.id.clone(),
            workflow_id: self.plan.id().to_string(),
            status: self.status,
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            node_runs,
            created_at: self.created_at,
            terminal_at: self.terminal_at,
            updated_at: self.updated_at,
        }
    }

    fn emit(
        &mut self,
        message: Message,
    ) {
        self.effects.push(Effect::Emit(message));
    }

    fn node(
        &self,
        id: &str,
    ) -> Option<Node> {
        self.plan.node(id).cloned()
    }

    /// The attempt is the current one and the node run is still waiting on it.
    fn is_active_attempt(
        &self,
        key: &NodeRunKey,
        attempt: u32,
    ) -> bool {
        let active = self.node_runs.get(key).is_some_and(|r| r.attempt == attempt && matches!(r.status, NodeRunStatus::Dispatched | NodeRunStatus::Running));
        if !active {
            debug!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, attempt, "stale node event ignored");
        }
        active
    }

    /// Move a node run to `to` and publish the matching event.
    fn transition(
        &mut self,
        key: &NodeRunKey,
        to: NodeRunStatus,
    ) -> bool {
        let Some(run) = self.node_runs.get_mut(key) else {
            return false;
        };
        if let Err(e) = run.transition(to) {
            warn!(run_id = %self.id, error = %e, "rejected node run transition");
            return false;
        }

        let event = match to {
            NodeRunStatus::Pending => NodeEvent::Pending,
            NodeRunStatus::Dispatched => NodeEvent::Dispatched {
                attempt: run.attempt,
            },
            NodeRunStatus::Running => NodeEvent::Running,
            NodeRunStatus::AwaitingApproval => NodeEvent::AwaitingApproval {
                approval_id: run.approval_id.clone().unwrap_or_default(),
            },
            NodeRunStatus::Succeeded => NodeEvent::Succeeded,
            NodeRunStatus::Failed => NodeEvent::Failed {
                error: run.error.clone().unwrap_or_default(),
            },
            NodeRunStatus::Skipped => NodeEvent::Skipped,
            NodeRunStatus::TimedOut => NodeEvent::TimedOut,
            NodeRunStatus::Cancelled => NodeEvent::Cancelled,
        };
        debug!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, attempt = run.attempt, status = %to, "node run transition");

        if to.is_terminal() {
            self.completion_seq += 1;
            self.completed.insert(key.clone(), self.completion_seq);
        }
        self.emit(Message::node(&self.id, &key.node_id, key.generation, event));
        true
    }

    fn succeed(
        &mut self,
        key: &NodeRunKey,
        output: Value,
    ) {
        if let Some(run) = self.node_runs.get_mut(key) {
            run.output = Some(output);
        }
        self.transition(key, NodeRunStatus::Succeeded);
    }

    /// Apply the node's failure policy to a failed attempt.
    fn fail_node(
        &mut self,
        key: &NodeRunKey,
        outcome: Outcome,
        error: String,
        retryable: bool,
    ) {
        let Some(node) = self.node(&key.node_id) else {
            return;
        };
        let Some(run) = self.node_runs.get_mut(key) else {
            return;
        };
        run.error = Some(error.clone());
        let attempt = run.attempt;
        let dispatched = run.status == NodeRunStatus::Dispatched;

        if let FailurePolicy::Fallback {
            default_value,
        } = &node.failure_policy
        {
            warn!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, attempt, %error, "node failed, using fallback output");
            if dispatched {
                self.transition(key, NodeRunStatus::Running);
            }
            self.succeed(key, default_value.clone());
            return;
        }

        let status = match outcome {
            Outcome::Failed => NodeRunStatus::Failed,
            Outcome::TimedOut => NodeRunStatus::TimedOut,
        };
        if !self.transition(key, status) {
            return;
        }

        let delay = if retryable { node.failure_policy.retry_delay(attempt + 1) } else { None };
        let Some(delay) = delay else {
            warn!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, attempt, %error, "node failed");
            return;
        };

        let Some(run) = self.node_runs.get_mut(key) else {
            return;
        };
        let Ok(next) = run.requeue() else {
            return;
        };
        info!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, attempt = next, ?delay, "retrying node");
        self.emit(Message::node(&self.id, &key.node_id, key.generation, NodeEvent::Retry {
            attempt: next,
        }));
        if !delay.is_zero() {
            self.backoff.insert(key.clone());
            self.effects.push(Effect::ScheduleRetry {
                key: key.clone(),
                attempt: next,
                delay,
            });
        }
    }

    fn on_dispatch_accepted(
        &mut self,
        key: &NodeRunKey,
        attempt: u32,
        agent_run_id: String,
    ) {
        let Some(run) = self.node_runs.get_mut(key) else {
            return;
        };
        if run.attempt != attempt {
            return;
        }
        run.agent_run_id = Some(agent_run_id);
        if run.status == NodeRunStatus::Dispatched {
            self.transition(key, NodeRunStatus::Running);
        }
    }

    fn on_agent_completed(
        &mut self,
        key: &NodeRunKey,
        attempt: u32,
        output: Value,
    ) {
        if !self.is_active_attempt(key, attempt) {
            return;
        }
        let Some(node) = self.node(&key.node_id) else {
            return;
        };
        // the callback can overtake the dispatch acknowledgement
        if self.node_runs.get(key).is_some_and(|r| r.status == NodeRunStatus::Dispatched) {
            self.transition(key, NodeRunStatus::Running);
        }

        let Some(policy) = &node.approval else {
            self.succeed(key, output);
            return;
        };

        match policy.check(&output) {
            GateCheck::Bypass => {
                debug!(run_id = %self.id, node_id = %key.node_id, mode = policy.mode.as_ref(), "approval gate bypassed");
                self.effects.push(Effect::RecordAutoApproval {
                    key: key.clone(),
                    attempt,
                    output: output.clone(),
                });
                self.succeed(key, output);
            }
            GateCheck::Required => {
                let approval_id = utils::longid();
                if let Some(run) = self.node_runs.get_mut(key) {
                    run.output = Some(output.clone());
                    run.approval_id = Some(approval_id.clone());
                }
                info!(run_id = %self.id, node_id = %key.node_id, %approval_id, "node awaiting approval");
                self.effects.push(Effect::RequestApproval {
                    approval_id,
                    key: key.clone(),
                    attempt,
                    output,
                });
                self.transition(key, NodeRunStatus::AwaitingApproval);
            }
        }
    }

    fn on_approval_decided(
        &mut self,
        key: &NodeRunKey,
        approval_id: &str,
        approved: bool,
        comment: &str,
        decided_by: &str,
    ) {
        let Some(run) = self.node_runs.get_mut(key) else {
            return;
        };
        if run.status != NodeRunStatus::AwaitingApproval || run.approval_id.as_deref() != Some(approval_id) {
            debug!(run_id = %self.id, node_id = %key.node_id, approval_id, "stale approval decision ignored");
            return;
        }

        if approved {
            self.transition(key, NodeRunStatus::Succeeded);
        } else {
            // a rejection is final; the failure policy does not apply
            run.error = Some(format!("rejected by {}: {}", decided_by, comment));
            self.transition(key, NodeRunStatus::Failed);
        }
    }

    fn cancel(&mut self) {
        info!(run_id = %self.id, "cancelling run");
        let mut open: Vec<NodeRunKey> = self.node_runs.values().filter(|r| !r.status.is_terminal()).map(NodeRun::key).collect();
        open.sort();
        for key in open {
            self.transition(&key, NodeRunStatus::Cancelled);
        }
        self.loops.clear();
        self.backoff.clear();
        self.effects.push(Effect::AbortAgents);
        self.effects.push(Effect::WithdrawApprovals);
        self.finish(RunStatus::Cancelled);
    }

    fn finish(
        &mut self,
        status: RunStatus,
    ) {
        self.status = status;
        self.terminal_at = Some(utils::time::time_millis());

        let event = match status {
            RunStatus::Succeeded => RunEvent::Succeeded,
            RunStatus::Cancelled => RunEvent::Cancelled,
            _ => RunEvent::Failed {
                error: self.error.clone().unwrap_or_default(),
            },
        };
        info!(run_id = %self.id, status = %status, "run finished");
        self.emit(Message::run(&self.id, event));
        self.effects.push(Effect::Finished(status));
    }

    /// Recompute readiness and start work until nothing changes.
    fn advance(&mut self) {
        loop {
            let mut progressed = self.create_top_level();
            let active: Vec<(NodeId, u32)> = self.loops.iter().map(|(id, frame)| (id.clone(), frame.generation)).collect();
            for (loop_id, generation) in active {
                progressed |= self.create_body(&loop_id, generation);
            }
            progressed |= self.close_iterations();
            progressed |= self.start_pending();
            if !progressed {
                break;
            }
        }
        self.check_finished();
    }

    fn create_top_level(&mut self) -> bool {
        let mut progressed = false;
        let order = self.plan.topological_order().to_vec();
        for id in order {
            let Some(node) = self.node(&id) else {
                continue;
            };
            let key = NodeRunKey::new(id.clone(), 0);
            if self.node_runs.contains_key(&key) {
                continue;
            }
            if let Some(owner) = &node.loop_owner {
                // a loop that ends without iterating leaves its body skipped
                let owner_done = self.node_runs.get(&NodeRunKey::new(owner.clone(), 0)).is_some_and(|r| r.status.is_terminal());
                if owner_done && !self.loops.contains_key(owner) && self.iterations.get(owner).copied().unwrap_or(0) == 0 {
                    self.create_node_run(&key, Readiness::Skip);
                    progressed = true;
                }
                continue;
            }
            let readiness = self.readiness(&node, 0);
            progressed |= self.create_node_run(&key, readiness);
        }
        progressed
    }

    fn create_body(
        &mut self,
        loop_id: &str,
        generation: u32,
    ) -> bool {
        let body: HashSet<NodeId> = self.plan.body_of(loop_id).iter().cloned().collect();
        let order: Vec<NodeId> = self.plan.topological_order().iter().filter(|id| body.contains(*id)).cloned().collect();

        let mut progressed = false;
        for id in order {
            let key = NodeRunKey::new(id.clone(), generation);
            if self.node_runs.contains_key(&key) {
                continue;
            }
            let Some(node) = self.node(&id) else {
                continue;
            };
            let readiness = self.readiness(&node, generation);
            progressed |= self.create_node_run(&key, readiness);
        }
        progressed
    }

    fn create_node_run(
        &mut self,
        key: &NodeRunKey,
        readiness: Readiness,
    ) -> bool {
        match readiness {
            Readiness::Wait => false,
            Readiness::Skip => {
                self.node_runs.insert(key.clone(), NodeRun::new(key, Value::Null));
                self.transition(key, NodeRunStatus::Skipped);
                true
            }
            Readiness::Ready(live) => {
                let input = self.combine_inputs(live);
                self.node_runs.insert(key.clone(), NodeRun::new(key, input));
                self.emit(Message::node(&self.id, &key.node_id, key.generation, NodeEvent::Pending));
                true
            }
        }
    }

    fn combine_inputs(
        &self,
        mut live: Vec<(NodeId, Value)>,
    ) -> Value {
        match live.len() {
            0 => self.input.clone(),
            1 => live.remove(0).1,
            _ => Value::Object(live.into_iter().collect::<Map<String, Value>>()),
        }
    }

    /// Generation a node's run lives in when seen from generation `generation`.
    fn generation_of(
        &self,
        node_id: &str,
        generation: u32,
    ) -> u32 {
        match self.plan.node(node_id) {
            Some(node) if node.in_loop_body() => generation,
            _ => 0,
        }
    }

    fn readiness(
        &self,
        node: &Node,
        generation: u32,
    ) -> Readiness {
        let mut live = Vec::new();
        let mut dead = false;
        let mut waiting = false;

        for edge in self.plan.incoming(&node.id) {
            if edge.source_handle == SourceHandle::Body {
                match self.loops.get(&edge.source) {
                    Some(frame) if frame.generation == generation => live.push((edge.source.clone(), frame.body_input.clone())),
                    _ => waiting = true,
                }
                continue;
            }

            let source_key = NodeRunKey::new(edge.source.clone(), self.generation_of(&edge.source, generation));
            match self.node_runs.get(&source_key) {
                Some(run) if run.status == NodeRunStatus::Succeeded => {
                    let taken = match edge.source_handle {
                        SourceHandle::True | SourceHandle::False => self.branches.get(&source_key) == Some(&edge.source_handle),
                        _ => true,
                    };
                    if taken {
                        live.push((edge.source.clone(), run.output.clone().unwrap_or(Value::Null)));
                    } else {
                        dead = true;
                    }
                }
                Some(run) if run.status.is_terminal() => dead = true,
                _ => waiting = true,
            }
        }

        if matches!(node.kind, NodeKind::Merge(_)) {
            // barrier: every converging branch must be terminal first
            return match (waiting, live.is_empty()) {
                (true, _) => Readiness::Wait,
                (false, true) => Readiness::Skip,
                (false, false) => Readiness::Ready(live),
            };
        }

        if dead {
            Readiness::Skip
        } else if waiting {
            Readiness::Wait
        } else {
            Readiness::Ready(live)
        }
    }

    /// Close finished loop iterations and open the next ones.
    fn close_iterations(&mut self) -> bool {
        let mut progressed = false;
        let active: Vec<(NodeId, u32)> = self.loops.iter().map(|(id, frame)| (id.clone(), frame.generation)).collect();

        for (loop_id, generation) in active {
            let body = self.plan.body_of(&loop_id).to_vec();
            let done = body.iter().all(|id| self.node_runs.get(&NodeRunKey::new(id.clone(), generation)).is_some_and(|r| r.status.is_terminal()));
            if !done {
                continue;
            }

            let sinks: Vec<NodeId> = self.plan.body_sinks(&loop_id).into_iter().cloned().collect();
            let output = self.collect_outputs(&sinks, generation);
            debug!(run_id = %self.id, node_id = %loop_id, generation, "loop iteration finished");

            let Some(frame) = self.loops.get_mut(&loop_id) else {
                continue;
            };
            frame.cursor.record(output);
            let next_generation = frame.cursor.index();
            match frame.cursor.next_iteration() {
                Ok(Some(body_input)) => {
                    frame.generation = next_generation;
                    frame.body_input = body_input;
                    *self.iterations.entry(loop_id.clone()).or_default() += 1;
                }
                Ok(None) => {
                    let output = frame.cursor.output();
                    self.loops.remove(&loop_id);
                    self.succeed(&NodeRunKey::new(loop_id.clone(), 0), output);
                }
                Err(e) => {
                    self.loops.remove(&loop_id);
                    self.fail_node(&NodeRunKey::new(loop_id.clone(), 0), Outcome::Failed, e.to_string(), false);
                }
            }
            progressed = true;
        }
        progressed
    }

    /// Output of a set of sink nodes: the value itself for a single sink,
    /// an object keyed by node id otherwise. Sinks that did not succeed are left out.
    fn collect_outputs(
        &self,
        sinks: &[NodeId],
        generation: u32,
    ) -> Value {
        let outputs: Vec<(NodeId, Value)> = sinks
            .iter()
            .filter_map(|id| {
                let run = self.node_runs.get(&NodeRunKey::new(id.clone(), generation))?;
                (run.status == NodeRunStatus::Succeeded).then(|| (id.clone(), run.output.clone().unwrap_or(Value::Null)))
            })
            .collect();

        if sinks.len() == 1 {
            return outputs.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);
        }
        Value::Object(outputs.into_iter().collect())
    }

    fn occupies_slot(
        &self,
        run: &NodeRun,
    ) -> bool {
        matches!(run.status, NodeRunStatus::Dispatched | NodeRunStatus::Running) && self.plan.node(&run.node_id).is_some_and(|n| n.kind.occupies_slot())
    }

    fn start_pending(&mut self) -> bool {
        let mut pending: Vec<(usize, u32, NodeRunKey)> = self
            .node_runs
            .values()
            .filter(|r| r.status == NodeRunStatus::Pending && !self.backoff.contains(&r.key()))
            .filter_map(|r| self.plan.node(&r.node_id).map(|n| (n.index, r.generation, r.key())))
            .collect();
        if pending.is_empty() {
            return false;
        }
        pending.sort();

        let mut in_flight = self.node_runs.values().filter(|r| self.occupies_slot(r)).count();

        if self.plan.mode() == ExecutionMode::Sequential {
            if in_flight > 0 || !self.backoff.is_empty() {
                return false;
            }
            let (_, _, key) = pending.remove(0);
            self.start_node(&key);
            return true;
        }

        let mut progressed = false;
        for (_, _, key) in pending {
            let Some(node) = self.node(&key.node_id) else {
                continue;
            };
            if node.kind.occupies_slot() {
                if in_flight >= self.ceiling {
                    continue;
                }
                in_flight += 1;
            }
            self.start_node(&key);
            progressed = true;
        }
        progressed
    }

    fn start_node(
        &mut self,
        key: &NodeRunKey,
    ) {
        let Some(node) = self.node(&key.node_id) else {
            return;
        };
        let Some(run) = self.node_runs.get(key) else {
            return;
        };
        let input = run.input.clone();
        let attempt = run.attempt;

        match &node.kind {
            NodeKind::Agent(config) => {
                let payload = if config.inputs.is_null() {
                    Ok(input)
                } else {
                    resolve_json_value(
                        &RunScope {
                            state: self,
                            generation: key.generation,
                        },
                        &config.inputs,
                    )
                };
                let payload = match payload {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.transition(key, NodeRunStatus::Running);
                        self.fail_node(key, Outcome::Failed, e.to_string(), false);
                        return;
                    }
                };
                if let Some(run) = self.node_runs.get_mut(key) {
                    run.input = payload.clone();
                }
                self.transition(key, NodeRunStatus::Dispatched);
                self.effects.push(Effect::DispatchAgent {
                    key: key.clone(),
                    attempt,
                    agent_id: config.agent_id.clone(),
                    input: payload,
                    timeout: node.timeout.unwrap_or(self.default_timeout),
                });
            }
            NodeKind::Delay(config) => {
                self.transition(key, NodeRunStatus::Running);
                self.effects.push(Effect::StartDelay {
                    key: key.clone(),
                    attempt,
                    delay: config.duration(),
                });
            }
            NodeKind::Trigger => {
                self.transition(key, NodeRunStatus::Running);
                let output = self.input.clone();
                self.succeed(key, output);
            }
            NodeKind::Condition(config) => {
                self.transition(key, NodeRunStatus::Running);
                let result = config.predicate.evaluate_with(|path| self.resolve_field(&input, path, key.generation));
                debug!(run_id = %self.id, node_id = %key.node_id, generation = key.generation, result, "condition evaluated");
                self.branches.insert(key.clone(), SourceHandle::branch(result));
                self.succeed(key, input);
            }
            NodeKind::Filter(config) => {
                self.transition(key, NodeRunStatus::Running);
                match apply_filter(config, &input) {
                    Ok(output) => self.succeed(key, output),
                    Err(e) => self.fail_node(key, Outcome::Failed, e.to_string(), false),
                }
            }
            NodeKind::Merge(config) => {
                self.transition(key, NodeRunStatus::Running);
                let output = self.merge_branches(&node, config.strategy, &config.inputs, key.generation);
                self.succeed(key, output);
            }
            NodeKind::Loop(config) => {
                self.transition(key, NodeRunStatus::Running);
                let mut cursor = match LoopCursor::new(&config.bound, config.max_iterations, input) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        self.fail_node(key, Outcome::Failed, e.to_string(), false);
                        return;
                    }
                };
                let generation = cursor.index();
                match cursor.next_iteration() {
                    Ok(Some(body_input)) => {
                        self.iterations.insert(node.id.clone(), 1);
                        self.loops.insert(node.id.clone(), LoopFrame {
                            cursor,
                            generation,
                            body_input,
                        });
                    }
                    Ok(None) => {
                        self.iterations.insert(node.id.clone(), 0);
                        self.succeed(key, cursor.output());
                    }
                    Err(e) => self.fail_node(key, Outcome::Failed, e.to_string(), false),
                }
            }
        }
    }

    fn merge_branches(
        &self,
        node: &Node,
        strategy: MergeStrategy,
        inputs: &[NodeId],
        generation: u32,
    ) -> Value {
        let Readiness::Ready(mut live) = self.readiness(node, generation) else {
            return Value::Null;
        };

        match strategy {
            MergeStrategy::LastWins => {
                live.sort_by_key(|(id, _)| self.completed.get(&NodeRunKey::new(id.clone(), self.generation_of(id, generation))).copied().unwrap_or(0));
            }
            _ => live.sort_by_key(|(id, _)| inputs.iter().position(|i| i == id).unwrap_or(usize::MAX)),
        }
        merge(strategy, &live)
    }

    /// Field lookup for condition nodes: the node input, then `node_id.path`
    /// against a visible node output, then the run input.
    fn resolve_field(
        &self,
        input: &Value,
        path: &str,
        generation: u32,
    ) -> Option<Value> {
        if let Some(value) = lookup(input, path) {
            return Some(value.clone());
        }
        if let Some((head, rest)) = path.split_once('.') {
            if let Some(value) = self.visible_output(head, generation).and_then(|out| lookup(out, rest)) {
                return Some(value.clone());
            }
        }
        lookup(&self.input, path).cloned()
    }

    fn visible_output(
        &self,
        node_id: &str,
        generation: u32,
    ) -> Option<&Value> {
        let key = NodeRunKey::new(node_id, self.generation_of(node_id, generation));
        self.node_runs.get(&key).filter(|r| r.status == NodeRunStatus::Succeeded).and_then(|r| r.output.as_ref())
    }

    fn check_finished(&mut self) {
        if self.is_terminal() || !self.loops.is_empty() || !self.backoff.is_empty() {
            return;
        }
        if self.node_runs.values().any(|r| !r.status.is_terminal()) {
            return;
        }

        let mut failures: Vec<&NodeRun> = self.node_runs.values().filter(|r| matches!(r.status, NodeRunStatus::Failed | NodeRunStatus::TimedOut)).collect();
        failures.sort_by_key(|r| r.key());
        let error = failures
            .iter()
            .map(|r| format!("{}: {}", r.key(), r.error.clone().unwrap_or_else(|| r.status.to_string())))
            .collect::<Vec<_>>()
            .join("; ");

        let sinks: Vec<NodeId> = self.plan.sinks().into_iter().cloned().collect();
        self.output = Some(self.collect_outputs(&sinks, 0));

        if failures.is_empty() {
            self.finish(RunStatus::Succeeded);
        } else {
            self.error = Some(error);
            self.finish(RunStatus::Failed);
        }
    }
}

/// Template scope of one node run: definition env plus the outputs it can see.
struct RunScope<'a> {
    state: &'a RunState,
    generation: u32,
}

impl TemplateScope for RunScope<'_> {
    fn env(
        &self,
        name: &str,
    ) -> Option<String> {
        self.state.plan.env().get(name).cloned()
    }

    fn output(
        &self,
        node_id: &str,
    ) -> Option<&Value> {
        self.state.visible_output(node_id, self.generation)
    }
}
