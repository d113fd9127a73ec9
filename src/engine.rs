//! Orchestration engine - the embedding entry point of Orchflow.
//!
//! The engine owns the tokio runtime and wires the collaborators together:
//! - the graph compiler and the deployment registry
//! - one coordinator task per active run
//! - the agent invocation gateway and the callback ingress
//! - the approval gate manager
//! - the event channel and its persisting monitor
//! - the watchdog for agent deadlines, retention and schedules

mod inner;
mod monitor;
mod schedule;
mod watchdog;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::info;

use crate::{
    Config, OrchflowError, RejectReason, Result,
    gateway::{AgentRun, AgentRuntime, QuotaGuard},
    hitl::{ApprovalRequest, Decision},
    ingress::{Ack, CallbackPayload},
    model::WorkflowModel,
    runtime::{Channel, RunId, WorkflowRun},
    store::data::EventRecord,
    utils,
    workflow::ExecutionPlan,
};

use inner::Core;
use monitor::Monitor;
use watchdog::Watchdog;

pub use schedule::Schedule;

/// The orchestration engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = EngineBuilder::new().agent_runtime(runtime).build()?;
/// engine.launch();
///
/// engine.deploy(&workflow_model)?;
/// let run_id = engine.start_run(&workflow_model.id, json!({ "score": 0.9 }))?;
/// let run = engine.status(&run_id)?;
///
/// engine.shutdown();
/// ```
pub struct Engine {
    /// Shared state for the background tasks.
    core: Arc<Core>,
    /// Background monitor for event persistence.
    monitor: Monitor,
    /// Background scan for deadlines, retention and schedules.
    watchdog: Watchdog,

    /// Tokio runtime for async task execution.
    runtime: Arc<Runtime>,
}

impl Engine {
    pub(crate) fn new(
        config: Config,
        runtime: Arc<Runtime>,
        agent_runtime: Arc<dyn AgentRuntime>,
        quota: Arc<dyn QuotaGuard>,
    ) -> Self {
        let core = Arc::new(Core::new(config, runtime.handle().clone(), agent_runtime, quota));
        let monitor = Monitor::new(core.store.clone(), core.channel.clone(), runtime.handle().clone(), core.shutdown.clone());
        let watchdog = Watchdog::new(core.clone());

        Self {
            core,
            monitor,
            watchdog,
            runtime,
        }
    }

    /// Starts the background tasks. Calling it twice is a no-op.
    pub fn launch(&self) {
        if self.core.running.swap(true, Ordering::Relaxed) {
            return;
        }

        // subscribe before any run can publish
        self.monitor.monitor();
        self.core.channel.listen();
        self.watchdog.watch();
        info!(worker_threads = self.core.config.async_worker_thread_number, "engine launched");
    }

    /// Stops every coordinator and background task. Live runs stay in their last persisted state.
    pub fn shutdown(&self) {
        if !self.core.running.swap(false, Ordering::Relaxed) {
            return;
        }

        self.core.shutdown.shutdown();
        self.core.channel.shutdown();
        info!(active_runs = self.core.runs.active().len(), "engine shut down");
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Compile a definition without deploying it.
    pub fn validate(
        &self,
        workflow: &WorkflowModel,
    ) -> Result<ExecutionPlan> {
        self.core.validate(workflow)
    }

    /// Compile and store a definition. Redeploying replaces the plan for new runs.
    pub fn deploy(
        &self,
        workflow: &WorkflowModel,
    ) -> Result<bool> {
        self.core.deploy(workflow)
    }

    /// Start a run of a deployed workflow and return its id.
    pub fn start_run(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> Result<RunId> {
        self.core.start_run(workflow_id, input)
    }

    pub fn cancel(
        &self,
        run_id: &str,
    ) -> Result<()> {
        self.core.cancel(run_id)
    }

    /// Latest persisted state of a run, including archived runs.
    pub fn status(
        &self,
        run_id: &str,
    ) -> Result<WorkflowRun> {
        self.core.store.find_run(run_id)
    }

    pub fn runs_of(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowRun>> {
        self.core.store.runs_of(workflow_id)
    }

    /// Persisted event history of a run.
    pub fn events(
        &self,
        run_id: &str,
    ) -> Result<Vec<EventRecord>> {
        self.core.store.events_of(run_id)
    }

    /// Agent runs created for a workflow run, oldest first.
    pub fn agent_runs(
        &self,
        run_id: &str,
    ) -> Vec<AgentRun> {
        self.core.gateway.runs_of(run_id)
    }

    /// Entry point for completion callbacks from the agent runtime.
    pub fn receive_callback(
        &self,
        payload: CallbackPayload,
    ) -> std::result::Result<Ack, RejectReason> {
        self.core.ingress.receive(payload)
    }

    pub fn decide(
        &self,
        approval_id: &str,
        decision: Decision,
        comment: &str,
        decided_by: &str,
    ) -> Result<ApprovalRequest> {
        self.core.approvals.decide(approval_id, decision, comment, decided_by)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.core.approvals.pending()
    }

    pub fn approval(
        &self,
        approval_id: &str,
    ) -> Option<ApprovalRequest> {
        self.core.approvals.get(approval_id)
    }

    /// Start a run of `workflow_id` every `every`, first one interval from now.
    pub fn schedule(
        &self,
        workflow_id: &str,
        every: Duration,
        input: Value,
    ) -> Result<Schedule> {
        if every.is_zero() {
            return Err(OrchflowError::Validation("schedule interval must be positive".to_string()));
        }
        self.core.plan(workflow_id)?;
        let schedule = self.core.schedules.add(workflow_id, every, input, utils::time::time_millis());
        info!(schedule_id = %schedule.id, workflow_id, every_ms = every.as_millis() as u64, "schedule added");
        Ok(schedule)
    }

    pub fn unschedule(
        &self,
        schedule_id: &str,
    ) -> bool {
        self.core.schedules.remove(schedule_id)
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.core.schedules.list()
    }

    /// Returns a reference to the event channel.
    pub fn channel(&self) -> Arc<Channel> {
        self.core.channel.clone()
    }

    /// Handle of the engine's tokio runtime.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }
}
