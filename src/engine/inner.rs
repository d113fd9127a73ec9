use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    Config, OrchflowError, Result,
    common::{MemCache, Queue, Shutdown},
    coordinator::{Coordinator, RunDirectory, RunHandle, RunInput, RunState, Services},
    gateway::{AgentRuntime, Gateway, QuotaGuard},
    hitl::ApprovalManager,
    ingress::CallbackIngress,
    model::WorkflowModel,
    runtime::{Channel, RunId},
    store::{MemStore, Store},
    utils,
    workflow::{Compiler, ExecutionPlan},
};

use super::schedule::Schedules;

/// Compiled plans kept hot per deployed workflow.
const PLAN_CACHE_SIZE: usize = 256;

/// State shared by the engine handle and its background tasks.
pub(crate) struct Core {
    pub config: Config,
    pub compiler: Compiler,
    pub channel: Arc<Channel>,
    pub store: Arc<Store>,
    pub plans: MemCache<String, Arc<ExecutionPlan>>,
    pub runs: Arc<RunDirectory>,
    pub gateway: Arc<Gateway>,
    pub ingress: CallbackIngress,
    pub approvals: Arc<ApprovalManager>,
    pub schedules: Schedules,

    pub running: AtomicBool,
    pub handle: Handle,
    pub shutdown: Arc<Shutdown>,
}

impl Core {
    pub fn new(
        config: Config,
        handle: Handle,
        agent_runtime: Arc<dyn AgentRuntime>,
        quota: Arc<dyn QuotaGuard>,
    ) -> Self {
        let store = Arc::new(Store::new(&MemStore::new()));
        let channel = Arc::new(Channel::new(handle.clone()));
        let runs = Arc::new(RunDirectory::new(config.coordinator.max_active_runs));
        let gateway = Arc::new(Gateway::new(agent_runtime, quota, &config.gateway));
        let ingress = CallbackIngress::new(gateway.clone(), runs.clone());
        let approvals = Arc::new(ApprovalManager::new(runs.clone(), store.clone()));

        Self {
            compiler: Compiler::new(config.coordinator.max_loop_iterations),
            config,
            channel,
            store,
            plans: MemCache::new(PLAN_CACHE_SIZE),
            runs,
            gateway,
            ingress,
            approvals,
            schedules: Schedules::new(),
            running: AtomicBool::new(false),
            handle,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn validate(
        &self,
        model: &WorkflowModel,
    ) -> Result<ExecutionPlan> {
        Ok(self.compiler.compile(model)?)
    }

    pub fn deploy(
        &self,
        model: &WorkflowModel,
    ) -> Result<bool> {
        let plan = self.validate(model)?;
        let stored = self.store.deploy(model)?;
        self.plans.set(model.id.clone(), Arc::new(plan));
        info!(workflow_id = %model.id, "workflow deployed");
        Ok(stored)
    }

    /// The plan of a deployed workflow, recompiled from the store on a cache miss.
    pub fn plan(
        &self,
        workflow_id: &str,
    ) -> Result<Arc<ExecutionPlan>> {
        if let Some(plan) = self.plans.get(&workflow_id.to_string()) {
            return Ok(plan);
        }
        let model = self.store.workflow(workflow_id)?;
        let plan = Arc::new(self.validate(&model)?);
        self.plans.set(workflow_id.to_string(), plan.clone());
        Ok(plan)
    }

    pub fn start_run(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> Result<RunId> {
        if !self.is_running() {
            return Err(OrchflowError::Engine("engine is not running".to_string()));
        }
        let plan = self.plan(workflow_id)?;

        let run_id = utils::longid();
        let coordinator = &self.config.coordinator;
        let queue = Queue::new(coordinator.command_queue_size);
        // claims a slot under the active run limit
        self.runs.register(&run_id, RunHandle::new(workflow_id, queue.clone()))?;

        let state = RunState::new(run_id.clone(), plan, input, coordinator.concurrency_ceiling, Duration::from_millis(coordinator.default_timeout_ms));
        if let Err(e) = self.store.save_run(&state.snapshot()) {
            self.runs.remove(&run_id);
            return Err(e);
        }
        Coordinator::new(state, queue, self.services()).start();

        info!(%run_id, workflow_id, "run started");
        Ok(run_id)
    }

    /// Cancel a run. Cancelling a run that already finished is a no-op.
    pub fn cancel(
        &self,
        run_id: &str,
    ) -> Result<()> {
        if self.runs.contains(run_id) {
            if self.runs.submit(run_id, RunInput::Cancel) {
                return Ok(());
            }
            return Err(OrchflowError::Queue(format!("run {} did not accept the cancellation", run_id)));
        }

        let run = self.store.find_run(run_id)?;
        if run.status.is_terminal() {
            debug!(run_id, status = %run.status, "cancel of a finished run ignored");
            return Ok(());
        }
        Err(OrchflowError::Run(format!("run {} has no live coordinator", run_id)))
    }

    /// One watchdog pass: agent deadlines, retention and schedules.
    pub fn tick(
        &self,
        now: i64,
    ) {
        // a timeout that cannot be queued keeps its agent run pending for the next pass
        self.gateway.expire(now, |agent_run| {
            let input = RunInput::AgentTimedOut {
                key: agent_run.key(),
                attempt: agent_run.attempt,
            };
            match self.runs.deliver(&agent_run.workflow_run_id, input) {
                Ok(()) => true,
                Err(e @ OrchflowError::Queue(_)) => {
                    warn!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, error = %e, "run queue full, timeout deferred");
                    false
                }
                Err(e) => {
                    debug!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, error = %e, "timeout for inactive run dropped");
                    true
                }
            }
        });

        self.archive_expired(now);

        for schedule in self.schedules.due(now) {
            match self.start_run(&schedule.workflow_id, schedule.input.clone()) {
                Ok(run_id) => debug!(schedule_id = %schedule.id, %run_id, "scheduled run started"),
                Err(e) => warn!(schedule_id = %schedule.id, workflow_id = %schedule.workflow_id, error = %e, "scheduled run failed to start"),
            }
        }
    }

    fn archive_expired(
        &self,
        now: i64,
    ) {
        let runs = match self.store.terminal_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "failed to scan terminal runs");
                return;
            }
        };

        for run in runs {
            // the coordinator may still be flushing its last snapshot
            if self.runs.contains(&run.id) {
                continue;
            }
            let retention = self.plan(&run.workflow_id).ok().and_then(|p| p.retention_secs()).unwrap_or(self.config.retention.run_retention_secs);
            let expires_at = run.terminal_at.unwrap_or(run.updated_at).saturating_add(i64::try_from(retention.saturating_mul(1000)).unwrap_or(i64::MAX));
            if expires_at > now {
                continue;
            }
            match self.store.archive_run(&run.id) {
                Ok(_) => self.gateway.forget(&run.id),
                Err(e) => warn!(run_id = %run.id, error = %e, "failed to archive run"),
            }
        }
    }

    pub fn services(&self) -> Services {
        Services {
            runs: self.runs.clone(),
            gateway: self.gateway.clone(),
            approvals: self.approvals.clone(),
            store: self.store.clone(),
            channel: self.channel.clone(),
            handle: self.handle.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        gateway::{AgentCall, AgentRunState, AllowAll, DispatchRequest},
        runtime::NodeRunKey,
    };

    struct Silent;

    #[async_trait]
    impl AgentRuntime for Silent {
        async fn dispatch(
            &self,
            _: &DispatchRequest,
        ) -> Result<()> {
            Ok(())
        }

        async fn abort(
            &self,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_waits_for_queue_room() {
        let core = Core::new(Config::default(), Handle::current(), Arc::new(Silent), Arc::new(AllowAll));
        let queue = Queue::new(1);
        core.runs.register("wr1", RunHandle::new("wf", queue.clone())).unwrap();
        queue.send(RunInput::Cancel).unwrap();

        let agent_run_id = core
            .gateway
            .dispatch(AgentCall {
                workflow_run_id: "wr1".into(),
                key: NodeRunKey::new("draft", 0),
                attempt: 1,
                agent_id: "writer".into(),
                input: Value::Null,
                timeout: Duration::ZERO,
            })
            .await
            .unwrap();

        core.tick(i64::MAX);
        assert_eq!(core.gateway.get(&agent_run_id).unwrap().state, AgentRunState::Pending);

        assert_eq!(queue.try_next(), Some(RunInput::Cancel));
        core.tick(i64::MAX);
        assert_eq!(core.gateway.get(&agent_run_id).unwrap().state, AgentRunState::TimedOut);
        assert_eq!(
            queue.try_next(),
            Some(RunInput::AgentTimedOut {
                key: NodeRunKey::new("draft", 0),
                attempt: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_start_run_respects_active_limit() {
        let mut config = Config::default();
        config.coordinator.max_active_runs = 1;
        let core = Core::new(config, Handle::current(), Arc::new(Silent), Arc::new(AllowAll));
        core.runs.register("busy", RunHandle::new("wf", Queue::new(1))).unwrap();
        core.running.store(true, Ordering::Relaxed);

        let model: WorkflowModel = serde_json::from_value(serde_json::json!({
            "id": "wf", "name": "one",
            "nodes": [{ "id": "start", "type": "trigger" }],
            "edges": []
        }))
        .unwrap();
        core.deploy(&model).unwrap();

        assert!(matches!(core.start_run("wf", Value::Null), Err(OrchflowError::Run(_))));
        assert_eq!(core.runs.active(), vec!["busy".to_string()]);
    }
}
