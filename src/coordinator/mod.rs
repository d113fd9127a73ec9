//! Run coordinators.
//!
//! Every active run has exactly one coordinator task. All events for a run
//! (dispatch acknowledgements, callbacks, timer expiries, approval decisions,
//! cancellation) are funneled through its command queue and applied to its
//! [`RunState`] one at a time, so node run transitions are serialized per run.

mod state;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::{
    OrchflowError, Result, ShareLock,
    common::{Queue, Shutdown},
    gateway::{AgentCall, Gateway},
    hitl::ApprovalManager,
    runtime::{Channel, RunId},
    store::Store,
};

pub use state::{Effect, RunInput, RunState};

/// Sending side of a live run.
#[derive(Clone)]
pub struct RunHandle {
    pub workflow_id: String,
    queue: Arc<Queue<RunInput>>,
}

impl RunHandle {
    pub fn new(
        workflow_id: impl Into<String>,
        queue: Arc<Queue<RunInput>>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            queue,
        }
    }
}

/// Table of live runs, keyed by run id.
///
/// Entries are only dropped by `remove`; `capacity` bounds how many runs may be
/// registered at once.
pub struct RunDirectory {
    runs: ShareLock<HashMap<RunId, RunHandle>>,
    capacity: usize,
}

impl RunDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Register a live run, failing once `capacity` runs are registered.
    pub fn register(
        &self,
        run_id: &str,
        handle: RunHandle,
    ) -> Result<()> {
        let mut runs = self.runs.write().map_err(|e| OrchflowError::Run(e.to_string()))?;
        if !runs.contains_key(run_id) && runs.len() >= self.capacity {
            return Err(OrchflowError::Run(format!("active run limit {} reached", self.capacity)));
        }
        runs.insert(run_id.to_string(), handle);
        Ok(())
    }

    pub fn remove(
        &self,
        run_id: &str,
    ) {
        if let Ok(mut runs) = self.runs.write() {
            runs.remove(run_id);
        }
    }

    pub fn contains(
        &self,
        run_id: &str,
    ) -> bool {
        self.runs.read().is_ok_and(|runs| runs.contains_key(run_id))
    }

    /// Enqueue an input for a live run.
    ///
    /// Fails with [`OrchflowError::Run`] if the run is not registered and with
    /// [`OrchflowError::Queue`] if its queue is full.
    pub fn deliver(
        &self,
        run_id: &str,
        input: RunInput,
    ) -> Result<()> {
        let handle = self
            .runs
            .read()
            .map_err(|e| OrchflowError::Run(e.to_string()))?
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchflowError::Run(format!("run {} is not active", run_id)))?;
        handle.queue.send(input)
    }

    /// Like `deliver`, logging instead of failing. Returns false if the input was dropped.
    pub fn submit(
        &self,
        run_id: &str,
        input: RunInput,
    ) -> bool {
        match self.deliver(run_id, input) {
            Ok(()) => true,
            Err(e @ OrchflowError::Queue(_)) => {
                warn!(run_id, error = %e, "run queue rejected input");
                false
            }
            Err(e) => {
                debug!(run_id, error = %e, "input for inactive run dropped");
                false
            }
        }
    }

    /// Ids of the live runs of a workflow.
    pub fn runs_of(
        &self,
        workflow_id: &str,
    ) -> Vec<RunId> {
        match self.runs.read() {
            Ok(runs) => runs.iter().filter(|(_, h)| h.workflow_id == workflow_id).map(|(id, _)| id.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn active(&self) -> Vec<RunId> {
        match self.runs.read() {
            Ok(runs) => runs.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Shared services the coordinators execute their effects against.
#[derive(Clone)]
pub(crate) struct Services {
    pub runs: Arc<RunDirectory>,
    pub gateway: Arc<Gateway>,
    pub approvals: Arc<ApprovalManager>,
    pub store: Arc<Store>,
    pub channel: Arc<Channel>,
    pub handle: Handle,
    pub shutdown: Arc<Shutdown>,
}

pub(crate) struct Coordinator {
    state: RunState,
    queue: Arc<Queue<RunInput>>,
    services: Services,
}

impl Coordinator {
    pub fn new(
        state: RunState,
        queue: Arc<Queue<RunInput>>,
        services: Services,
    ) -> Self {
        Self {
            state,
            queue,
            services,
        }
    }

    /// Spawn the coordinator loop. The run must already be registered in the directory.
    pub fn start(self) {
        let Coordinator {
            mut state,
            queue,
            services,
        } = self;
        let handle = services.handle.clone();

        handle.spawn(async move {
            let effects = state.start();
            let mut finished = services.execute(&state, effects);
            let shutdown = services.shutdown.clone();

            while !finished {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    input = queue.next_async() => {
                        let Some(input) = input else {
                            break;
                        };
                        let effects = state.apply(input);
                        finished = services.execute(&state, effects);
                    }
                }
            }

            services.runs.remove(state.id());
            debug!(run_id = %state.id(), status = %state.status(), "coordinator stopped");
        });
    }
}

impl Services {
    /// Execute a batch of effects and persist the run. Returns true once the run is finished.
    fn execute(
        &self,
        state: &RunState,
        effects: Vec<Effect>,
    ) -> bool {
        let run_id = state.id().to_string();
        let mut finished = false;

        for effect in effects {
            match effect {
                Effect::Emit(message) => self.channel.publish(&message),
                Effect::DispatchAgent {
                    key,
                    attempt,
                    agent_id,
                    input,
                    timeout,
                } => {
                    let gateway = self.gateway.clone();
                    let runs = self.runs.clone();
                    let call = AgentCall {
                        workflow_run_id: run_id.clone(),
                        key: key.clone(),
                        attempt,
                        agent_id,
                        input,
                        timeout,
                    };
                    let run_id = run_id.clone();
                    self.handle.spawn(async move {
                        let input = match gateway.dispatch(call).await {
                            Ok(agent_run_id) => RunInput::DispatchAccepted {
                                key,
                                attempt,
                                agent_run_id,
                            },
                            Err(e) => RunInput::DispatchFailed {
                                key,
                                attempt,
                                error: e.to_string(),
                            },
                        };
                        runs.submit(&run_id, input);
                    });
                }
                Effect::StartDelay {
                    key,
                    attempt,
                    delay,
                } => {
                    let runs = self.runs.clone();
                    let run_id = run_id.clone();
                    self.handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        runs.submit(&run_id, RunInput::DelayElapsed {
                            key,
                            attempt,
                        });
                    });
                }
                Effect::ScheduleRetry {
                    key,
                    attempt,
                    delay,
                } => {
                    let runs = self.runs.clone();
                    let run_id = run_id.clone();
                    self.handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        runs.submit(&run_id, RunInput::RetryDue {
                            key,
                            attempt,
                        });
                    });
                }
                Effect::RequestApproval {
                    approval_id,
                    key,
                    attempt,
                    output,
                } => {
                    if let Err(e) = self.approvals.open(&approval_id, &run_id, &key, attempt, output) {
                        error!(%run_id, %approval_id, error = %e, "failed to open approval request");
                    }
                }
                Effect::RecordAutoApproval {
                    key,
                    attempt,
                    output,
                } => {
                    if let Err(e) = self.approvals.record_auto(&run_id, &key, attempt, output) {
                        warn!(%run_id, error = %e, "failed to record automatic approval");
                    }
                }
                Effect::AbortAgents => {
                    let gateway = self.gateway.clone();
                    let run_id = run_id.clone();
                    self.handle.spawn(async move {
                        gateway.cancel_run(&run_id).await;
                    });
                }
                Effect::WithdrawApprovals => {
                    if let Err(e) = self.approvals.withdraw(&run_id) {
                        warn!(%run_id, error = %e, "failed to withdraw approvals");
                    }
                }
                Effect::Finished(_) => finished = true,
            }
        }

        if let Err(e) = self.store.save_run(&state.snapshot()) {
            error!(%run_id, error = %e, "failed to persist run");
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_submit() {
        let runs = RunDirectory::new(8);
        let queue = Queue::new(1);
        runs.register("r1", RunHandle::new("wf", queue.clone())).unwrap();

        assert!(runs.submit("r1", RunInput::Cancel));
        // full queue
        assert!(!runs.submit("r1", RunInput::Cancel));
        assert!(matches!(runs.deliver("r1", RunInput::Cancel), Err(OrchflowError::Queue(_))));
        assert!(!runs.submit("r2", RunInput::Cancel));
        assert!(matches!(runs.deliver("r2", RunInput::Cancel), Err(OrchflowError::Run(_))));
        assert_eq!(queue.try_next(), Some(RunInput::Cancel));

        runs.remove("r1");
        assert!(!runs.contains("r1"));
    }

    #[test]
    fn test_directory_capacity() {
        let runs = RunDirectory::new(1);
        runs.register("r1", RunHandle::new("wf", Queue::new(1))).unwrap();
        assert!(matches!(runs.register("r2", RunHandle::new("wf", Queue::new(1))), Err(OrchflowError::Run(_))));
        assert_eq!(runs.active(), vec!["r1".to_string()]);

        // a live run is never evicted to make room, only removed
        runs.remove("r1");
        runs.register("r2", RunHandle::new("wf", Queue::new(1))).unwrap();
        assert!(runs.contains("r2"));
        assert!(!runs.contains("r1"));
    }
}
