//! Completion callback ingress.
//!
//! Callbacks are authenticated against the agent run's secret tag and applied
//! at most once: the first valid callback closes the agent run and is forwarded
//! to the run's coordinator, every later one is acknowledged as a duplicate.
//! A callback that finds the run's queue full is refused with
//! [`RejectReason::QueueFull`] and leaves the agent run open for a retry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    OrchflowError, RejectReason,
    coordinator::{RunDirectory, RunInput},
    gateway::{AgentRun, AgentRunState, Claim, Gateway},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

/// Completion report posted by the agent runtime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallbackPayload {
    /// agent run id
    pub run_id: String,
    pub status: CallbackStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub secret: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// the agent run had already been closed; nothing changed
    pub duplicate: bool,
}

pub struct CallbackIngress {
    gateway: Arc<Gateway>,
    runs: Arc<RunDirectory>,
}

impl CallbackIngress {
    pub fn new(
        gateway: Arc<Gateway>,
        runs: Arc<RunDirectory>,
    ) -> Self {
        Self {
            gateway,
            runs,
        }
    }

    pub fn receive(
        &self,
        payload: CallbackPayload,
    ) -> std::result::Result<Ack, RejectReason> {
        if payload.run_id.is_empty() || payload.secret.is_empty() {
            return Err(RejectReason::MalformedPayload);
        }
        let state = match payload.status {
            CallbackStatus::Completed => AgentRunState::Completed,
            CallbackStatus::Failed if payload.error.as_deref().is_some_and(|e| !e.is_empty()) => AgentRunState::Failed,
            CallbackStatus::Failed => return Err(RejectReason::MalformedPayload),
        };

        let CallbackPayload {
            run_id,
            output,
            error,
            secret,
            ..
        } = payload;
        // the agent run is closed only once its input sits in the run's queue
        let deliver = |agent_run: &AgentRun| {
            let input = match state {
                AgentRunState::Failed => RunInput::AgentFailed {
                    key: agent_run.key(),
                    attempt: agent_run.attempt,
                    error: error.unwrap_or_default(),
                },
                _ => RunInput::AgentCompleted {
                    key: agent_run.key(),
                    attempt: agent_run.attempt,
                    output,
                },
            };
            match self.runs.deliver(&agent_run.workflow_run_id, input) {
                Ok(()) => Ok(()),
                Err(OrchflowError::Queue(e)) => {
                    warn!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, error = %e, "run queue full, callback not accepted");
                    Err(RejectReason::QueueFull)
                }
                Err(e) => {
                    debug!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, error = %e, "callback for a run that is no longer active");
                    Ok(())
                }
            }
        };

        let agent_run = match self.gateway.claim(&run_id, &secret, state, deliver) {
            Ok(Claim::Claimed(agent_run)) => agent_run,
            Ok(Claim::Duplicate) => {
                debug!(agent_run_id = %run_id, "duplicate callback acknowledged");
                return Ok(Ack {
                    duplicate: true,
                });
            }
            Err(reason) => {
                warn!(agent_run_id = %run_id, reason = reason.as_ref(), "callback rejected");
                return Err(reason);
            }
        };

        info!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, node_id = %agent_run.node_id, state = %state, "callback accepted");

        Ok(Ack {
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        Result,
        common::Queue,
        config::GatewayConfig,
        coordinator::RunHandle,
        gateway::{AgentCall, AgentRuntime, AllowAll, DispatchRequest},
        runtime::NodeRunKey,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DispatchRequest>>);

    #[async_trait]
    impl AgentRuntime for Recorder {
        async fn dispatch(
            &self,
            request: &DispatchRequest,
        ) -> Result<()> {
            self.0.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn abort(
            &self,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        ingress: CallbackIngress,
        queue: Arc<Queue<RunInput>>,
        agent_run_id: String,
        secret: String,
    }

    async fn fixture() -> Fixture {
        fixture_with_queue(8).await
    }

    async fn fixture_with_queue(capacity: usize) -> Fixture {
        let recorder = Arc::new(Recorder::default());
        let gateway = Arc::new(Gateway::new(recorder.clone(), Arc::new(AllowAll), &GatewayConfig::default()));
        let runs = Arc::new(RunDirectory::new(8));
        let queue = Queue::new(capacity);
        runs.register("wr1", RunHandle::new("wf", queue.clone())).unwrap();

        let agent_run_id = gateway
            .dispatch(AgentCall {
                workflow_run_id: "wr1".into(),
                key: NodeRunKey::new("draft", 0),
                attempt: 1,
                agent_id: "writer".into(),
                input: json!({}),
                timeout: std::time::Duration::from_secs(60),
            })
            .await
            .unwrap();
        let secret = recorder.0.lock().unwrap()[0].secret.clone();

        Fixture {
            ingress: CallbackIngress::new(gateway, runs),
            queue,
            agent_run_id,
            secret,
        }
    }

    fn completed(
        run_id: &str,
        secret: &str,
    ) -> CallbackPayload {
        CallbackPayload {
            run_id: run_id.to_string(),
            status: CallbackStatus::Completed,
            output: json!({ "text": "done" }),
            error: None,
            secret: secret.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_callback_applies_once() {
        let f = fixture().await;
        let ack = f.ingress.receive(completed(&f.agent_run_id, &f.secret)).unwrap();
        assert!(!ack.duplicate);
        assert!(matches!(f.queue.try_next(), Some(RunInput::AgentCompleted { attempt: 1, .. })));

        let ack = f.ingress.receive(completed(&f.agent_run_id, &f.secret)).unwrap();
        assert!(ack.duplicate);
        assert_eq!(f.queue.try_next(), None);
    }

    #[tokio::test]
    async fn test_full_queue_refuses_callback() {
        let f = fixture_with_queue(1).await;
        f.queue.send(RunInput::Cancel).unwrap();

        assert_eq!(f.ingress.receive(completed(&f.agent_run_id, &f.secret)), Err(RejectReason::QueueFull));
        assert_eq!(f.ingress.gateway.get(&f.agent_run_id).unwrap().state, AgentRunState::Pending);

        // once the coordinator drains, the same callback goes through as the first one
        assert_eq!(f.queue.try_next(), Some(RunInput::Cancel));
        let ack = f.ingress.receive(completed(&f.agent_run_id, &f.secret)).unwrap();
        assert!(!ack.duplicate);
        assert!(matches!(f.queue.try_next(), Some(RunInput::AgentCompleted { attempt: 1, .. })));
        assert_eq!(f.ingress.gateway.get(&f.agent_run_id).unwrap().state, AgentRunState::Completed);
    }

    #[tokio::test]
    async fn test_rejections() {
        let f = fixture().await;
        assert_eq!(f.ingress.receive(completed("unknown", &f.secret)), Err(RejectReason::UnknownRun));
        assert_eq!(f.ingress.receive(completed(&f.agent_run_id, "forged")), Err(RejectReason::SecretMismatch));
        assert_eq!(f.ingress.receive(completed(&f.agent_run_id, "")), Err(RejectReason::MalformedPayload));

        let failed_without_error = CallbackPayload {
            status: CallbackStatus::Failed,
            ..completed(&f.agent_run_id, &f.secret)
        };
        assert_eq!(f.ingress.receive(failed_without_error), Err(RejectReason::MalformedPayload));
        // none of the rejections consumed the agent run
        assert_eq!(f.queue.try_next(), None);
        assert!(!f.ingress.receive(completed(&f.agent_run_id, &f.secret)).unwrap().duplicate);
    }

    #[tokio::test]
    async fn test_failed_callback() {
        let f = fixture().await;
        let payload = CallbackPayload {
            status: CallbackStatus::Failed,
            error: Some("model overloaded".into()),
            ..completed(&f.agent_run_id, &f.secret)
        };
        f.ingress.receive(payload).unwrap();
        match f.queue.try_next() {
            Some(RunInput::AgentFailed {
                error,
                ..
            }) => assert_eq!(error, "model overloaded"),
            other => panic!("unexpected input {:?}", other),
        }
    }
}
