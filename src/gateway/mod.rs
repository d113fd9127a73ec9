//! Agent invocation gateway.
//!
//! Every agent dispatch becomes an [`AgentRun`] with a fresh id, a deadline and
//! a one-time callback secret. Only an HMAC-SHA256 tag of the secret is kept, so
//! the secret itself never leaves the dispatch request. The gateway is the only
//! component that talks to the external agent runtime.

mod http;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::{
    OrchflowError, RejectReason, Result, ShareLock,
    config::GatewayConfig,
    runtime::{NodeRunKey, RunId},
    utils,
    workflow::node::NodeId,
};

pub use http::HttpAgentRuntime;

type HmacSha256 = Hmac<Sha256>;

/// Payload handed to the agent runtime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// agent run id, echoed back in the completion callback
    pub run_id: String,
    pub workflow_run_id: RunId,
    pub node_id: NodeId,
    pub generation: u32,
    pub attempt: u32,
    pub agent_id: String,
    pub input: Value,
    pub callback_url: String,
    /// one-time secret the callback must present
    pub secret: String,
    /// deadline in milliseconds since the epoch
    pub deadline: i64,
}

/// External system that executes agents.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Hand a dispatch to the runtime. Completion arrives later through a callback.
    async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<()>;

    /// Best-effort abort of a running agent.
    async fn abort(
        &self,
        agent_run_id: &str,
    ) -> Result<()>;
}

/// Admission check consulted before each dispatch.
pub trait QuotaGuard: Send + Sync {
    fn allow(
        &self,
        workflow_run_id: &str,
        agent_id: &str,
    ) -> bool;
}

/// Quota guard that admits everything.
pub struct AllowAll;

impl QuotaGuard for AllowAll {
    fn allow(
        &self,
        _workflow_run_id: &str,
        _agent_id: &str,
    ) -> bool {
        true
    }
}

/// Dispatch of one node run attempt, as requested by a coordinator.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub workflow_run_id: RunId,
    pub key: NodeRunKey,
    pub attempt: u32,
    pub agent_id: String,
    pub input: Value,
    pub timeout: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentRunState {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// One dispatch to the agent runtime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub id: String,
    pub workflow_run_id: RunId,
    pub node_id: NodeId,
    pub generation: u32,
    pub attempt: u32,
    pub agent_id: String,
    #[serde(skip)]
    secret_tag: Vec<u8>,
    pub deadline: i64,
    pub state: AgentRunState,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl AgentRun {
    pub fn key(&self) -> NodeRunKey {
        NodeRunKey::new(self.node_id.clone(), self.generation)
    }

    fn close(
        &mut self,
        state: AgentRunState,
    ) {
        self.state = state;
        self.completed_at = Some(utils::time::time_millis());
    }
}

/// Result of presenting a valid callback for an agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// first callback; the agent run is now closed with the requested state
    Claimed(AgentRun),
    /// the agent run was already closed by an earlier callback or a cancellation
    Duplicate,
}

pub struct Gateway {
    runtime: Arc<dyn AgentRuntime>,
    quota: Arc<dyn QuotaGuard>,
    agent_runs: ShareLock<HashMap<String, AgentRun>>,
    /// per-engine key for secret tags
    mac_key: Vec<u8>,
    callback_url: String,
    secret_bytes: usize,
}

impl Gateway {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        quota: Arc<dyn QuotaGuard>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            runtime,
            quota,
            agent_runs: Arc::new(RwLock::new(HashMap::new())),
            mac_key: random_bytes(32),
            callback_url: config.callback_url.clone(),
            secret_bytes: config.secret_bytes,
        }
    }

    /// Create an agent run and hand it to the runtime. Returns the agent run id.
    pub async fn dispatch(
        &self,
        call: AgentCall,
    ) -> Result<String> {
        if !self.quota.allow(&call.workflow_run_id, &call.agent_id) {
            warn!(run_id = %call.workflow_run_id, agent_id = %call.agent_id, "dispatch denied by quota");
            return Err(OrchflowError::Dispatch(format!("quota exceeded for agent '{}'", call.agent_id)));
        }

        let secret = URL_SAFE_NO_PAD.encode(random_bytes(self.secret_bytes));
        let now = utils::time::time_millis();
        let deadline = now.saturating_add(i64::try_from(call.timeout.as_millis()).unwrap_or(i64::MAX));
        let agent_run = AgentRun {
            id: utils::longid(),
            workflow_run_id: call.workflow_run_id.clone(),
            node_id: call.key.node_id.clone(),
            generation: call.key.generation,
            attempt: call.attempt,
            agent_id: call.agent_id.clone(),
            secret_tag: self.tag(&secret)?,
            deadline,
            state: AgentRunState::Pending,
            created_at: now,
            completed_at: None,
        };
        let request = DispatchRequest {
            run_id: agent_run.id.clone(),
            workflow_run_id: call.workflow_run_id,
            node_id: call.key.node_id,
            generation: call.key.generation,
            attempt: call.attempt,
            agent_id: call.agent_id,
            input: call.input,
            callback_url: self.callback_url.clone(),
            secret,
            deadline,
        };

        {
            let mut runs = self.write_runs()?;
            // a newer attempt supersedes whatever is still open for the node run
            for stale in runs.values_mut().filter(|r| {
                r.state == AgentRunState::Pending && r.workflow_run_id == agent_run.workflow_run_id && r.node_id == agent_run.node_id && r.generation == agent_run.generation
            }) {
                debug!(agent_run_id = %stale.id, "superseded agent run cancelled");
                stale.close(AgentRunState::Cancelled);
            }
            runs.insert(agent_run.id.clone(), agent_run.clone());
        }

        if let Err(e) = self.runtime.dispatch(&request).await {
            warn!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, error = %e, "agent runtime rejected dispatch");
            if let Some(run) = self.write_runs()?.get_mut(&agent_run.id) {
                run.close(AgentRunState::Failed);
            }
            return Err(OrchflowError::Dispatch(e.to_string()));
        }

        info!(agent_run_id = %agent_run.id, run_id = %agent_run.workflow_run_id, node_id = %agent_run.node_id, attempt = agent_run.attempt, "agent dispatched");
        Ok(agent_run.id)
    }

    /// Verify a callback secret and close the agent run with `state`.
    ///
    /// The check order is fixed: unknown run, then secret, then the run's state.
    /// `deliver` runs under the table lock before the run is closed; if it fails
    /// the run stays pending and the same callback can be posted again.
    pub fn claim(
        &self,
        agent_run_id: &str,
        secret: &str,
        state: AgentRunState,
        deliver: impl FnOnce(&AgentRun) -> std::result::Result<(), RejectReason>,
    ) -> std::result::Result<Claim, RejectReason> {
        let mut runs = self.agent_runs.write().map_err(|_| RejectReason::UnknownRun)?;
        let run = runs.get_mut(agent_run_id).ok_or(RejectReason::UnknownRun)?;
        if !self.verify(&run.secret_tag, secret) {
            return Err(RejectReason::SecretMismatch);
        }

        match run.state {
            AgentRunState::Pending => {
                deliver(&*run)?;
                run.close(state);
                Ok(Claim::Claimed(run.clone()))
            }
            AgentRunState::TimedOut => Err(RejectReason::AlreadyTerminal),
            AgentRunState::Completed | AgentRunState::Failed | AgentRunState::Cancelled => Ok(Claim::Duplicate),
        }
    }

    /// Close every pending agent run whose deadline has passed.
    ///
    /// Runs for which `deliver` returns false stay pending and are picked up
    /// again by the next sweep.
    pub fn expire(
        &self,
        now: i64,
        mut deliver: impl FnMut(&AgentRun) -> bool,
    ) -> Vec<AgentRun> {
        let Ok(mut runs) = self.agent_runs.write() else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        for run in runs.values_mut().filter(|r| r.state == AgentRunState::Pending && r.deadline <= now) {
            if !deliver(&*run) {
                debug!(agent_run_id = %run.id, run_id = %run.workflow_run_id, "timeout not delivered, retrying on next sweep");
                continue;
            }
            run.close(AgentRunState::TimedOut);
            info!(agent_run_id = %run.id, run_id = %run.workflow_run_id, node_id = %run.node_id, "agent run deadline exceeded");
            expired.push(run.clone());
        }
        expired
    }

    /// Cancel the open agent runs of a workflow run and ask the runtime to abort them.
    pub async fn cancel_run(
        &self,
        workflow_run_id: &str,
    ) {
        let cancelled: Vec<String> = match self.agent_runs.write() {
            Ok(mut runs) => runs
                .values_mut()
                .filter(|r| r.workflow_run_id == workflow_run_id && r.state == AgentRunState::Pending)
                .map(|r| {
                    r.close(AgentRunState::Cancelled);
                    r.id.clone()
                })
                .collect(),
            Err(_) => return,
        };

        for id in cancelled {
            if let Err(e) = self.runtime.abort(&id).await {
                warn!(agent_run_id = %id, error = %e, "agent abort failed");
            }
        }
    }

    pub fn get(
        &self,
        agent_run_id: &str,
    ) -> Option<AgentRun> {
        self.agent_runs.read().ok()?.get(agent_run_id).cloned()
    }

    /// Agent runs of a workflow run, oldest first.
    pub fn runs_of(
        &self,
        workflow_run_id: &str,
    ) -> Vec<AgentRun> {
        let Ok(runs) = self.agent_runs.read() else {
            return Vec::new();
        };
        let mut list: Vec<AgentRun> = runs.values().filter(|r| r.workflow_run_id == workflow_run_id).cloned().collect();
        list.sort_by_key(|r| (r.created_at, r.attempt));
        list
    }

    /// Drop closed agent runs of workflow runs that are gone.
    pub fn forget(
        &self,
        workflow_run_id: &str,
    ) {
        if let Ok(mut runs) = self.agent_runs.write() {
            runs.retain(|_, r| r.workflow_run_id != workflow_run_id || r.state == AgentRunState::Pending);
        }
    }

    fn write_runs(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, AgentRun>>> {
        self.agent_runs.write().map_err(|e| OrchflowError::Dispatch(e.to_string()))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.mac_key).map_err(|e| OrchflowError::Engine(e.to_string()))
    }

    fn tag(
        &self,
        secret: &str,
    ) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(secret.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time comparison of a presented secret against a stored tag.
    fn verify(
        &self,
        tag: &[u8],
        secret: &str,
    ) -> bool {
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(secret.as_bytes());
        mac.verify_slice(tag).is_ok()
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|_| rand::random::<u8>()).collect()
}
