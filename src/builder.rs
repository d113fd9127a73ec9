use std::{sync::Arc, time::Duration};

use tokio::runtime::{Builder, Runtime};

use crate::{
    Config, Engine, OrchflowError, Result,
    gateway::{AgentRuntime, AllowAll, HttpAgentRuntime, QuotaGuard},
};

#[derive(Default)]
pub struct EngineBuilder {
    config: Config,
    rt: Option<Arc<Runtime>>,
    agent_runtime: Option<Arc<dyn AgentRuntime>>,
    quota: Option<Arc<dyn QuotaGuard>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn async_worker_thread_number(
        mut self,
        n: u16,
    ) -> Self {
        self.config.async_worker_thread_number = n;
        self
    }

    pub fn concurrency_ceiling(
        mut self,
        n: usize,
    ) -> Self {
        self.config.coordinator.concurrency_ceiling = n;
        self
    }

    pub fn default_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.config.coordinator.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn watchdog_interval(
        mut self,
        interval: Duration,
    ) -> Self {
        self.config.watchdog.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn run_retention(
        mut self,
        retention: Duration,
    ) -> Self {
        self.config.retention.run_retention_secs = retention.as_secs();
        self
    }

    pub fn callback_url(
        mut self,
        url: impl Into<String>,
    ) -> Self {
        self.config.gateway.callback_url = url.into();
        self
    }

    /// Run the engine on an existing tokio runtime.
    pub fn runtime(
        mut self,
        runtime: Arc<Runtime>,
    ) -> Self {
        self.rt = Some(runtime);
        self
    }

    pub fn agent_runtime(
        mut self,
        agent_runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        self.agent_runtime = Some(agent_runtime);
        self
    }

    pub fn quota_guard(
        mut self,
        quota: Arc<dyn QuotaGuard>,
    ) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn build(self) -> Result<Engine> {
        if self.config.async_worker_thread_number == 0 {
            return Err(OrchflowError::Config("async_worker_thread_number must be at least 1".to_string()));
        }
        if self.config.coordinator.concurrency_ceiling == 0 {
            return Err(OrchflowError::Config("coordinator.concurrency_ceiling must be at least 1".to_string()));
        }

        let agent_runtime: Arc<dyn AgentRuntime> = match (self.agent_runtime, &self.config.gateway.runtime_endpoint) {
            (Some(agent_runtime), _) => agent_runtime,
            (None, Some(endpoint)) => Arc::new(HttpAgentRuntime::new(endpoint.clone())?),
            (None, None) => return Err(OrchflowError::Config("an agent runtime or gateway.runtime_endpoint is required".to_string())),
        };
        let quota = self.quota.unwrap_or_else(|| Arc::new(AllowAll));

        let runtime = match self.rt {
            Some(rt) => rt,
            None => Arc::new(Builder::new_multi_thread().worker_threads(self.config.async_worker_thread_number.into()).enable_all().build()?),
        };

        Ok(Engine::new(self.config, runtime, agent_runtime, quota))
    }
}
