use std::{fs, path::Path};

use serde::Deserialize;

use crate::{OrchflowError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// number of async worker threads, range [1, 32768), defaults to 16
    pub async_worker_thread_number: u16,
    /// run coordinator config
    pub coordinator: CoordinatorConfig,
    /// agent invocation gateway config
    pub gateway: GatewayConfig,
    /// deadline watchdog config
    pub watchdog: WatchdogConfig,
    /// run retention config
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// max simultaneous agent/delay dispatches per run in parallel mode
    pub concurrency_ceiling: usize,
    /// agent deadline in milliseconds when the node declares none
    pub default_timeout_ms: u64,
    /// upper bound for while-loops and count loops
    pub max_loop_iterations: u32,
    /// size of the per-run command queue
    pub command_queue_size: usize,
    /// capacity of the live run table
    pub max_active_runs: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// address the agent runtime posts completion callbacks to
    pub callback_url: String,
    /// http agent runtime endpoint, if the engine should build one
    pub runtime_endpoint: Option<String>,
    /// number of random bytes in a callback secret
    pub secret_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// scan interval in milliseconds
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// seconds a terminal run stays in the active store before archiving
    pub run_retention_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_worker_thread_number: 16,
            coordinator: CoordinatorConfig::default(),
            gateway: GatewayConfig::default(),
            watchdog: WatchdogConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: 8,
            default_timeout_ms: 300_000,
            max_loop_iterations: 100,
            command_queue_size: 1024,
            max_active_runs: 2048,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://127.0.0.1:8080/callbacks".to_string(),
            runtime_endpoint: None,
            secret_bytes: 32,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_retention_secs: 86_400,
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| OrchflowError::Config(format!("failed to load config file {:?}: {}", path.as_ref(), e)))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.async_worker_thread_number == 0 {
            return Err(OrchflowError::Config("async_worker_thread_number must be at least 1".to_string()));
        }
        if self.coordinator.concurrency_ceiling == 0 {
            return Err(OrchflowError::Config("coordinator.concurrency_ceiling must be at least 1".to_string()));
        }
        if self.gateway.secret_bytes < 16 {
            return Err(OrchflowError::Config("gateway.secret_bytes must be at least 16".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::Config;

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
        async_worker_thread_number = 10
        [coordinator]
        concurrency_ceiling = 2
        default_timeout_ms = 5000

        [gateway]
        callback_url = "https://orchflow.example.com/callbacks"
        runtime_endpoint = "http://127.0.0.1:9000"

        [watchdog]
        interval_ms = 250
        "#;
        let config = Config::load_from_str(toml_str).unwrap();
        assert_eq!(config.async_worker_thread_number, 10);
        assert_eq!(config.coordinator.concurrency_ceiling, 2);
        assert_eq!(config.coordinator.default_timeout_ms, 5000);
        assert_eq!(config.coordinator.max_loop_iterations, 100);
        assert_eq!(config.gateway.runtime_endpoint.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.watchdog.interval_ms, 250);
        assert_eq!(config.retention.run_retention_secs, 86_400);
    }

    #[test]
    fn test_config_defaults_from_empty() {
        let config = Config::load_from_str("").unwrap();
        assert_eq!(config.async_worker_thread_number, 16);
        assert_eq!(config.gateway.secret_bytes, 32);
    }

    #[test]
    fn test_config_rejects_zero_ceiling() {
        let err = Config::load_from_str("[coordinator]\nconcurrency_ceiling = 0").unwrap_err();
        assert!(err.to_string().contains("concurrency_ceiling"));
    }
}
