use std::time::Duration;

use crate::config::schema::RetryConfig;
use crate::config::Config;

/// Execution settings shared by every job a runner executes.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    /// How often a running stage renews its job's lease.
    pub heartbeat_interval: Duration,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.clone(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
