use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A running job whose heartbeat is older than this is considered orphaned.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    #[serde(default = "default_max_recoveries")]
    pub max_recoveries: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

fn default_database_path() -> PathBuf {
    crate::db::default_database_path().unwrap_or_else(|| PathBuf::from("caseflow.db"))
}

fn default_artifact_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".caseflow").join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_timeout_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_max_recoveries() -> u32 {
    3
}

/// One entry per analysis stage, run in pipeline order. By default each
/// stage runs `caseflow-<kind>` from `PATH`.
fn default_stages() -> Vec<StageConfig> {
    StageKind::ALL
        .iter()
        .map(|kind| StageConfig {
            kind: *kind,
            command: format!("caseflow-{}", kind.as_str().replace('_', "-")),
            args: vec![],
            timeout_secs: default_stage_timeout_secs(),
        })
        .collect()
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: default_database_path(),
            artifact_root: default_artifact_root(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_secs: default_lease_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            recovery: RecoveryPolicy::default(),
            max_recoveries: default_max_recoveries(),
            retry: RetryConfig::default(),
            stages: default_stages(),
        }
    }
}

/// What the dispatcher does with a running job whose worker disappeared.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Continue from the first stage that has not completed.
    #[default]
    Resume,
    /// Mark the job failed with a "worker lost" reason.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl RetryConfig {
    /// Delay before `attempt + 1`, doubling from `initial_backoff_ms` and
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: StageKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_stage_timeout_secs() -> u64 {
    3_600
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
