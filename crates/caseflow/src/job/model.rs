//! The persisted job record and the types derived from it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::JobOptions;

/// Lifecycle status of a job.
///
/// `queued -> running -> {completed | failed}`; the last two are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    /// Staying in the same non-terminal status is always allowed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Queued | JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Running | JobStatus::Completed | JobStatus::Failed) => {
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One timestamped, human-readable line of a job's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A named, located output produced by a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub location: String,
    pub stage: String,
    pub produced_at: DateTime<Utc>,
}

/// Proof of execution rights over a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub owner: String,
}

impl Lease {
    pub fn new(job_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            owner: owner.into(),
        }
    }
}

/// A job record as stored, with typed fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub case_id: String,
    pub user_id: String,
    pub upload_ids: Vec<String>,
    pub video_paths: Vec<PathBuf>,
    pub options: JobOptions,
    pub status: JobStatus,
    pub progress: f64,
    pub artifacts: Vec<Artifact>,
    pub log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_stages: u32,
    pub recoveries: u32,
    pub cancel_requested: bool,
}

impl Job {
    /// Appends a log line stamped with the current time.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Raises progress to `value` (clamped to [0, 100]); never lowers it.
    pub fn raise_progress(&mut self, value: f64) {
        let value = value.clamp(0.0, 100.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifacts.iter().any(|a| a.name == name)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            case_id: self.case_id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            progress: self.progress,
            artifact_count: self.artifacts.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id.clone(),
            status: self.status,
            progress: self.progress,
            artifacts: self.artifacts.clone(),
            log: self.log.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Row of an administrative job listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSummary {
    pub job_id: String,
    pub case_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub artifact_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The read-only projection handed to status pollers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub artifacts: Vec<Artifact>,
    pub log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
