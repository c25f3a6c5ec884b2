//! Job progress broadcaster for live status streaming.
//!
//! The job store publishes one event per committed mutation. Subscribers
//! that fall behind lose the oldest events (`RecvError::Lagged`); the job
//! store stays authoritative, so a lagging poller just re-reads it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobStatus};

/// Snapshot of a job right after a committed change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    /// Latest log line at the time of the change.
    pub message: String,
    pub artifact_count: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Overall progress including the running stage's own report. Never
    /// persisted; `progress` only moves when a stage commits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_progress: Option<f64>,
}

impl JobProgressEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            message: job
                .log
                .last()
                .map(|entry| entry.message.clone())
                .unwrap_or_default(),
            artifact_count: job.artifacts.len(),
            timestamp: job.updated_at,
            error: job.error.clone(),
            estimated_progress: None,
        }
    }

    /// A running stage's progress report on top of the committed `job`.
    pub fn stage_report(job: &Job, message: String, estimate: f64) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            estimated_progress: Some(estimate),
            ..Self::from_job(job)
        }
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
