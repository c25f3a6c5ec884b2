//! Read-only view of jobs for pollers and administrators.

use tokio::sync::broadcast;

use crate::broadcast::JobProgressEvent;
use crate::error::JobError;
use crate::job::JobStatusView;
use crate::store::{JobPage, JobQuery, JobStore, StatusCounts};

/// Answers status queries from committed state only; never waits on a
/// running stage.
#[derive(Clone)]
pub struct StatusReader {
    store: JobStore,
}

impl StatusReader {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatusView, JobError> {
        Ok(self.store.get(job_id)?.status_view())
    }

    pub fn list(&self, query: &JobQuery) -> Result<JobPage, JobError> {
        self.store.list(query)
    }

    pub fn counts(&self) -> Result<StatusCounts, JobError> {
        self.store.counts()
    }

    /// Live events for every committed change and every running-stage
    /// progress report, if the store broadcasts.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<JobProgressEvent>> {
        self.store.broadcaster().map(|b| b.subscribe())
    }
}
