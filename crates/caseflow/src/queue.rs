//! Intake of batch requests.

use tracing::info;

use crate::error::JobError;
use crate::job::BatchRequest;
use crate::store::JobStore;

/// Turns validated batch requests into queued jobs. Never waits for a
/// worker: the returned id is all the caller gets until it polls.
#[derive(Clone)]
pub struct JobQueue {
    store: JobStore,
}

impl JobQueue {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn enqueue_batch(&self, request: &BatchRequest) -> Result<String, JobError> {
        request.validate()?;
        let job_id = self.store.create(request)?;
        info!(
            job_id = %job_id,
            case_id = %request.case_id,
            files = request.video_paths.len(),
            "Batch enqueued"
        );
        Ok(job_id)
    }

    /// Parses and enqueues a JSON submission.
    pub fn enqueue_json(&self, content: &str) -> Result<String, JobError> {
        self.enqueue_batch(&BatchRequest::from_json(content)?)
    }
}
