use std::time::Duration;

use crate::error::JobError;
use crate::job::{JobStatus, Lease};

/// What a worker reports back after executing one lease.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub owner: String,
    /// Status the job was left in; `None` if execution aborted on an error.
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl JobOutcome {
    pub fn from_result(lease: &Lease, result: Result<JobStatus, JobError>, elapsed: Duration) -> Self {
        let (status, error) = match result {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            job_id: lease.job_id.clone(),
            owner: lease.owner.clone(),
            status,
            error,
            elapsed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(JobStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_ok() {
        let lease = Lease::new("j1", "w1");
        let outcome = JobOutcome::from_result(&lease, Ok(JobStatus::Completed), Duration::ZERO);
        assert!(outcome.is_completed());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.owner, "w1");
    }

    #[test]
    fn test_outcome_from_error() {
        let lease = Lease::new("j1", "w1");
        let outcome = JobOutcome::from_result(
            &lease,
            Err(JobError::NotFound("j1".to_string())),
            Duration::from_millis(3),
        );
        assert!(!outcome.is_completed());
        assert_eq!(outcome.status, None);
        assert!(outcome.error.unwrap().contains("not found"));
    }
}
