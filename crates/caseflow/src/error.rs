use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum CaseflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Errors returned synchronously by job store, queue and reader operations.
#[derive(Error, Debug)]
pub enum JobError {
    /// Malformed input; nothing was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job already reached `completed` or `failed`.
    #[error("Job {0} is terminal and can no longer be modified")]
    Terminal(String),

    /// The stored record changed between read and write.
    #[error("Concurrent modification of job {0}")]
    Conflict(String),

    /// The caller no longer holds the execution lease on this job.
    #[error("Lease on job {0} is no longer held by this worker")]
    LeaseLost(String),

    /// The durable store could not be read or written.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] crate::db::DatabaseError),
}

/// Failure of a single stage attempt. Never surfaced to status readers;
/// the runner records it in the job log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("stage panicked")]
    Panicked,

    #[error("attempt abandoned")]
    Abandoned,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid stage '{kind}': {reason}")]
    InvalidStage { kind: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to prepare artifact directory '{path}': {source}")]
    ArtifactDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CaseflowError>;
