//! Test harness for isolated end-to-end runs.
//!
//! Each `TestHarness` owns a temp directory holding a SQLite database file
//! and an artifact root, so tests can reopen the store or run several
//! runners against the same state.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use caseflow::config::RetryConfig;
use caseflow::{
    ArtifactRegistry, BatchRequest, Database, Dispatcher, DispatcherConfig, Job, JobOptions,
    JobProgressBroadcaster, JobQueue, JobStore, PipelineConfig, PipelineRunner, RecoveryPolicy,
    Stage, StatusReader,
};

use super::scripted::ScriptedStage;

/// Stage timeout used unless a test asks for another.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub artifact_root: PathBuf,
    pub store: JobStore,
    pub broadcaster: JobProgressBroadcaster,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("caseflow.db");
        let artifact_root = temp_dir.path().join("artifacts");

        let broadcaster = JobProgressBroadcaster::new(1024);
        let store = JobStore::new(Database::open(&db_path).expect("Failed to open database"))
            .with_broadcaster(broadcaster.clone());

        Self {
            temp_dir,
            db_path,
            artifact_root,
            store,
            broadcaster,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A second, independent connection to the same database file.
    pub fn reopen(&self) -> JobStore {
        JobStore::new(Database::open(&self.db_path).expect("Failed to reopen database"))
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store.clone())
    }

    pub fn reader(&self) -> StatusReader {
        StatusReader::new(self.store.clone())
    }

    pub fn request(case_id: &str, files: usize) -> BatchRequest {
        BatchRequest::new(
            case_id,
            "U1",
            (1..=files).map(|i| format!("upload-{}", i)).collect(),
            (1..=files)
                .map(|i| PathBuf::from(format!("/evidence/{}/bodycam-{}.mp4", case_id, i)))
                .collect(),
            JobOptions::default(),
        )
    }

    /// Enqueues a two-file batch for case `C1`.
    pub fn enqueue(&self) -> String {
        self.queue()
            .enqueue_batch(&Self::request("C1", 2))
            .expect("Failed to enqueue")
    }

    pub fn enqueue_with(&self, options: JobOptions) -> String {
        let mut request = Self::request("C1", 2);
        request.options = options;
        self.queue().enqueue_batch(&request).expect("Failed to enqueue")
    }

    /// Fast retries and heartbeats so failure paths finish quickly.
    pub fn pipeline_config(max_attempts: u32) -> PipelineConfig {
        PipelineConfig {
            retry: RetryConfig {
                max_attempts,
                initial_backoff_ms: 10,
                max_backoff_ms: 20,
            },
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    pub fn runner(&self, owner: &str, stages: &[Arc<ScriptedStage>]) -> PipelineRunner {
        self.runner_with(owner, stages, Self::pipeline_config(2), STAGE_TIMEOUT)
    }

    pub fn runner_with(
        &self,
        owner: &str,
        stages: &[Arc<ScriptedStage>],
        config: PipelineConfig,
        timeout: Duration,
    ) -> PipelineRunner {
        self.build_runner(&self.store, owner, stages, config, timeout)
    }

    /// A runner whose writes go through `store`, e.g. one from [`Self::reopen`].
    pub fn runner_on(
        &self,
        store: &JobStore,
        owner: &str,
        stages: &[Arc<ScriptedStage>],
    ) -> PipelineRunner {
        self.build_runner(store, owner, stages, Self::pipeline_config(2), STAGE_TIMEOUT)
    }

    fn build_runner(
        &self,
        store: &JobStore,
        owner: &str,
        stages: &[Arc<ScriptedStage>],
        config: PipelineConfig,
        timeout: Duration,
    ) -> PipelineRunner {
        let artifacts = ArtifactRegistry::new(&self.artifact_root, store.clone());
        stages.iter().fold(
            PipelineRunner::new(store.clone(), artifacts, config).with_owner(owner),
            |runner, stage| {
                let stage: Arc<dyn Stage> = stage.clone();
                runner.with_stage(stage, timeout)
            },
        )
    }

    pub fn dispatcher(&self, runner: PipelineRunner, recovery: RecoveryPolicy) -> Dispatcher {
        Dispatcher::new(
            Arc::new(runner),
            DispatcherConfig {
                worker_count: 2,
                poll_interval: Duration::from_millis(20),
                lease_timeout: Duration::from_millis(300),
                recovery,
                max_recoveries: 3,
            },
        )
    }

    /// Polls until `done` holds for the job or `timeout` passes.
    pub fn wait_for<F>(&self, job_id: &str, timeout: Duration, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.store.get(job_id).expect("job disappeared");
            if done(&job) || Instant::now() >= deadline {
                return job;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}
