use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use crate::artifacts::{self, ArtifactRegistry};
use crate::config::Config;
use crate::error::{JobError, StageError};
use crate::job::{Job, JobStatus, Lease, LogLevel};
use crate::sanitize;
use crate::stage::{CommandStage, Stage, StageKind, StageOutput};
use crate::store::JobStore;

use super::attempt::Attempt;
use super::config::PipelineConfig;

/// One configured pipeline stage and its per-attempt time limit.
#[derive(Clone)]
pub struct StageSlot {
    pub stage: Arc<dyn Stage>,
    pub timeout: Duration,
}

/// Drives jobs through the ordered stages.
///
/// All job writes go through [`JobStore::update_leased`], so a runner that
/// lost its lease cannot touch the job again.
pub struct PipelineRunner {
    store: JobStore,
    artifacts: ArtifactRegistry,
    stages: Vec<StageSlot>,
    config: PipelineConfig,
    owner: String,
}

/// What happened to a stage once its attempts are over.
enum StageResult {
    Committed,
    JobFinished(JobStatus),
}

impl PipelineRunner {
    pub fn new(store: JobStore, artifacts: ArtifactRegistry, config: PipelineConfig) -> Self {
        Self {
            store,
            artifacts,
            stages: Vec::new(),
            config,
            owner: default_owner(),
        }
    }

    /// Production constructor: one [`CommandStage`] per configured stage.
    pub fn from_config(store: JobStore, config: &Config) -> Self {
        let artifacts = ArtifactRegistry::new(&config.artifact_root, store.clone());
        let mut runner = Self::new(store, artifacts, PipelineConfig::from_config(config));
        for stage in &config.stages {
            runner = runner.with_stage(Arc::new(CommandStage::from_config(stage)), stage.timeout());
        }
        runner
    }

    /// Appends a stage to the pipeline.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>, timeout: Duration) -> Self {
        self.stages.push(StageSlot { stage, timeout });
        self
    }

    /// Overrides the worker identity recorded on claimed jobs.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.stage.kind()).collect()
    }

    /// Claims a queued job and runs it to a terminal status.
    ///
    /// On a job that is not queued this does nothing and reports the
    /// current status, so duplicate or concurrent calls are harmless.
    pub fn run_job(&self, job_id: &str) -> Result<JobStatus, JobError> {
        match self.store.claim(job_id, &self.owner)? {
            Some(_) => self.execute(&Lease::new(job_id, self.owner.clone())),
            None => {
                let status = self.store.get(job_id)?.status;
                debug!(job_id, %status, "Job not queued; nothing to run");
                Ok(status)
            }
        }
    }

    /// Runs the remaining stages of a job held by `lease`.
    ///
    /// Resumes after the last committed stage. Returns the job's status
    /// when this runner stops; if the lease was lost that is whatever the
    /// new holder left it at.
    pub fn execute(&self, lease: &Lease) -> Result<JobStatus, JobError> {
        let job = self.store.get(&lease.job_id)?;
        let _span = info_span!("pipeline",
            job_id = %lease.job_id,
            owner = %lease.owner,
            files = %sanitize::redact_paths(&job.video_paths),
        )
        .entered();

        let started = Instant::now();
        match self.drive(lease) {
            Ok(status) => {
                info!(%status, elapsed_ms = started.elapsed().as_millis() as u64, "Pipeline finished");
                Ok(status)
            }
            Err(JobError::LeaseLost(_)) | Err(JobError::Terminal(_)) => {
                warn!("Lease lost; stopping without further writes");
                Ok(self.store.get(&lease.job_id)?.status)
            }
            Err(e) => {
                error!(error = %e, "Pipeline aborted");
                Err(e)
            }
        }
    }

    /// Marks a held job failed with `reason`.
    pub fn fail_job(&self, lease: &Lease, reason: &str) -> Result<JobStatus, JobError> {
        let job = self.store.update_leased(lease, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(reason.to_string());
            job.push_log(LogLevel::Error, format!("Job failed: {}", reason));
            Ok(())
        })?;
        warn!(job_id = %job.job_id, reason, "Job failed");
        Ok(job.status)
    }

    fn drive(&self, lease: &Lease) -> Result<JobStatus, JobError> {
        let total = self.stages.len();
        loop {
            let job = self.store.get(&lease.job_id)?;
            if job.is_finished() {
                return Ok(job.status);
            }
            if job.status != JobStatus::Running
                || job.claimed_by.as_deref() != Some(lease.owner.as_str())
            {
                return Err(JobError::LeaseLost(lease.job_id.clone()));
            }
            if job.cancel_requested {
                return self.fail_job(lease, "cancelled at user request");
            }

            let index = job.completed_stages as usize;
            if index >= total {
                return self.complete(lease);
            }
            if !self.store.heartbeat(lease)? {
                return Err(JobError::LeaseLost(lease.job_id.clone()));
            }

            let slot = &self.stages[index];
            let kind = slot.stage.kind();
            if kind.is_disabled_by(&job.options) {
                let credit = stage_credit(index + 1, total);
                self.store.update_leased(lease, |job| {
                    expect_stage(job, index)?;
                    job.completed_stages += 1;
                    job.raise_progress(credit);
                    job.push_log(
                        LogLevel::Info,
                        format!("Stage {} skipped (disabled by job options)", kind),
                    );
                    Ok(())
                })?;
                info!(stage = %kind, "Stage skipped");
                continue;
            }

            match self.run_stage(lease, &job, index, slot)? {
                StageResult::Committed => continue,
                StageResult::JobFinished(status) => return Ok(status),
            }
        }
    }

    fn run_stage(
        &self,
        lease: &Lease,
        job: &Job,
        index: usize,
        slot: &StageSlot,
    ) -> Result<StageResult, JobError> {
        let total = self.stages.len();
        let kind = slot.stage.kind();
        let max_attempts = self.config.retry.max_attempts.max(1);

        self.store.update_leased(lease, |job| {
            job.push_log(
                LogLevel::Info,
                format!("Stage {} started ({}/{})", kind, index + 1, total),
            );
            Ok(())
        })?;

        let mut attempt = 1;
        loop {
            let _span = info_span!("stage", stage = %kind, attempt).entered();

            let dir = self
                .artifacts
                .attempt_dir(&job.job_id, kind, job.recoveries, attempt);
            let failure = match self.attempt(lease, job, index, slot, attempt)? {
                Ok(output) => match self.commit_stage(lease, index, kind, &dir, output) {
                    Ok(()) => {
                        info!("Stage succeeded");
                        return Ok(StageResult::Committed);
                    }
                    Err(JobError::Validation(msg)) => StageError::Failed(msg),
                    Err(e) => return Err(e),
                },
                Err(e) => e,
            };

            if attempt >= max_attempts {
                let reason = format!(
                    "stage {} failed after {} attempt(s): {}",
                    kind, attempt, failure
                );
                return self.fail_job(lease, &reason).map(StageResult::JobFinished);
            }

            let backoff = self.config.retry.backoff(attempt);
            warn!(error = %failure, ?backoff, "Stage attempt failed; retrying");
            self.store.update_leased(lease, |job| {
                job.push_log(
                    LogLevel::Warn,
                    format!(
                        "Stage {} attempt {}/{} failed: {}; retrying in {} ms",
                        kind,
                        attempt,
                        max_attempts,
                        failure,
                        backoff.as_millis()
                    ),
                );
                Ok(())
            })?;
            self.sleep_holding_lease(lease, backoff)?;
            attempt += 1;
        }
    }

    fn attempt(
        &self,
        lease: &Lease,
        job: &Job,
        index: usize,
        slot: &StageSlot,
        number: u32,
    ) -> Result<Result<StageOutput, StageError>, JobError> {
        let kind = slot.stage.kind();
        let prepared = self
            .artifacts
            .prepare_attempt_dir(&job.job_id, kind, job.recoveries, number);
        let output_dir = match prepared {
            Ok(dir) => dir,
            Err(e) => return Ok(Err(StageError::Failed(e.to_string()))),
        };

        let share = 100.0 / self.stages.len() as f64;
        Attempt {
            store: &self.store,
            lease,
            job,
            stage: Arc::clone(&slot.stage),
            output_dir,
            number,
            timeout: slot.timeout,
            heartbeat_interval: self.config.heartbeat_interval,
            base: stage_credit(index, self.stages.len()),
            share,
        }
        .run()
    }

    /// Records a successful stage in one update: its artifacts (relative
    /// locations resolve against the attempt's `dir`), its progress credit,
    /// its log line and the resume point.
    fn commit_stage(
        &self,
        lease: &Lease,
        index: usize,
        kind: StageKind,
        dir: &Path,
        output: StageOutput,
    ) -> Result<(), JobError> {
        let credit = stage_credit(index + 1, self.stages.len());
        self.store.update_leased(lease, |job| {
            expect_stage(job, index)?;
            artifacts::attach(job, kind, dir, &output.artifacts)?;
            job.completed_stages += 1;
            job.raise_progress(credit);
            job.push_log(
                LogLevel::Info,
                format!(
                    "Stage {} succeeded with {} artifact(s)",
                    kind,
                    output.artifacts.len()
                ),
            );
            Ok(())
        })?;
        Ok(())
    }

    fn complete(&self, lease: &Lease) -> Result<JobStatus, JobError> {
        let job = self.store.update_leased(lease, |job| {
            job.status = JobStatus::Completed;
            job.raise_progress(100.0);
            let count = job.artifacts.len();
            job.push_log(
                LogLevel::Info,
                format!("Job completed with {} artifact(s)", count),
            );
            Ok(())
        })?;
        Ok(job.status)
    }

    fn sleep_holding_lease(&self, lease: &Lease, duration: Duration) -> Result<(), JobError> {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(self.config.heartbeat_interval));
            if !self.store.heartbeat(lease)? {
                return Err(JobError::LeaseLost(lease.job_id.clone()));
            }
        }
    }
}

/// Progress owed once `completed` of `total` stages are done.
fn stage_credit(completed: usize, total: usize) -> f64 {
    if total == 0 || completed >= total {
        return 100.0;
    }
    completed as f64 * 100.0 / total as f64
}

/// Guards a stage commit against a resume point that moved underneath us.
fn expect_stage(job: &Job, index: usize) -> Result<(), JobError> {
    if job.completed_stages as usize != index {
        return Err(JobError::Conflict(format!(
            "{} (expected stage {}, resume point is {})",
            job.job_id, index, job.completed_stages
        )));
    }
    Ok(())
}

fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "caseflow".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}
