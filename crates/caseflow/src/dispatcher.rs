//! Assigns queued jobs to idle workers and recovers jobs whose worker died.
//!
//! Every assignment is an atomic claim in the job store, so several
//! dispatchers (threads or processes) may share one database without ever
//! running a job twice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::config::{Config, RecoveryPolicy};
use crate::error::{CaseflowError, JobError, WorkerError};
use crate::job::Lease;
use crate::pipeline::PipelineRunner;
use crate::store::JobStore;
use crate::worker::{JobOutcome, WorkerPool};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub recovery: RecoveryPolicy,
    pub max_recoveries: u32,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval(),
            lease_timeout: config.lease_timeout(),
            recovery: config.recovery,
            max_recoveries: config.max_recoveries,
        }
    }
}

/// Shared by the handle and the dispatch thread.
struct Inner {
    store: JobStore,
    runner: Arc<PipelineRunner>,
    config: DispatcherConfig,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerPool>>,
}

impl Dispatcher {
    pub fn new(runner: Arc<PipelineRunner>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: runner.store().clone(),
                runner,
                config,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Identity recorded on every job this dispatcher claims.
    pub fn owner(&self) -> &str {
        self.inner.runner.owner()
    }

    /// Starts the worker pool and the dispatch loop.
    ///
    /// Orphaned jobs are recovered once before the loop begins.
    pub fn start(&mut self) -> Result<(), CaseflowError> {
        if self.handle.is_some() {
            return Err(WorkerError::SpawnFailed("dispatcher already started".to_string()).into());
        }

        let pool = WorkerPool::new(Arc::clone(&self.inner.runner), self.inner.config.worker_count)?;
        let pending: VecDeque<Lease> = self
            .inner
            .recover_orphans(|job_id| pool.is_executing(job_id))?
            .into();

        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("caseflow-dispatcher".to_string())
            .spawn(move || inner.run_loop(pool, pending, shutdown))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        info!(owner = %self.owner(), "Dispatcher started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Stops claiming new work. Jobs already executing run to the end of
    /// their current stage sequence.
    pub fn shutdown(&self) {
        info!("Shutting down dispatcher...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins the dispatch loop and the worker pool. Call after `shutdown`.
    pub fn wait(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match handle.join() {
            Ok(pool) => {
                pool.shutdown();
                for outcome in pool.wait() {
                    log_outcome(&outcome);
                }
            }
            Err(e) => error!("Dispatcher thread panicked: {:?}", e),
        }
        info!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Inner {
    fn run_loop(
        &self,
        pool: WorkerPool,
        mut pending: VecDeque<Lease>,
        shutdown: Arc<AtomicBool>,
    ) -> WorkerPool {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(&pool, &mut pending) {
                error!(error = %e, "Dispatch tick failed");
            }
            thread::sleep(self.config.poll_interval);
        }

        // Outcomes of jobs that finished during the last tick.
        while let Some(outcome) = pool.try_recv_outcome() {
            log_outcome(&outcome);
        }
        if !pending.is_empty() {
            info!(
                count = pending.len(),
                "Leaving recovered jobs for the next dispatcher"
            );
        }
        pool
    }

    fn tick(&self, pool: &WorkerPool, pending: &mut VecDeque<Lease>) -> Result<(), CaseflowError> {
        let _span = info_span!("dispatch").entered();

        let recovered = self.recover_orphans(|job_id| {
            pool.is_executing(job_id) || pending.iter().any(|lease| lease.job_id == job_id)
        })?;
        pending.extend(recovered);

        // Recovered leases waiting for a free worker must not expire again.
        let mut kept = VecDeque::with_capacity(pending.len());
        for lease in pending.drain(..) {
            if self.store.heartbeat(&lease)? {
                kept.push_back(lease);
            } else {
                warn!(job_id = %lease.job_id, "Recovered lease lost before execution");
            }
        }
        *pending = kept;

        while pool.available() > 0 {
            let lease = match pending.pop_front() {
                Some(lease) => lease,
                None => match self.store.claim_next(self.runner.owner())? {
                    Some(job) => {
                        debug!(job_id = %job.job_id, "Claimed queued job");
                        Lease::new(job.job_id, self.runner.owner())
                    }
                    None => break,
                },
            };
            pool.submit(lease)?;
        }

        while let Some(outcome) = pool.try_recv_outcome() {
            log_outcome(&outcome);
        }
        Ok(())
    }

    /// Takes over running jobs whose lease expired and applies the
    /// recovery policy. Returns the leases to resume.
    ///
    /// `held` tells which of this owner's jobs are still with a worker. An
    /// expired lease of ours that no worker holds (execution aborted on a
    /// store error, say) is recovered like anyone else's.
    fn recover_orphans<F>(&self, held: F) -> Result<Vec<Lease>, JobError>
    where
        F: Fn(&str) -> bool,
    {
        let older_than = chrono::Duration::milliseconds(self.config.lease_timeout.as_millis() as i64);
        let owner = self.runner.owner();
        let mut resumed = Vec::new();

        for job in self.store.expired_leases(older_than)? {
            let Some(previous) = job.claimed_by.clone() else {
                continue;
            };
            if previous == owner && held(&job.job_id) {
                warn!(job_id = %job.job_id, "Own lease expired; heartbeat is lagging");
                continue;
            }
            // Someone else may take it over first; that is fine.
            let Some(taken) = self.store.take_over(&job.job_id, &previous, owner)? else {
                continue;
            };
            let lease = Lease::new(&taken.job_id, owner);

            let reason = match self.config.recovery {
                RecoveryPolicy::Fail => Some(format!("worker lost ({} stopped renewing its lease)", previous)),
                RecoveryPolicy::Resume if taken.recoveries > self.config.max_recoveries => Some(format!(
                    "worker lost; recovery limit of {} reached",
                    self.config.max_recoveries
                )),
                RecoveryPolicy::Resume => None,
            };

            match reason {
                Some(reason) => match self.runner.fail_job(&lease, &reason) {
                    Ok(_) | Err(JobError::LeaseLost(_)) | Err(JobError::Terminal(_)) => {}
                    Err(e) => return Err(e),
                },
                None => {
                    info!(
                        job_id = %taken.job_id,
                        previous = %previous,
                        resume_from = taken.completed_stages,
                        "Resuming orphaned job"
                    );
                    resumed.push(lease);
                }
            }
        }

        Ok(resumed)
    }
}

fn log_outcome(outcome: &JobOutcome) {
    if outcome.is_completed() {
        info!(
            job_id = %outcome.job_id,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Job completed"
        );
        return;
    }
    match (&outcome.status, &outcome.error) {
        (Some(status), _) => info!(job_id = %outcome.job_id, %status, "Job finished"),
        (None, Some(e)) => error!(job_id = %outcome.job_id, error = %e, "Job execution aborted"),
        (None, None) => warn!(job_id = %outcome.job_id, "Job outcome without status"),
    }
}
