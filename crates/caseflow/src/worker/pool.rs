use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::job::Lease;
use crate::pipeline::PipelineRunner;
use crate::worker::job::JobOutcome;

/// Job ids submitted to the pool and not yet finished.
type Held = Arc<Mutex<HashSet<String>>>;

fn lock(held: &Held) -> MutexGuard<'_, HashSet<String>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed set of OS threads, each executing one claimed job at a time.
pub struct WorkerPool {
    lease_sender: Sender<Lease>,
    outcome_receiver: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    held: Held,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(runner: Arc<PipelineRunner>, worker_count: usize) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        let (lease_sender, lease_receiver) = bounded::<Lease>(worker_count);
        let (outcome_sender, outcome_receiver) = unbounded::<JobOutcome>();
        let held: Held = Arc::default();

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let lease_rx = lease_receiver.clone();
            let outcome_tx = outcome_sender.clone();
            let held = Arc::clone(&held);
            let runner = Arc::clone(&runner);

            let handle = thread::Builder::new()
                .name(format!("caseflow-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, lease_rx, outcome_tx, held, runner))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            lease_sender,
            outcome_receiver,
            workers,
            shutdown: Arc::new(AtomicBool::new(false)),
            held,
            worker_count,
        })
    }

    /// Hands a claimed job to the next free worker.
    pub fn submit(&self, lease: Lease) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        let job_id = lease.job_id.clone();
        lock(&self.held).insert(job_id.clone());
        self.lease_sender.send(lease).map_err(|_| {
            lock(&self.held).remove(&job_id);
            WorkerError::ChannelClosed
        })
    }

    /// Number of workers that could start a job right now.
    pub fn available(&self) -> usize {
        self.worker_count.saturating_sub(lock(&self.held).len())
    }

    /// Whether `job_id` was submitted here and has not finished yet.
    pub fn is_executing(&self, job_id: &str) -> bool {
        lock(&self.held).contains(job_id)
    }

    pub fn try_recv_outcome(&self) -> Option<JobOutcome> {
        self.outcome_receiver.try_recv().ok()
    }

    #[cfg(test)]
    pub fn recv_outcome(&self) -> Option<JobOutcome> {
        self.outcome_receiver.recv().ok()
    }

    /// Rejects further submissions. Leases already submitted still run.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Runs every submitted lease to the end, then joins the workers.
    /// Returns the outcomes nobody collected.
    pub fn wait(self) -> Vec<JobOutcome> {
        // Workers exit once the channel is closed and drained.
        drop(self.lease_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
        self.outcome_receiver.try_iter().collect()
    }

    #[cfg(test)]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    lease_receiver: Receiver<Lease>,
    outcome_sender: Sender<JobOutcome>,
    held: Held,
    runner: Arc<PipelineRunner>,
) {
    debug!("Worker {} started", worker_id);

    for lease in lease_receiver.iter() {
        debug!("Worker {} executing job {}", worker_id, lease.job_id);

        let started = Instant::now();
        let result = runner.execute(&lease);
        if let Err(ref e) = result {
            warn!(
                "Worker {} gave up on job {}: {}; it is recovered once its lease expires",
                worker_id, lease.job_id, e
            );
        }
        let outcome = JobOutcome::from_result(&lease, result, started.elapsed());
        lock(&held).remove(&lease.job_id);

        if let Err(e) = outcome_sender.send(outcome) {
            error!("Worker {} failed to send outcome: {}", worker_id, e);
        }
    }

    debug!("Worker {} stopped", worker_id);
}
