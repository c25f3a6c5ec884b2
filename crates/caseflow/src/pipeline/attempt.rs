//! A single supervised attempt at one stage.
//!
//! The stage runs on its own thread. The calling worker waits on the event
//! channel, publishing progress reports and renewing the lease, until the
//! stage finishes or the timeout passes. Reports are broadcast only: the
//! stored progress moves when the stage commits. A timed-out attempt is
//! flagged as abandoned and left to wind down on its own, inside an output
//! directory no later attempt uses.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::error::{JobError, StageError};
use crate::job::{Job, Lease};
use crate::stage::{Stage, StageContext, StageEvent, StageOutput};
use crate::store::JobStore;

/// Progress changes smaller than this (in percentage points) are not
/// broadcast.
const MIN_PROGRESS_STEP: f64 = 0.5;

/// Marks the attempt abandoned when the supervisor leaves early, whatever
/// the reason.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct Attempt<'a> {
    pub store: &'a JobStore,
    pub lease: &'a Lease,
    pub job: &'a Job,
    pub stage: Arc<dyn Stage>,
    pub output_dir: PathBuf,
    pub number: u32,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Overall progress when the stage started, and the points it is worth.
    pub base: f64,
    pub share: f64,
}

impl Attempt<'_> {
    /// Runs the attempt to completion, failure or timeout.
    ///
    /// The outer error means the job itself can no longer be written (lease
    /// lost, store failure); the inner one is an ordinary stage failure.
    pub fn run(self) -> Result<Result<StageOutput, StageError>, JobError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));

        let kind = self.stage.kind();
        let ctx = StageContext::new(
            self.job.job_id.clone(),
            kind,
            self.job.upload_ids.clone(),
            self.job.video_paths.clone(),
            self.job.options.clone(),
            self.output_dir.clone(),
            self.number,
            tx.clone(),
            Arc::clone(&abandoned),
        );
        let stage = Arc::clone(&self.stage);
        let span = tracing::Span::current();

        let spawned = thread::Builder::new()
            .name(format!("stage-{}", kind))
            .spawn(move || {
                let _entered = span.enter();
                let result = panic::catch_unwind(AssertUnwindSafe(|| stage.run(&ctx)))
                    .unwrap_or(Err(StageError::Panicked));
                let _ = tx.send(StageEvent::Finished(result));
            });
        if let Err(e) = spawned {
            return Ok(Err(StageError::Spawn {
                command: kind.to_string(),
                reason: e.to_string(),
            }));
        }

        let started = Instant::now();
        let deadline = started + self.timeout;
        let ceiling = (self.base + self.share).min(100.0);
        let mut published = self.job.progress;
        let mut last_heartbeat = started;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(stage = %kind, timeout = ?self.timeout, "Stage attempt timed out");
                return Ok(Err(StageError::Timeout(self.timeout)));
            }
            let next_heartbeat = last_heartbeat + self.heartbeat_interval;
            let wait = deadline.min(next_heartbeat).saturating_duration_since(now);

            match rx.recv_timeout(wait) {
                Ok(StageEvent::Finished(result)) => return Ok(result),
                Ok(StageEvent::Progress(fraction)) => {
                    let estimate = (self.base + fraction * self.share).min(ceiling);
                    if estimate - published >= MIN_PROGRESS_STEP {
                        self.store.publish_stage_report(
                            self.job,
                            format!("Stage {} at {:.0}%", kind, fraction * 100.0),
                            estimate,
                        );
                        published = estimate;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(Err(StageError::Panicked)),
            }

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                if !self.store.heartbeat(self.lease)? {
                    return Err(JobError::LeaseLost(self.lease.job_id.clone()));
                }
                debug!(stage = %kind, "Lease renewed");
                last_heartbeat = Instant::now();
            }
        }
    }
}
