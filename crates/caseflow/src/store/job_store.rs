//! Durable job store backed by rusqlite.
//!
//! Every mutation runs as one `BEGIN IMMEDIATE` transaction: the record is
//! loaded, the caller's mutator is applied to a copy, the result is checked
//! against the job invariants, and the row is written back guarded by its
//! version. Log lines and artifacts live in insert-only tables, so only the
//! appended suffix is ever written.

use std::path::PathBuf;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::db::job_repo::{self, ArtifactRow, JobFilter, JobRow, LogRow};
use crate::db::{Database, DatabaseError};
use crate::error::JobError;
use crate::job::{
    Artifact, BatchRequest, Job, JobOptions, JobStatus, JobSummary, Lease, LogEntry, LogLevel,
};

/// How many fresh ids to try before giving up on a collision.
const MAX_ID_ATTEMPTS: usize = 3;

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str, job_id: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(job_id, format!("bad timestamp '{}': {}", s, e)))
}

fn parse_optional_timestamp(
    s: Option<&str>,
    job_id: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_timestamp(s, job_id)).transpose()
}

fn corrupt(job_id: &str, reason: String) -> DatabaseError {
    DatabaseError::CorruptRow {
        job_id: job_id.to_string(),
        reason,
    }
}

fn encode_json<T: Serialize>(value: &T, job_id: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| corrupt(job_id, e.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(
    s: &str,
    job_id: &str,
    column: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| corrupt(job_id, format!("column {}: {}", column, e)))
}

fn decode_job(
    row: JobRow,
    log: Vec<LogRow>,
    artifacts: Vec<ArtifactRow>,
) -> Result<Job, DatabaseError> {
    let id = row.id.as_str();
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| corrupt(id, format!("unknown status '{}'", row.status)))?;

    let log = log
        .into_iter()
        .map(|entry| {
            Ok(LogEntry {
                at: parse_timestamp(&entry.logged_at, id)?,
                level: LogLevel::parse(&entry.level)
                    .ok_or_else(|| corrupt(id, format!("unknown log level '{}'", entry.level)))?,
                message: entry.message,
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;

    let artifacts = artifacts
        .into_iter()
        .map(|a| {
            Ok(Artifact {
                name: a.name,
                location: a.location,
                stage: a.stage,
                produced_at: parse_timestamp(&a.produced_at, id)?,
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;

    Ok(Job {
        upload_ids: decode_json(&row.upload_ids, id, "upload_ids")?,
        video_paths: decode_json::<Vec<PathBuf>>(&row.video_paths, id, "video_paths")?,
        options: decode_json::<JobOptions>(&row.options, id, "options")?,
        status,
        progress: row.progress,
        artifacts,
        log,
        created_at: parse_timestamp(&row.created_at, id)?,
        updated_at: parse_timestamp(&row.updated_at, id)?,
        completed_at: parse_optional_timestamp(row.completed_at.as_deref(), id)?,
        heartbeat_at: parse_optional_timestamp(row.heartbeat_at.as_deref(), id)?,
        error: row.error,
        version: row.version,
        claimed_by: row.claimed_by,
        completed_stages: row.completed_stages,
        recoveries: row.recoveries,
        cancel_requested: row.cancel_requested,
        case_id: row.case_id,
        user_id: row.user_id,
        job_id: row.id,
    })
}

fn encode_job(job: &Job) -> Result<JobRow, DatabaseError> {
    let id = job.job_id.as_str();
    Ok(JobRow {
        id: job.job_id.clone(),
        case_id: job.case_id.clone(),
        user_id: job.user_id.clone(),
        upload_ids: encode_json(&job.upload_ids, id)?,
        video_paths: encode_json(&job.video_paths, id)?,
        options: encode_json(&job.options, id)?,
        status: job.status.as_str().to_string(),
        progress: job.progress,
        version: job.version,
        error: job.error.clone(),
        created_at: format_timestamp(job.created_at),
        updated_at: format_timestamp(job.updated_at),
        completed_at: job.completed_at.map(format_timestamp),
        claimed_by: job.claimed_by.clone(),
        heartbeat_at: job.heartbeat_at.map(format_timestamp),
        completed_stages: job.completed_stages,
        recoveries: job.recoveries,
        cancel_requested: job.cancel_requested,
    })
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<Job>, DatabaseError> {
    let Some(row) = job_repo::find_by_id(conn, job_id)? else {
        return Ok(None);
    };
    let log = job_repo::list_log(conn, job_id)?;
    let artifacts = job_repo::list_artifacts(conn, job_id)?;
    decode_job(row, log, artifacts).map(Some)
}

fn require_job(conn: &Connection, job_id: &str) -> Result<Job, JobError> {
    load_job(conn, job_id)?.ok_or_else(|| JobError::NotFound(job_id.to_string()))
}

fn insert_log_entries(
    conn: &Connection,
    job_id: &str,
    first_seq: usize,
    entries: &[LogEntry],
) -> Result<(), DatabaseError> {
    for (offset, entry) in entries.iter().enumerate() {
        job_repo::insert_log(
            conn,
            job_id,
            &LogRow {
                seq: (first_seq + offset) as i64,
                logged_at: format_timestamp(entry.at),
                level: entry.level.as_str().to_string(),
                message: entry.message.clone(),
            },
        )?;
    }
    Ok(())
}

fn append_log(
    conn: &Connection,
    job: &Job,
    level: LogLevel,
    message: String,
) -> Result<(), DatabaseError> {
    let entry = LogEntry {
        at: Utc::now(),
        level,
        message,
    };
    insert_log_entries(conn, &job.job_id, job.log.len(), std::slice::from_ref(&entry))
}

/// Rejects any difference between `before` and `after` that a mutator is
/// not allowed to make.
fn check_mutation(before: &Job, after: &Job) -> Result<(), JobError> {
    let id = &before.job_id;
    let immutable = [
        ("job_id", before.job_id == after.job_id),
        ("case_id", before.case_id == after.case_id),
        ("user_id", before.user_id == after.user_id),
        ("upload_ids", before.upload_ids == after.upload_ids),
        ("video_paths", before.video_paths == after.video_paths),
        ("options", before.options == after.options),
        ("created_at", before.created_at == after.created_at),
        ("claimed_by", before.claimed_by == after.claimed_by),
        ("heartbeat_at", before.heartbeat_at == after.heartbeat_at),
        ("recoveries", before.recoveries == after.recoveries),
    ];
    if let Some((field, _)) = immutable.iter().find(|(_, same)| !same) {
        return Err(JobError::Validation(format!(
            "field '{}' of job {} cannot be modified",
            field, id
        )));
    }

    if !before.status.can_transition_to(after.status) {
        return Err(JobError::InvalidTransition {
            job_id: id.clone(),
            from: before.status,
            to: after.status,
        });
    }
    if before.status == JobStatus::Queued && after.status == JobStatus::Running {
        return Err(JobError::Validation(format!(
            "job {} can only start running by being claimed",
            id
        )));
    }

    if !after.progress.is_finite() || !(0.0..=100.0).contains(&after.progress) {
        return Err(JobError::Validation(format!(
            "progress {} of job {} is outside [0, 100]",
            after.progress, id
        )));
    }
    if after.progress < before.progress {
        return Err(JobError::Validation(format!(
            "progress of job {} cannot decrease ({} -> {})",
            id, before.progress, after.progress
        )));
    }
    if after.completed_stages < before.completed_stages {
        return Err(JobError::Validation(format!(
            "completed stage count of job {} cannot decrease",
            id
        )));
    }
    if before.cancel_requested && !after.cancel_requested {
        return Err(JobError::Validation(format!(
            "cancellation of job {} cannot be withdrawn",
            id
        )));
    }

    if after.log.len() < before.log.len() || after.log[..before.log.len()] != before.log[..] {
        return Err(JobError::Validation(format!(
            "log of job {} is append-only",
            id
        )));
    }
    if after.artifacts.len() < before.artifacts.len()
        || after.artifacts[..before.artifacts.len()] != before.artifacts[..]
    {
        return Err(JobError::Validation(format!(
            "artifacts of job {} are append-only",
            id
        )));
    }
    for (i, artifact) in after.artifacts.iter().enumerate().skip(before.artifacts.len()) {
        if artifact.name.trim().is_empty() {
            return Err(JobError::Validation(format!(
                "artifact of job {} has an empty name",
                id
            )));
        }
        if after.artifacts[..i].iter().any(|a| a.name == artifact.name) {
            return Err(JobError::Validation(format!(
                "artifact '{}' is already registered on job {}",
                artifact.name, id
            )));
        }
    }

    Ok(())
}

// ─── Query types ────────────────────────────────────────────────────────────

/// Query parameters for job listing.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub case_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One page of a job listing.
#[derive(Debug, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Number of jobs per status.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// The single source of truth for job records.
///
/// Cheap to clone; clones share the same database handle and broadcaster.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    broadcaster: Option<JobProgressBroadcaster>,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            broadcaster: None,
        }
    }

    /// Publishes every committed change to `broadcaster`.
    pub fn with_broadcaster(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn broadcaster(&self) -> Option<&JobProgressBroadcaster> {
        self.broadcaster.as_ref()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn publish(&self, job: &Job) {
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.send(JobProgressEvent::from_job(job));
        }
    }

    /// Publishes a running stage's own progress report. Nothing is written.
    pub fn publish_stage_report(&self, job: &Job, message: String, estimate: f64) {
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.send(JobProgressEvent::stage_report(job, message, estimate));
        }
    }

    /// Persists a new queued job and returns its id.
    pub fn create(&self, request: &BatchRequest) -> Result<String, JobError> {
        request.validate()?;

        let job = self.db.with_tx(|tx| -> Result<Job, JobError> {
            let mut id = uuid::Uuid::new_v4().to_string();
            let mut attempts = 1;
            while job_repo::is_retired(tx, &id)? || job_repo::find_by_id(tx, &id)?.is_some() {
                if attempts == MAX_ID_ATTEMPTS {
                    return Err(JobError::Conflict(id));
                }
                id = uuid::Uuid::new_v4().to_string();
                attempts += 1;
            }

            let now = Utc::now();
            let mut job = Job {
                job_id: id,
                case_id: request.case_id.clone(),
                user_id: request.user_id.clone(),
                upload_ids: request.upload_ids.clone(),
                video_paths: request.video_paths.clone(),
                options: request.options.clone(),
                status: JobStatus::Queued,
                progress: 0.0,
                artifacts: vec![],
                log: vec![],
                created_at: now,
                updated_at: now,
                completed_at: None,
                error: None,
                version: 1,
                claimed_by: None,
                heartbeat_at: None,
                completed_stages: 0,
                recoveries: 0,
                cancel_requested: false,
            };
            job.push_log(
                LogLevel::Info,
                format!(
                    "Job queued with {} file(s) for case {}",
                    job.video_paths.len(),
                    job.case_id
                ),
            );

            job_repo::insert(tx, &encode_job(&job)?)?;
            insert_log_entries(tx, &job.job_id, 0, &job.log)?;
            require_job(tx, &job.job_id)
        })?;

        log::info!("Created job {} for case {}", job.job_id, job.case_id);
        self.publish(&job);
        Ok(job.job_id)
    }

    /// Reads the committed state of a job.
    pub fn get(&self, job_id: &str) -> Result<Job, JobError> {
        self.db.with_conn(|conn| load_job(conn, job_id))?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Applies `mutator` to the job as one atomic, invariant-checked update.
    pub fn update<F>(&self, job_id: &str, mutator: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        self.apply(job_id, None, mutator)
    }

    /// Like [`JobStore::update`], but only while `lease` still holds the job.
    pub fn update_leased<F>(&self, lease: &Lease, mutator: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        self.apply(&lease.job_id, Some(lease), mutator)
    }

    fn apply<F>(&self, job_id: &str, lease: Option<&Lease>, mutator: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let job = self.db.with_tx(|tx| -> Result<Job, JobError> {
            let before = require_job(tx, job_id)?;
            if before.is_finished() {
                return Err(JobError::Terminal(job_id.to_string()));
            }
            if let Some(lease) = lease {
                if before.status != JobStatus::Running
                    || before.claimed_by.as_deref() != Some(lease.owner.as_str())
                {
                    return Err(JobError::LeaseLost(job_id.to_string()));
                }
            }

            let mut after = before.clone();
            mutator(&mut after)?;
            check_mutation(&before, &after)?;

            let mut now = Utc::now().trunc_subsecs(6);
            if now <= before.updated_at {
                now = before.updated_at + Duration::microseconds(1);
            }
            after.version = before.version + 1;
            after.updated_at = now;
            if after.status.is_terminal() && after.completed_at.is_none() {
                after.completed_at = Some(now);
            }

            if !job_repo::update_versioned(tx, &encode_job(&after)?, before.version)? {
                return Err(JobError::Conflict(job_id.to_string()));
            }
            insert_log_entries(tx, job_id, before.log.len(), &after.log[before.log.len()..])?;
            for (seq, artifact) in after
                .artifacts
                .iter()
                .enumerate()
                .skip(before.artifacts.len())
            {
                job_repo::insert_artifact(
                    tx,
                    job_id,
                    &ArtifactRow {
                        seq: seq as i64,
                        name: artifact.name.clone(),
                        location: artifact.location.clone(),
                        stage: artifact.stage.clone(),
                        produced_at: format_timestamp(artifact.produced_at),
                    },
                )?;
            }
            require_job(tx, job_id)
        })?;

        self.publish(&job);
        Ok(job)
    }

    /// Lists jobs for administrative use, newest first.
    pub fn list(&self, query: &JobQuery) -> Result<JobPage, JobError> {
        let filter = JobFilter {
            status: query.status.map(|s| s.as_str().to_string()),
            case_id: query.case_id.clone(),
            user_id: query.user_id.clone(),
            limit: query.limit,
            offset: query.offset,
        };
        let (jobs, total) = self.db.with_conn(|conn| {
            let (rows, total) = job_repo::query(conn, &filter)?;
            let mut jobs = Vec::with_capacity(rows.len());
            for row in rows {
                let log = job_repo::list_log(conn, &row.id)?;
                let artifacts = job_repo::list_artifacts(conn, &row.id)?;
                jobs.push(decode_job(row, log, artifacts)?.summary());
            }
            Ok((jobs, total))
        })?;

        Ok(JobPage {
            jobs,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    pub fn counts(&self) -> Result<StatusCounts, JobError> {
        let counts = self.db.with_conn(|conn| {
            Ok(StatusCounts {
                queued: job_repo::count_by_status(conn, JobStatus::Queued.as_str())?,
                running: job_repo::count_by_status(conn, JobStatus::Running.as_str())?,
                completed: job_repo::count_by_status(conn, JobStatus::Completed.as_str())?,
                failed: job_repo::count_by_status(conn, JobStatus::Failed.as_str())?,
            })
        })?;
        Ok(counts)
    }

    /// Atomically moves a queued job to running under `owner`.
    ///
    /// Returns `None` when the job is not queued; nothing is written then.
    pub fn claim(&self, job_id: &str, owner: &str) -> Result<Option<Job>, JobError> {
        let claimed = self.db.with_tx(|tx| -> Result<Option<Job>, JobError> {
            let now = format_timestamp(Utc::now());
            if !job_repo::claim(tx, job_id, owner, &now)? {
                if job_repo::find_by_id(tx, job_id)?.is_none() {
                    return Err(JobError::NotFound(job_id.to_string()));
                }
                return Ok(None);
            }
            self.finish_claim(tx, job_id, owner).map(Some)
        })?;

        if let Some(ref job) = claimed {
            self.publish(job);
        }
        Ok(claimed)
    }

    /// Atomically claims the oldest queued job, if any.
    pub fn claim_next(&self, owner: &str) -> Result<Option<Job>, JobError> {
        let claimed = self.db.with_tx(|tx| -> Result<Option<Job>, JobError> {
            let now = format_timestamp(Utc::now());
            match job_repo::claim_next(tx, owner, &now)? {
                Some(job_id) => self.finish_claim(tx, &job_id, owner).map(Some),
                None => Ok(None),
            }
        })?;

        if let Some(ref job) = claimed {
            self.publish(job);
        }
        Ok(claimed)
    }

    fn finish_claim(&self, tx: &Connection, job_id: &str, owner: &str) -> Result<Job, JobError> {
        let job = require_job(tx, job_id)?;
        append_log(tx, &job, LogLevel::Info, format!("Claimed by worker {}", owner))?;
        require_job(tx, job_id)
    }

    /// Renews the lease heartbeat. Returns `false` if the lease is gone.
    pub fn heartbeat(&self, lease: &Lease) -> Result<bool, JobError> {
        let now = format_timestamp(Utc::now());
        let renewed = self
            .db
            .with_conn(|conn| job_repo::heartbeat(conn, &lease.job_id, &lease.owner, &now))?;
        Ok(renewed)
    }

    /// Moves the lease of a running job from `expected_owner` to `new_owner`.
    ///
    /// Returns `None` if someone else changed the owner first.
    pub fn take_over(
        &self,
        job_id: &str,
        expected_owner: &str,
        new_owner: &str,
    ) -> Result<Option<Job>, JobError> {
        let taken = self.db.with_tx(|tx| -> Result<Option<Job>, JobError> {
            let now = format_timestamp(Utc::now());
            if !job_repo::take_over(tx, job_id, expected_owner, new_owner, &now)? {
                return Ok(None);
            }
            let job = require_job(tx, job_id)?;
            append_log(
                tx,
                &job,
                LogLevel::Warn,
                format!(
                    "Worker {} lost; execution taken over by {}",
                    expected_owner, new_owner
                ),
            )?;
            require_job(tx, job_id).map(Some)
        })?;

        if let Some(ref job) = taken {
            log::warn!("Job {} taken over by {}", job.job_id, new_owner);
            self.publish(job);
        }
        Ok(taken)
    }

    /// Running jobs whose lease was not renewed within `older_than`.
    pub fn expired_leases(&self, older_than: Duration) -> Result<Vec<Job>, JobError> {
        let cutoff = format_timestamp(Utc::now() - older_than);
        let jobs = self.db.with_conn(|conn| {
            let rows = job_repo::find_expired(conn, &cutoff)?;
            let mut jobs = Vec::with_capacity(rows.len());
            for row in rows {
                let log = job_repo::list_log(conn, &row.id)?;
                let artifacts = job_repo::list_artifacts(conn, &row.id)?;
                jobs.push(decode_job(row, log, artifacts)?);
            }
            Ok(jobs)
        })?;
        Ok(jobs)
    }

    /// Flags a job for cooperative cancellation at its next stage boundary.
    pub fn request_cancel(&self, job_id: &str) -> Result<Job, JobError> {
        self.update(job_id, |job| {
            if !job.cancel_requested {
                job.cancel_requested = true;
                job.push_log(LogLevel::Warn, "Cancellation requested");
            }
            Ok(())
        })
        .map_err(|e| match e {
            JobError::Terminal(id) => {
                JobError::Validation(format!("job {} has already finished", id))
            }
            other => other,
        })
    }

    /// Removes a job that is not running and retires its id for good.
    pub fn delete(&self, job_id: &str) -> Result<(), JobError> {
        self.db.with_tx(|tx| -> Result<(), JobError> {
            let row = job_repo::find_by_id(tx, job_id)?
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if row.status == JobStatus::Running.as_str() {
                return Err(JobError::Validation(format!(
                    "job {} is running and cannot be deleted",
                    job_id
                )));
            }
            job_repo::delete_and_retire(tx, job_id, &format_timestamp(Utc::now()))?;
            Ok(())
        })?;

        log::info!("Deleted job {}", job_id);
        Ok(())
    }
}
