//! Job repository: SQL for the `jobs`, `job_log`, `job_artifacts` and
//! `retired_job_ids` tables.
//!
//! Functions take a `&Connection` so callers can run several of them inside
//! one transaction (a `Transaction` derefs to a `Connection`). Rows are raw
//! strings here; decoding into typed values happens in the job store.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub case_id: String,
    pub user_id: String,
    /// JSON array of strings.
    pub upload_ids: String,
    /// JSON array of strings.
    pub video_paths: String,
    /// JSON object.
    pub options: String,
    pub status: String,
    pub progress: f64,
    pub version: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<String>,
    pub completed_stages: u32,
    pub recoveries: u32,
    pub cancel_requested: bool,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            case_id: row.get("case_id")?,
            user_id: row.get("user_id")?,
            upload_ids: row.get("upload_ids")?,
            video_paths: row.get("video_paths")?,
            options: row.get("options")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            version: row.get("version")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            claimed_by: row.get("claimed_by")?,
            heartbeat_at: row.get("heartbeat_at")?,
            completed_stages: row.get("completed_stages")?,
            recoveries: row.get("recoveries")?,
            cancel_requested: row.get("cancel_requested")?,
        })
    }
}

/// A raw `job_log` row.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub seq: i64,
    pub logged_at: String,
    pub level: String,
    pub message: String,
}

/// A raw `job_artifacts` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRow {
    pub seq: i64,
    pub name: String,
    pub location: String,
    pub stage: String,
    pub produced_at: String,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub case_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, case_id, user_id, upload_ids, video_paths, options, status,
         progress, version, error, created_at, updated_at, completed_at, claimed_by,
         heartbeat_at, completed_stages, recoveries, cancel_requested)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            job.id,
            job.case_id,
            job.user_id,
            job.upload_ids,
            job.video_paths,
            job.options,
            job.status,
            job.progress,
            job.version,
            job.error,
            job.created_at,
            job.updated_at,
            job.completed_at,
            job.claimed_by,
            job.heartbeat_at,
            job.completed_stages,
            job.recoveries,
            job.cancel_requested,
        ],
    )?;
    Ok(())
}

/// Writes the mutable columns of a job if its stored version still equals
/// `expected_version`. The stored version becomes `job.version`.
///
/// Returns `false` when the version check failed and nothing was written.
pub fn update_versioned(
    conn: &Connection,
    job: &JobRow,
    expected_version: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status=?2, progress=?3, version=?4, error=?5, updated_at=?6,
         completed_at=?7, completed_stages=?8, cancel_requested=?9
         WHERE id=?1 AND version=?10",
        params![
            job.id,
            job.status,
            job.progress,
            job.version,
            job.error,
            job.updated_at,
            job.completed_at,
            job.completed_stages,
            job.cancel_requested,
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.clone()));
    }
    if let Some(ref case_id) = filter.case_id {
        conditions.push(format!("case_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(case_id.clone()));
    }
    if let Some(ref user_id) = filter.user_id {
        conditions.push(format!("user_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(user_id.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Counts jobs with the given status.
pub fn count_by_status(conn: &Connection, status: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Compare-and-set `queued -> running` for one job, recording the owner.
///
/// Returns `false` if the job was not queued (already claimed, finished or
/// missing).
pub fn claim(conn: &Connection, id: &str, owner: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'running', claimed_by = ?2, heartbeat_at = ?3,
         updated_at = ?3, version = version + 1
         WHERE id = ?1 AND status = 'queued'",
        params![id, owner, now],
    )?;
    Ok(changed == 1)
}

/// Claims the oldest queued job, returning its id.
pub fn claim_next(
    conn: &Connection,
    owner: &str,
    now: &str,
) -> Result<Option<String>, DatabaseError> {
    let id = conn
        .query_row(
            "UPDATE jobs SET status = 'running', claimed_by = ?1, heartbeat_at = ?2,
             updated_at = ?2, version = version + 1
             WHERE id = (SELECT id FROM jobs WHERE status = 'queued'
                         ORDER BY created_at, rowid LIMIT 1)
               AND status = 'queued'
             RETURNING id",
            params![owner, now],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

/// Renews the heartbeat of a running job if `owner` still holds it.
///
/// Heartbeats do not bump the version: they are lease bookkeeping, not a
/// change to the job record callers observe.
pub fn heartbeat(conn: &Connection, id: &str, owner: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET heartbeat_at = ?3
         WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
        params![id, owner, now],
    )?;
    Ok(changed == 1)
}

/// Compare-and-set on the owner of a running job.
pub fn take_over(
    conn: &Connection,
    id: &str,
    expected_owner: &str,
    new_owner: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET claimed_by = ?3, heartbeat_at = ?4, updated_at = ?4,
         recoveries = recoveries + 1, version = version + 1
         WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
        params![id, expected_owner, new_owner, now],
    )?;
    Ok(changed == 1)
}

/// Running jobs whose heartbeat is older than `older_than` (or missing).
pub fn find_expired(conn: &Connection, older_than: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE status = 'running'
         AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
         ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![older_than], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Appends a log row.
pub fn insert_log(conn: &Connection, job_id: &str, row: &LogRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_log (job_id, seq, logged_at, level, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, row.seq, row.logged_at, row.level, row.message],
    )?;
    Ok(())
}

/// All log rows of a job in append order.
pub fn list_log(conn: &Connection, job_id: &str) -> Result<Vec<LogRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT seq, logged_at, level, message FROM job_log WHERE job_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok(LogRow {
                seq: r.get(0)?,
                logged_at: r.get(1)?,
                level: r.get(2)?,
                message: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Appends an artifact row.
pub fn insert_artifact(
    conn: &Connection,
    job_id: &str,
    row: &ArtifactRow,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_artifacts (job_id, seq, name, location, stage, produced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![job_id, row.seq, row.name, row.location, row.stage, row.produced_at],
    )?;
    Ok(())
}

/// All artifact rows of a job in registration order.
pub fn list_artifacts(conn: &Connection, job_id: &str) -> Result<Vec<ArtifactRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT seq, name, location, stage, produced_at FROM job_artifacts
         WHERE job_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok(ArtifactRow {
                seq: r.get(0)?,
                name: r.get(1)?,
                location: r.get(2)?,
                stage: r.get(3)?,
                produced_at: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes a job and (by cascade) its log and artifacts, retiring its id.
pub fn delete_and_retire(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    if changed == 1 {
        conn.execute(
            "INSERT OR IGNORE INTO retired_job_ids (id, retired_at) VALUES (?1, ?2)",
            params![id, now],
        )?;
    }
    Ok(changed == 1)
}

/// Whether an id was used by a job that has since been deleted.
pub fn is_retired(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM retired_job_ids WHERE id = ?1",
            params![id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}
