//! Versioned schema for the job database.
//!
//! The `_migrations` table records each applied version. Pending versions
//! run in order, one transaction each, so a failed migration leaves the
//! schema at the previous version.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_job_log_table",
        sql: include_str!("sql/002_create_job_log.sql"),
    },
    Migration {
        version: 3,
        description: "create_job_artifacts_table",
        sql: include_str!("sql/003_create_job_artifacts.sql"),
    },
    Migration {
        version: 4,
        description: "create_retired_job_ids_table",
        sql: include_str!("sql/004_create_retired_job_ids.sql"),
    },
];

impl Migration {
    /// Applies this migration and records it, atomically.
    fn apply(&self, conn: &Connection) -> Result<(), DatabaseError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(self.sql)
            .map_err(|e| DatabaseError::Migration {
                version: self.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![self.version, self.description],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Highest recorded schema version, creating the tracking table if needed.
fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let version = conn.query_row("SELECT IFNULL(MAX(version), 0) FROM _migrations", [], |r| {
        r.get(0)
    })?;
    Ok(version)
}

/// Brings the schema up to the latest version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    let from = schema_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        log::debug!("Schema is current at v{}", from);
        return Ok(());
    }

    for migration in pending {
        log::info!("Migrating schema to v{} ({})", migration.version, migration.description);
        migration.apply(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks whether `table` has a column named `column`.
    fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
        let hits: u32 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            rusqlite::params![table, column],
            |r| r.get(0),
        )?;
        Ok(hits > 0)
    }

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_fresh_db_reaches_latest_version() {
        let conn = migrated();
        let latest = MIGRATIONS.last().map(|m| m.version).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), latest);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_column_exists_check() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE test_tbl (id TEXT, name TEXT);")
            .unwrap();

        assert!(column_exists(&conn, "test_tbl", "id").unwrap());
        assert!(!column_exists(&conn, "test_tbl", "missing").unwrap());
        assert!(!column_exists(&conn, "no_such_table", "id").unwrap());
    }

    #[test]
    fn test_jobs_table_is_created_with_lease_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        for column in [
            "claimed_by",
            "heartbeat_at",
            "completed_stages",
            "recoveries",
            "cancel_requested",
        ] {
            assert!(column_exists(&conn, "jobs", column).unwrap(), "{}", column);
        }
    }

    #[test]
    fn test_log_rows_cascade_with_job() {
        let conn = migrated();
        conn.execute_batch(
            "INSERT INTO jobs (id, case_id, user_id, upload_ids, video_paths, options, created_at, updated_at)
             VALUES ('j1', 'c', 'u', '[]', '[]', '{}', 'now', 'now');
             INSERT INTO job_log (job_id, seq, logged_at, level, message) VALUES ('j1', 0, 'now', 'info', 'hi');
             DELETE FROM jobs WHERE id = 'j1';",
        )
        .unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM job_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
