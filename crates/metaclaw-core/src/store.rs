//! Embedded relational state store.
//!
//! One `SQLite` database per state directory with two tables: `capsules`
//! (upserted, newest path wins) and `runs` (insert-once rows whose
//! status/container/exit/error/ended fields mutate through two update
//! statements). The schema is created idempotently on open; concurrent
//! operator invocations rely on `SQLite`'s own locking.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Container started (or attached run in flight).
    Running,
    /// Attached or reconciled exit with code 0.
    Succeeded,
    /// Non-zero exit or start failure.
    Failed,
    /// Failed under `debug` lifecycle; container preserved.
    FailedPaused,
}

impl RunStatus {
    /// Stable string form used in the store and JSON output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::FailedPaused => "failed_paused",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "failed_paused" => Ok(Self::FailedPaused),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One persisted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Run identifier (`<yyyymmdd>T<HHMMSS>Z<9-digit ns>`).
    pub run_id: String,
    /// Capsule the run executed.
    pub capsule_id: String,
    /// Capsule directory at run time.
    pub capsule_path: String,
    /// Current status.
    pub status: RunStatus,
    /// Lifecycle the clawfile declared.
    pub lifecycle: String,
    /// Backend the run resolved to.
    pub runtime_target: String,
    /// Container id or name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    /// Exit code once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// RFC3339 start timestamp.
    pub started_at: String,
    /// RFC3339 end timestamp once terminal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ended_at: String,
    /// Last error message, when any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

/// Errors produced by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state directory could not be created.
    #[error("create state dir {path}: {source}")]
    CreateDir {
        /// Directory that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Underlying database failure.
    #[error("state store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No run row with the given id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A stored status string no longer parses (schema drift).
    #[error("corrupt run row {run_id}: {reason}")]
    CorruptRow {
        /// Offending run id.
        run_id: String,
        /// What failed to decode.
        reason: String,
    },
}

/// Handle over the embedded store; opened per CLI invocation.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the store under `state_dir`.
    ///
    /// # Errors
    ///
    /// Directory creation or database errors.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(state_dir).map_err(|source| StoreError::CreateDir {
            path: state_dir.display().to_string(),
            source,
        })?;
        let path = state_dir.join("state.db");
        let conn = Connection::open(&path)?;
        let store = Self { conn, path };
        store.init_schema()?;
        Ok(store)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS capsules (
                capsule_id TEXT PRIMARY KEY,
                capsule_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                capsule_id TEXT NOT NULL,
                capsule_path TEXT NOT NULL,
                status TEXT NOT NULL,
                lifecycle TEXT NOT NULL,
                runtime_target TEXT NOT NULL,
                container_id TEXT,
                exit_code INTEGER,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                last_error TEXT,
                FOREIGN KEY(capsule_id) REFERENCES capsules(capsule_id)
            );",
        )?;
        Ok(())
    }

    /// Upserts a capsule row; an existing row keeps its `created_at` and
    /// takes the newest path.
    ///
    /// # Errors
    ///
    /// Database errors.
    pub fn upsert_capsule(&self, capsule_id: &str, capsule_path: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO capsules (capsule_id, capsule_path, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(capsule_id) DO UPDATE SET capsule_path = excluded.capsule_path",
            params![capsule_id, capsule_path, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Inserts a new run row.
    ///
    /// # Errors
    ///
    /// Database errors (including duplicate run ids).
    pub fn insert_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO runs (run_id, capsule_id, capsule_path, status, lifecycle,
                               runtime_target, container_id, exit_code, started_at,
                               ended_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.run_id,
                record.capsule_id,
                record.capsule_path,
                record.status.as_str(),
                record.lifecycle,
                record.runtime_target,
                nullable(&record.container_id),
                record.exit_code,
                record.started_at,
                nullable(&record.ended_at),
                nullable(&record.last_error),
            ],
        )?;
        Ok(())
    }

    /// Updates status/container/error without marking the run terminal.
    ///
    /// # Errors
    ///
    /// Database errors.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        container_id: &str,
        last_error: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE runs SET status = ?1, container_id = ?2, last_error = ?3 WHERE run_id = ?4",
            params![status.as_str(), nullable(container_id), nullable(last_error), run_id],
        )?;
        Ok(())
    }

    /// Marks a run terminal: status, exit code, ended timestamp, error.
    ///
    /// # Errors
    ///
    /// Database errors.
    pub fn update_run_completion(
        &self,
        run_id: &str,
        status: RunStatus,
        container_id: &str,
        exit_code: Option<i32>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE runs SET status = ?1, container_id = ?2, exit_code = ?3,
                             ended_at = ?4, last_error = ?5
             WHERE run_id = ?6",
            params![
                status.as_str(),
                nullable(container_id),
                exit_code,
                now_rfc3339(),
                nullable(last_error),
                run_id
            ],
        )?;
        Ok(())
    }

    /// Fetches a run by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`] when absent; database errors otherwise.
    pub fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, capsule_id, capsule_path, status, lifecycle, runtime_target,
                        COALESCE(container_id, ''), exit_code, started_at,
                        COALESCE(ended_at, ''), COALESCE(last_error, '')
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_record,
            )
            .optional()?;
        row.ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?
    }

    /// Lists runs, newest first.
    ///
    /// # Errors
    ///
    /// Database errors.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let limit = if limit == 0 { 100 } else { limit };
        let mut stmt = self.conn.prepare(
            "SELECT run_id, capsule_id, capsule_path, status, lifecycle, runtime_target,
                    COALESCE(container_id, ''), exit_code, started_at,
                    COALESCE(ended_at, ''), COALESCE(last_error, '')
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

type RecordResult = Result<RunRecord, StoreError>;

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordResult> {
    let run_id: String = row.get(0)?;
    let status_text: String = row.get(3)?;
    let status = match status_text.parse::<RunStatus>() {
        Ok(status) => status,
        Err(reason) => {
            return Ok(Err(StoreError::CorruptRow { run_id, reason }));
        }
    };
    Ok(Ok(RunRecord {
        run_id,
        capsule_id: row.get(1)?,
        capsule_path: row.get(2)?,
        status,
        lifecycle: row.get(4)?,
        runtime_target: row.get(5)?,
        container_id: row.get(6)?,
        exit_code: row.get(7)?,
        started_at: row.get(8)?,
        ended_at: row.get(9)?,
        last_error: row.get(10)?,
    }))
}

fn nullable(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// Current UTC time in RFC3339 with nanoseconds.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            capsule_id: "deadbeefdeadbeef".to_string(),
            capsule_path: "/tmp/cap_deadbeefdeadbeef".to_string(),
            status: RunStatus::Running,
            lifecycle: "ephemeral".to_string(),
            runtime_target: "podman".to_string(),
            container_id: String::new(),
            exit_code: None,
            started_at: now_rfc3339(),
            ended_at: String::new(),
            last_error: String::new(),
        }
    }

    #[test]
    fn schema_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        drop(Store::open(dir.path()).unwrap());
        drop(Store::open(dir.path()).unwrap());
    }

    #[test]
    fn insert_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .upsert_capsule("deadbeefdeadbeef", "/tmp/cap_deadbeefdeadbeef")
            .unwrap();
        store.insert_run(&test_record("r1")).unwrap();

        let rec = store.get_run("r1").unwrap();
        assert_eq!(rec.status, RunStatus::Running);
        assert!(rec.container_id.is_empty());
        assert!(rec.exit_code.is_none());
    }

    #[test]
    fn missing_run_is_a_not_found_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_run("nope"),
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[test]
    fn completion_update_sets_terminal_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .upsert_capsule("deadbeefdeadbeef", "/tmp/cap_deadbeefdeadbeef")
            .unwrap();
        store.insert_run(&test_record("r1")).unwrap();
        store
            .update_run_completion("r1", RunStatus::Failed, "ctr-9", Some(17), "boom")
            .unwrap();

        let rec = store.get_run("r1").unwrap();
        assert_eq!(rec.status, RunStatus::Failed);
        assert_eq!(rec.container_id, "ctr-9");
        assert_eq!(rec.exit_code, Some(17));
        assert_eq!(rec.last_error, "boom");
        assert!(!rec.ended_at.is_empty());
    }

    #[test]
    fn capsule_upsert_keeps_newest_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_capsule("cap1", "/old").unwrap();
        store.upsert_capsule("cap1", "/new").unwrap();

        let path: String = store
            .conn
            .query_row(
                "SELECT capsule_path FROM capsules WHERE capsule_id = 'cap1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(path, "/new");
    }

    #[test]
    fn list_runs_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .upsert_capsule("deadbeefdeadbeef", "/tmp/cap_deadbeefdeadbeef")
            .unwrap();
        let mut older = test_record("r-old");
        older.started_at = "2026-01-01T00:00:00.000000000Z".to_string();
        let mut newer = test_record("r-new");
        newer.started_at = "2026-02-01T00:00:00.000000000Z".to_string();
        store.insert_run(&older).unwrap();
        store.insert_run(&newer).unwrap();

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs[0].run_id, "r-new");
        assert_eq!(runs[1].run_id, "r-old");
    }

    #[test]
    fn run_status_parses_all_variants() {
        for status in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::FailedPaused,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
