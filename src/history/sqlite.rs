//! SQLite-backed job history.
//!
//! This module provides [`SqliteHistory`], a persistent implementation of
//! [`JobHistory`] backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{HistoryEntry, JobHistory};
use crate::job::JobId;
use crate::state::JobState;
use crate::{JoblineError, Result};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const CREATE_JOB_HISTORY_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS job_history (
        job_id TEXT NOT NULL PRIMARY KEY,
        topic TEXT NOT NULL,
        platforms_json TEXT NOT NULL,
        state TEXT NOT NULL,
        results_json TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    )
"#;

const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

const CREATE_CREATED_AT_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_job_history_created_at
    ON job_history (created_at)
"#;

const SELECT_COLUMNS: &str =
    "SELECT job_id, topic, platforms_json, state, results_json, error, created_at, recorded_at FROM job_history";

/// A SQLite-backed implementation of [`JobHistory`].
///
/// The connection sits behind a `Mutex` and every query runs on
/// `spawn_blocking`, so the store is safe to share across tasks.
///
/// # Example
///
/// ```rust,ignore
/// use jobline::SqliteHistory;
///
/// let history = SqliteHistory::open("jobs.db").await?;
/// let recent = history.list_recent(20).await?;
/// ```
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    /// Opens (or creates) a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::History`] if the database cannot be opened or
    /// migrated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
            .map_err(|e| JoblineError::History(format!("failed to open database: {e}")))?;
        Self::from_connection(conn).await
    }

    /// Opens a throwaway in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
            .map_err(|e| JoblineError::History(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let history = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        history.run_migrations().await?;
        Ok(history)
    }

    async fn run_migrations(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_JOB_HISTORY_TABLE, [])?;
                conn.execute(CREATE_CREATED_AT_INDEX, [])?;
                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
        .map_err(|e| JoblineError::History(format!("migration failed: {e}")))
    }
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory").finish_non_exhaustive()
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let job_id: String = row.get(0)?;
    let platforms_json: String = row.get(2)?;
    let state: String = row.get(3)?;
    let results_json: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let recorded_at: String = row.get(7)?;

    Ok(HistoryEntry {
        job_id: JobId::from(job_id),
        topic: row.get(1)?,
        platforms: serde_json::from_str(&platforms_json).map_err(conversion_error)?,
        state: state.parse::<JobState>().map_err(conversion_error)?,
        results: serde_json::from_str(&results_json).map_err(conversion_error)?,
        error: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(conversion_error)?
            .with_timezone(&Utc),
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(conversion_error)?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl JobHistory for SqliteHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let job_id = entry.job_id.to_string();
        let topic = entry.topic.clone();
        let platforms_json = serde_json::to_string(&entry.platforms)?;
        let state = entry.state.as_str();
        let results_json = serde_json::to_string(&entry.results)?;
        let error = entry.error.clone();
        let created_at = timestamp(&entry.created_at);
        let recorded_at = timestamp(&entry.recorded_at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO job_history (job_id, topic, platforms_json, state, results_json, error, created_at, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![job_id, topic, platforms_json, state, results_json, error, created_at, recorded_at],
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
        .map_err(|e| JoblineError::History(format!("insert failed: {e}")))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = Arc::clone(&self.conn);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY created_at DESC, job_id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], entry_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
        .map_err(|e| JoblineError::History(format!("query failed: {e}")))
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<HistoryEntry>> {
        let conn = Arc::clone(&self.conn);
        let job_id = job_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE job_id = ?1"),
                params![job_id],
                entry_from_row,
            )
            .optional()
        })
        .await
        .map_err(|e| JoblineError::History(format!("spawn_blocking failed: {e}")))?
        .map_err(|e| JoblineError::History(format!("query failed: {e}")))
    }
}
