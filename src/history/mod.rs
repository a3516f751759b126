//! Job history for the jobline orchestrator.
//!
//! The job store forgets a job once the retention sweeper evicts it. A
//! [`JobHistory`] keeps a durable summary of every job instead: the runner
//! records an entry when the job starts and again when it terminates.
//!
//! - [`MemoryHistory`]: in-process history for tests and single-run tools
//! - `SqliteHistory`: persistent history (requires the `sqlite` feature)
//!
//! History is best-effort. A failing backend is logged and never changes the
//! outcome of a job.
//!
//! # Example
//!
//! ```
//! use jobline::{HistoryEntry, JobHistory, JobId, JobState, MemoryHistory};
//!
//! # async fn example() -> jobline::Result<()> {
//! let history = MemoryHistory::new();
//! let entry = HistoryEntry::new(JobId::from("a1b2c3d4e5f6"), "desk lamp", JobState::Running);
//! history.record(&entry).await?;
//!
//! let recent = history.list_recent(20).await?;
//! assert_eq!(recent.len(), 1);
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryHistory;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHistory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::job::{Job, JobId, JobRecord};
use crate::state::JobState;
use crate::Result;

/// Default page size for history listings.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// A durable summary of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The job's id.
    pub job_id: JobId,
    /// The job's topic.
    pub topic: String,
    /// Target platforms.
    pub platforms: Vec<String>,
    /// State at the time of recording.
    pub state: JobState,
    /// Payloads of the stages that completed, keyed by stage name.
    pub results: BTreeMap<String, JsonValue>,
    /// Fatal error detail, if the job failed.
    pub error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When this entry was written.
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Creates an entry with no results.
    pub fn new(job_id: JobId, topic: impl Into<String>, state: JobState) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            topic: topic.into(),
            platforms: Vec::new(),
            state,
            results: BTreeMap::new(),
            error: None,
            created_at: now,
            recorded_at: now,
        }
    }

    /// Summarizes a job from its locked record.
    pub fn snapshot(job: &Job, record: &JobRecord) -> Self {
        let results = record
            .stage_results
            .iter()
            .filter(|(_, result)| result.is_available())
            .map(|(name, result)| (name.clone(), result.payload.clone()))
            .collect();

        Self {
            job_id: job.id().clone(),
            topic: job.inputs().topic.clone(),
            platforms: job.inputs().platforms.clone(),
            state: record.state,
            results,
            error: record.error.clone(),
            created_at: job.created_at(),
            recorded_at: Utc::now(),
        }
    }
}

/// A sink for job summaries.
///
/// # Object Safety
///
/// This trait is object-safe; the orchestrator holds it as
/// `Arc<dyn JobHistory>`.
#[async_trait]
pub trait JobHistory: Debug + Send + Sync {
    /// Inserts or replaces the entry for `entry.job_id`.
    async fn record(&self, entry: &HistoryEntry) -> Result<()>;

    /// Returns up to `limit` entries, newest job first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Returns the entry for one job.
    async fn get(&self, job_id: &JobId) -> Result<Option<HistoryEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInputs;
    use crate::stage::{StageOutcome, StageOutput, StageResult};
    use crate::state::PipelineShape;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_keeps_only_available_results() {
        let job = Job::new(
            JobId::from("h1"),
            JobInputs::new("blender").with_platforms(["youtube"]),
            PipelineShape::NonInteractive,
            Utc::now(),
        );

        let mut record = job.write().await;
        let mut done = StageResult::running();
        done.finish(&StageOutcome::Ok(StageOutput::new(json!({"title": "t"}))));
        let mut degraded = StageResult::running();
        degraded.finish(&StageOutcome::Degraded("tts offline".into()));
        record.stage_results.insert("content".into(), done);
        record.stage_results.insert("tts".into(), degraded);

        let entry = HistoryEntry::snapshot(&job, &record);
        assert_eq!(entry.topic, "blender");
        assert_eq!(entry.platforms, vec!["youtube".to_string()]);
        assert_eq!(entry.state, JobState::Pending);
        assert_eq!(entry.results.len(), 1);
        assert_eq!(entry.results["content"], json!({"title": "t"}));
        assert_eq!(entry.created_at, job.created_at());
    }
}
