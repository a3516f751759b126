//! Job status snapshots.
//!
//! [`JobStatus`] is a point-in-time, serializable view of one job: its state,
//! every registered stage in order, the results available so far and the
//! fatal error if there is one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::job::{Job, JobId};
use crate::pipeline::Pipeline;
use crate::stage::StageStatus;
use crate::state::JobState;

/// Status entry for one registered stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatusEntry {
    /// 1-based position.
    pub ordinal: u32,
    /// Stable name.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// `None` until the stage has been entered.
    pub status: Option<StageStatus>,
    /// Summary or failure detail.
    pub detail: Option<String>,
    /// When the stage was entered.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageStatusEntry {
    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.status {
            None => '⏳',
            Some(StageStatus::Running) => '🔄',
            Some(StageStatus::Complete) => '✅',
            Some(StageStatus::Error) => '❌',
            Some(StageStatus::Skipped) => '⏭',
        }
    }

    fn status_label(&self) -> &'static str {
        match self.status {
            None => "pending",
            Some(StageStatus::Running) => "running",
            Some(StageStatus::Complete) => "complete",
            Some(StageStatus::Error) => "error",
            Some(StageStatus::Skipped) => "skipped",
        }
    }
}

/// A snapshot of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    /// The job's id.
    pub job_id: JobId,
    /// Current state.
    pub state: JobState,
    /// Every registered stage, in order.
    pub stages: Vec<StageStatusEntry>,
    /// Payloads of completed stages, keyed by stage name.
    pub results: BTreeMap<String, JsonValue>,
    /// Fatal error detail; present only in `Error`.
    pub error: Option<String>,
    /// The stage that failed fatally, if any.
    pub failed_stage: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job record last changed.
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    /// Captures the current status of `job`.
    pub async fn capture(job: &Job, pipeline: &Pipeline) -> Self {
        let record = job.read().await;

        let stages = pipeline
            .stages()
            .iter()
            .map(|stage| {
                let result = record.stage_results.get(stage.name());
                StageStatusEntry {
                    ordinal: stage.ordinal(),
                    name: stage.name().to_string(),
                    label: stage.label().to_string(),
                    status: result.map(|r| r.status),
                    detail: result.and_then(|r| r.detail.clone()),
                    started_at: result.map(|r| r.started_at),
                    completed_at: result.and_then(|r| r.completed_at),
                }
            })
            .collect();

        let results = record
            .stage_results
            .iter()
            .filter(|(_, r)| r.is_available())
            .map(|(name, r)| (name.clone(), r.payload.clone()))
            .collect();

        Self {
            job_id: job.id().clone(),
            state: record.state,
            stages,
            results,
            error: record.error.clone(),
            failed_stage: record.failed_stage.clone(),
            created_at: job.created_at(),
            updated_at: record.updated_at,
        }
    }

    /// Returns true once the job is `Complete` or `Error`.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Names of stages that ended in `error`.
    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == Some(StageStatus::Error))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// The stage currently running, if any.
    pub fn running_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| s.status == Some(StageStatus::Running))
            .map(|s| s.name.as_str())
    }

    /// Share of stages that have finished, as a percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.stages.is_empty() {
            return 100.0;
        }
        let finished = self
            .stages
            .iter()
            .filter(|s| s.status.is_some_and(StageStatus::is_finished))
            .count();
        (finished as f32 / self.stages.len() as f32) * 100.0
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job {} is {}:", self.job_id, self.state)?;
        writeln!(f)?;

        for stage in &self.stages {
            let time_str = stage
                .completed_at
                .or(stage.started_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "  {} {:>2}. {:<15} {:<10} {}",
                stage.status_char(),
                stage.ordinal,
                stage.label,
                stage.status_label(),
                time_str
            )?;
            if let Some(ref detail) = stage.detail {
                write!(f, "  {}", detail)?;
            }
            writeln!(f)?;
        }

        if let Some(ref error) = self.error {
            writeln!(f)?;
            writeln!(f, "Error: {}", error)?;
        }

        writeln!(f)?;
        write!(f, "Progress: {:.0}%", self.progress_percent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInputs;
    use crate::stage::{StageContext, StageHandler, StageOutcome, StageOutput, StageResult};
    use crate::Result;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
            Ok(StageOutput::default())
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::builder()
            .stage("content", Noop)
            .soft_fail_stage("collect", Noop)
            .stage("render", Noop)
            .stage("upload", Noop)
            .label("content", "Copywriting")
            .build()
            .unwrap()
    }

    async fn sample() -> JobStatus {
        let pipeline = pipeline();
        let job = Job::new(
            JobId::from("st1"),
            JobInputs::new("fan"),
            pipeline.shape(),
            Utc::now(),
        );
        {
            let mut record = job.write().await;
            job.apply_transition(&mut record, JobState::Running, "start").unwrap();
            let mut content = StageResult::running();
            content.finish(&StageOutcome::Ok(StageOutput::new(json!({"title": "Fan"})).with_detail("1 draft")));
            let mut collect = StageResult::running();
            collect.finish(&StageOutcome::Degraded("no footage".into()));
            record.stage_results.insert("content".into(), content);
            record.stage_results.insert("collect".into(), collect);
            record.stage_results.insert("render".into(), StageResult::running());
        }
        JobStatus::capture(&job, &pipeline).await
    }

    #[tokio::test]
    async fn test_capture_orders_registered_stages() {
        let status = sample().await;
        let names: Vec<_> = status.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["content", "collect", "render", "upload"]);
        assert_eq!(status.stages[0].label, "Copywriting");
        assert_eq!(status.stages[3].status, None);
        assert_eq!(status.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_results_only_available_payloads() {
        let status = sample().await;
        assert_eq!(status.results.len(), 1);
        assert_eq!(status.results["content"], json!({"title": "Fan"}));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_progress_and_queries() {
        let status = sample().await;
        assert!((status.progress_percent() - 50.0).abs() < f32::EPSILON);
        assert_eq!(status.failed_stages(), vec!["collect"]);
        assert_eq!(status.running_stage(), Some("render"));
        assert!(!status.is_terminal());
    }

    #[tokio::test]
    async fn test_display() {
        let output = sample().await.to_string();
        assert!(output.contains("Job st1 is running"));
        assert!(output.contains("Copywriting"));
        assert!(output.contains("no footage"));
        assert!(output.contains("Progress: 50%"));
    }

    #[tokio::test]
    async fn test_serializes_state_snake_case() {
        let value = serde_json::to_value(sample().await).unwrap();
        assert_eq!(value["state"], json!("running"));
        assert_eq!(value["stages"][1]["status"], json!("error"));
        assert_eq!(value["stages"][3]["status"], JsonValue::Null);
    }
}
