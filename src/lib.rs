//! # Jobline
//!
//! A job orchestration core: runs a named, ordered sequence of stages per
//! client-submitted job, isolates stage failures, pauses at an optional
//! confirmation checkpoint, streams live progress to observers, and reclaims
//! finished jobs after a retention window.
//!
//! The business work of each stage (scraping, text generation, encoding,
//! uploads) lives outside this crate behind the [`StageHandler`] trait.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use jobline::{JobInputs, Orchestrator, OrchestratorConfig, Pipeline};
//! # use jobline::{Result, StageContext, StageHandler, StageOutput};
//! # use async_trait::async_trait;
//! # #[derive(Debug)] struct Analyze;
//! # #[async_trait] impl StageHandler for Analyze {
//! #     async fn execute(&self, _: &StageContext) -> Result<StageOutput> { Ok(StageOutput::default()) }
//! # }
//! # #[derive(Debug)] struct Upload;
//! # #[async_trait] impl StageHandler for Upload {
//! #     async fn execute(&self, _: &StageContext) -> Result<StageOutput> { Ok(StageOutput::default()) }
//! # }
//!
//! # async fn example() -> jobline::Result<()> {
//! let pipeline = Pipeline::builder()
//!     .stage("analyze", Analyze)
//!     .soft_fail_stage("upload", Upload)
//!     .checkpoint("analyze")
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(pipeline, OrchestratorConfig::default());
//! let _sweeper = orchestrator.spawn_sweeper();
//!
//! let ticket = orchestrator
//!     .create_job(JobInputs::new("espresso grinder").with_confirmation(true))
//!     .await?;
//!
//! let mut feed = orchestrator.stream(&ticket.job_id).await?;
//! while let Some(event) = feed.next().await {
//!     println!("{}", jobline::sse_frame(&event)?);
//!     if event.is_checkpoint_pause() {
//!         orchestrator.confirm(&ticket.job_id, None).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! Non-interactive pipelines run `Pending -> Running -> Complete | Error`.
//! Pipelines with a checkpoint run `Idle -> [AwaitingInput ->] Analyzing ->
//! [AwaitingConfirm ->] Executing -> Complete | Error`. See [`state`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
mod runner;
pub mod stage;
pub mod state;
pub mod status;
pub mod store;
pub mod stream;
pub mod sweeper;

pub use config::OrchestratorConfig;
pub use error::{ErrorKind, JoblineError, Result};
pub use event::{EventQueue, ProgressEvent, QueueRecv};
pub use history::{HistoryEntry, JobHistory, MemoryHistory};
pub use job::{Job, JobId, JobInputs, JobRecord};
pub use orchestrator::{JobTicket, Orchestrator};
pub use pipeline::{Pipeline, PipelineBuilder, StageDescriptor, StageInfo};
pub use stage::{
    FailurePolicy, StageContext, StageHandler, StageOutcome, StageOutput, StageResult, StageStatus,
};
pub use state::{JobState, PipelineShape};
pub use status::{JobStatus, StageStatusEntry};
pub use store::JobStore;
pub use stream::{sse_frame, EventStream};
pub use sweeper::{RetentionSweeper, SweeperHandle};

#[cfg(feature = "sqlite")]
pub use history::SqliteHistory;

/// The crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
