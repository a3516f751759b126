//! Error types for the jobline orchestrator.
//!
//! Every failure surfaced by the crate is a [`JoblineError`]. Callers that
//! need to react to the *class* of a failure (for example to map it onto an
//! HTTP status) should match on [`JoblineError::kind`], which folds the
//! variants onto the stable [`ErrorKind`] taxonomy.

use serde::Serialize;
use thiserror::Error;

use crate::job::JobId;
use crate::state::JobState;

/// The stable error taxonomy exposed to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown job id or missing artifact.
    NotFound,
    /// Operation invalid for the job's current state.
    StateConflict,
    /// Missing or malformed required input.
    Validation,
    /// A fatal-tier stage failed and terminated the job.
    StageFatal,
    /// A soft-fail-tier stage failed; the job continued.
    StageDegraded,
    /// Delivery to a remote observer failed.
    Transport,
    /// A bounded wait elapsed before the awaited condition held.
    Timeout,
    /// Configuration, pipeline construction or storage failure.
    Internal,
}

/// The main error type for jobline operations.
///
/// This enum uses `#[non_exhaustive]` so new variants can be added without
/// breaking downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JoblineError {
    /// No job with this id exists (never created, or already swept).
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The job exists but has not produced the requested artifact.
    #[error("Artifact not found: {key} (job {job_id})")]
    ArtifactNotFound {
        /// The job that was queried.
        job_id: JobId,
        /// The requested artifact key.
        key: String,
    },

    /// The operation is not legal in the job's current state.
    #[error("Cannot {operation} while job is {state}")]
    StateConflict {
        /// The rejected operation.
        operation: &'static str,
        /// The state the job was in.
        state: JobState,
    },

    /// A wait for a job state elapsed first.
    #[error("Timed out waiting for job {job_id}; last state {state}")]
    WaitTimeout {
        /// The job being watched.
        job_id: JobId,
        /// The last state observed.
        state: JobState,
    },

    /// A required input is missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A fatal-tier stage failed.
    #[error("Stage '{stage}' failed: {detail}")]
    StageFatal {
        /// The failing stage name.
        stage: String,
        /// The failure detail reported by the handler.
        detail: String,
    },

    /// A soft-fail-tier stage failed and was recorded as degraded.
    ///
    /// Never returned from an operation, since the job continues; the runner
    /// builds it to log the degraded stage with its [`ErrorKind`].
    #[error("Stage '{stage}' degraded: {detail}")]
    StageDegraded {
        /// The degraded stage name.
        stage: String,
        /// The failure detail reported by the handler.
        detail: String,
    },

    /// A failure raised by a stage handler before policy classification.
    #[error("Stage execution error: {0}")]
    StageExecution(String),

    /// Writing to a remote observer failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Pipeline configuration or structure is invalid.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Stage not found in the pipeline.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// Duplicate stage name in the pipeline.
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    /// Invalid orchestrator configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the job history backend.
    #[error("History error: {0}")]
    History(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically raised with `?` inside a stage handler.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JoblineError {
    /// Creates a handler failure from any displayable message.
    pub fn stage(message: impl Into<String>) -> Self {
        Self::StageExecution(message.into())
    }

    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JobNotFound(_) | Self::ArtifactNotFound { .. } => ErrorKind::NotFound,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::StageFatal { .. } => ErrorKind::StageFatal,
            Self::StageDegraded { .. } => ErrorKind::StageDegraded,
            Self::Transport(_) => ErrorKind::Transport,
            Self::WaitTimeout { .. } => ErrorKind::Timeout,
            Self::StageExecution(_)
            | Self::InvalidPipeline(_)
            | Self::StageNotFound(_)
            | Self::DuplicateStage(_)
            | Self::Config(_)
            | Self::History(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

/// A specialized `Result` type for jobline operations.
pub type Result<T> = std::result::Result<T, JoblineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_job_not_found() {
        let error = JoblineError::JobNotFound(JobId::from("abc123"));
        assert_eq!(error.to_string(), "Job not found: abc123");
    }

    #[test]
    fn test_error_display_state_conflict() {
        let error = JoblineError::StateConflict {
            operation: "confirm",
            state: JobState::Executing,
        };
        assert_eq!(error.to_string(), "Cannot confirm while job is executing");
    }

    #[test]
    fn test_error_display_stage_fatal() {
        let error = JoblineError::StageFatal {
            stage: "analyze".to_string(),
            detail: "scrape failed".to_string(),
        };
        assert_eq!(error.to_string(), "Stage 'analyze' failed: scrape failed");
    }

    #[test]
    fn test_error_display_artifact_not_found() {
        let error = JoblineError::ArtifactNotFound {
            job_id: JobId::from("j1"),
            key: "compose/html".to_string(),
        };
        assert_eq!(error.to_string(), "Artifact not found: compose/html (job j1)");
    }

    #[test]
    fn test_kind_taxonomy() {
        assert_eq!(
            JoblineError::JobNotFound(JobId::from("x")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            JoblineError::ArtifactNotFound {
                job_id: JobId::from("x"),
                key: "k".to_string()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            JoblineError::Validation("topic".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            JoblineError::Transport("broken pipe".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            JoblineError::StageDegraded {
                stage: "collect".to_string(),
                detail: "timeout".to_string()
            }
            .kind(),
            ErrorKind::StageDegraded
        );
        assert_eq!(JoblineError::stage("boom").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: JoblineError = json_error.into();
        assert!(error.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let error: JoblineError = io_error.into();
        assert!(error.to_string().contains("I/O error"));
    }

    #[test]
    fn test_wait_timeout_is_its_own_kind() {
        let error = JoblineError::WaitTimeout {
            job_id: JobId::from("j9"),
            state: JobState::AwaitingInput,
        };
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(
            error.to_string(),
            "Timed out waiting for job j9; last state awaiting_input"
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StateConflict).unwrap();
        assert_eq!(json, "\"state_conflict\"");
    }
}
