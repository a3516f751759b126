//! Stage types for the jobline orchestrator.
//!
//! This module defines the [`StageHandler`] capability that external
//! collaborators implement, the context a handler receives, and the types
//! the runner uses to classify and record what a stage did.

use crate::job::{JobId, JobInputs};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// The status of a stage, as recorded in a job and reported in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The handler is executing.
    Running,
    /// The handler produced a result.
    Complete,
    /// The handler failed (degraded or fatal, depending on policy).
    Error,
    /// Preconditions were not met; the handler was not invoked.
    Skipped,
}

impl StageStatus {
    /// Returns true once the stage is no longer running.
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// How the runner reacts when a stage's handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failure terminates the job in `Error`.
    Fatal,
    /// A failure is recorded as a degraded result and the job continues.
    SoftFail,
}

/// What a handler hands back on success.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOutput {
    /// The result payload. Opaque to the orchestrator.
    pub payload: JsonValue,
    /// Human-readable summary forwarded in the `complete` event.
    pub detail: Option<String>,
}

impl StageOutput {
    /// Wraps a payload with no detail text.
    pub fn new(payload: JsonValue) -> Self {
        Self {
            payload,
            detail: None,
        }
    }

    /// Sets the summary forwarded to observers.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<JsonValue> for StageOutput {
    fn from(payload: JsonValue) -> Self {
        Self::new(payload)
    }
}

/// The classified outcome of one stage execution.
///
/// This is the single table the runner's error-isolation policy consumes;
/// handlers never decide whether their own failure is fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The handler succeeded.
    Ok(StageOutput),
    /// A soft-fail stage failed; the job continues.
    Degraded(String),
    /// A fatal stage failed; the job stops.
    Fatal(String),
    /// The handler was not invoked.
    Skipped(String),
}

impl StageOutcome {
    /// Classifies a handler result under the given failure policy.
    pub fn classify(policy: FailurePolicy, result: Result<StageOutput>) -> Self {
        match (result, policy) {
            (Ok(output), _) => Self::Ok(output),
            (Err(e), FailurePolicy::SoftFail) => Self::Degraded(detail_of(&e)),
            (Err(e), FailurePolicy::Fatal) => Self::Fatal(detail_of(&e)),
        }
    }

    /// The status reported for this outcome.
    pub fn status(&self) -> StageStatus {
        match self {
            Self::Ok(_) => StageStatus::Complete,
            Self::Degraded(_) | Self::Fatal(_) => StageStatus::Error,
            Self::Skipped(_) => StageStatus::Skipped,
        }
    }

    /// Returns true if this outcome halts the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

fn detail_of(error: &crate::JoblineError) -> String {
    match error {
        crate::JoblineError::StageExecution(message) => message.clone(),
        other => other.to_string(),
    }
}

/// The last-known result of a stage for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Current status of the stage.
    pub status: StageStatus,
    /// The handler's payload; `null` for degraded, skipped or running stages.
    pub payload: JsonValue,
    /// Summary or failure detail.
    pub detail: Option<String>,
    /// When the stage was entered.
    pub started_at: DateTime<Utc>,
    /// When the stage finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageResult {
    /// Creates a result for a stage that just started.
    pub fn running() -> Self {
        Self {
            status: StageStatus::Running,
            payload: JsonValue::Null,
            detail: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Applies a classified outcome.
    pub fn finish(&mut self, outcome: &StageOutcome) {
        self.status = outcome.status();
        self.completed_at = Some(Utc::now());
        match outcome {
            StageOutcome::Ok(output) => {
                self.payload = output.payload.clone();
                self.detail = output.detail.clone();
            }
            StageOutcome::Degraded(detail)
            | StageOutcome::Fatal(detail)
            | StageOutcome::Skipped(detail) => {
                self.payload = JsonValue::Null;
                self.detail = Some(detail.clone());
            }
        }
    }

    /// Returns true if downstream stages can consume the payload.
    pub fn is_available(&self) -> bool {
        self.status == StageStatus::Complete && !self.payload.is_null()
    }
}

/// Context provided to a handler for one stage execution.
///
/// The context is a snapshot: it is built before the handler runs and is not
/// updated while the handler executes.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The job being executed.
    pub job_id: JobId,
    /// Name of the current stage.
    pub stage_name: String,
    /// 1-based position of the current stage.
    pub ordinal: u32,
    /// The inputs captured when the job was created.
    pub inputs: Arc<JobInputs>,
    /// Creation options with any confirm-time overrides applied.
    pub options: Map<String, JsonValue>,
    /// The artifact supplied through submit-input, if any.
    pub submitted: Option<JsonValue>,
    /// Results of the stages that already ran.
    pub upstream: HashMap<String, StageResult>,
}

impl StageContext {
    /// Returns an upstream stage's payload if that stage completed with one.
    ///
    /// Degraded, skipped and missing stages all read as `None`.
    pub fn upstream(&self, stage: &str) -> Option<&JsonValue> {
        self.upstream
            .get(stage)
            .filter(|r| r.is_available())
            .map(|r| &r.payload)
    }

    /// Gets an option by key.
    pub fn option(&self, key: &str) -> Option<&JsonValue> {
        self.options.get(key)
    }

    /// Reads a boolean toggle, defaulting to `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// The job's topic.
    pub fn topic(&self) -> &str {
        &self.inputs.topic
    }
}

/// The capability an external collaborator supplies for one stage.
///
/// Handlers may block on network or subprocess work; they run on the job's
/// own task and never while any orchestrator lock is held.
///
/// # Examples
///
/// ```
/// use jobline::{Result, StageContext, StageHandler, StageOutput};
/// use async_trait::async_trait;
/// use serde_json::json;
///
/// #[derive(Debug)]
/// struct Draft;
///
/// #[async_trait]
/// impl StageHandler for Draft {
///     async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
///         Ok(StageOutput::new(json!({ "title": ctx.topic() })).with_detail("draft ready"))
///     }
/// }
/// ```
#[async_trait]
pub trait StageHandler: Debug + Send + Sync {
    /// Performs the stage's work.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput>;

    /// Returns a reason to skip this stage without invoking [`execute`].
    ///
    /// The default never skips.
    ///
    /// [`execute`]: StageHandler::execute
    fn skip_reason(&self, _ctx: &StageContext) -> Option<String> {
        None
    }
}
