//! Job records.
//!
//! A [`Job`] is the shared handle for one pipeline run. It owns the job's
//! mutable [`JobRecord`], its [`EventQueue`], and the one-shot gates the
//! runner parks on while waiting for submit-input or confirm.
//!
//! The runner is the only writer of `stage_results`. `state` is written by
//! the runner and by the submit-input/confirm entry points, and always
//! through [`PipelineShape::can_transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::event::{EventQueue, ProgressEvent};
use crate::stage::StageResult;
use crate::state::{JobState, PipelineShape};
use crate::{JoblineError, Result};

/// Length of generated job ids, in hex characters.
const JOB_ID_LEN: usize = 12;

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Draws a fresh random id.
    pub fn generate() -> Self {
        let mut hex = uuid::Uuid::new_v4().simple().to_string();
        hex.truncate(JOB_ID_LEN);
        Self(hex)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Client-supplied parameters, captured once at creation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobInputs {
    /// The job's primary subject.
    pub topic: String,
    /// Destinations the job targets.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Stage-specific options such as per-destination upload toggles.
    #[serde(default)]
    pub options: Map<String, JsonValue>,
    /// Whether an interactive pipeline pauses at its checkpoint.
    #[serde(default)]
    pub confirmation_mode: bool,
}

impl JobInputs {
    /// Creates inputs for a topic with no platforms or options.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Sets the target platforms.
    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a stage option.
    pub fn with_option(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Enables or disables the confirmation checkpoint.
    pub fn with_confirmation(mut self, enabled: bool) -> Self {
        self.confirmation_mode = enabled;
        self
    }

    /// Checks that the required fields are present.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::Validation`] if the topic is blank.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(JoblineError::Validation("topic is required".to_string()));
        }
        if self.platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(JoblineError::Validation(
                "platform names must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// The mutable part of a job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Current pipeline state.
    pub state: JobState,
    /// Last-known result per stage name.
    pub stage_results: HashMap<String, StageResult>,
    /// Fatal failure detail; set only when `state` is `Error`.
    pub error: Option<String>,
    /// The stage that caused the fatal failure, if any.
    pub failed_stage: Option<String>,
    /// The artifact supplied through submit-input.
    pub submitted: Option<JsonValue>,
    /// Option overrides supplied through confirm.
    pub overrides: Map<String, JsonValue>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(state: JobState) -> Self {
        Self {
            state,
            stage_results: HashMap::new(),
            error: None,
            failed_stage: None,
            submitted: None,
            overrides: Map::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Gates {
    input: Option<oneshot::Sender<JsonValue>>,
    confirm: Option<oneshot::Sender<Map<String, JsonValue>>>,
}

/// Shared handle to one job.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    created_at: DateTime<Utc>,
    shape: PipelineShape,
    inputs: Arc<JobInputs>,
    record: RwLock<JobRecord>,
    events: EventQueue,
    state_tx: watch::Sender<JobState>,
    gates: StdMutex<Gates>,
}

impl Job {
    /// Creates a job in the shape's initial state.
    pub(crate) fn new(
        id: JobId,
        inputs: JobInputs,
        shape: PipelineShape,
        created_at: DateTime<Utc>,
    ) -> Self {
        let initial = shape.initial_state();
        let (state_tx, _) = watch::channel(initial);
        Self {
            id,
            created_at,
            shape,
            inputs: Arc::new(inputs),
            record: RwLock::new(JobRecord::new(initial)),
            events: EventQueue::new(),
            state_tx,
            gates: StdMutex::new(Gates::default()),
        }
    }

    /// The job's id.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// When the job was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The state machine shape this job follows.
    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    /// The inputs captured at creation.
    pub fn inputs(&self) -> &Arc<JobInputs> {
        &self.inputs
    }

    /// The job's event queue.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// The current state, without taking the record lock.
    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Takes a read lock on the record.
    pub async fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.record.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, JobRecord> {
        self.record.write().await
    }

    /// Applies a guarded transition to an already-locked record.
    pub(crate) fn apply_transition(
        &self,
        record: &mut JobRecord,
        to: JobState,
        operation: &'static str,
    ) -> Result<()> {
        if !self.shape.can_transition(record.state, to) {
            return Err(JoblineError::StateConflict {
                operation,
                state: record.state,
            });
        }
        debug!(job_id = %self.id, from = %record.state, to = %to, "state transition");
        record.state = to;
        record.updated_at = Utc::now();
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Locks the record and applies a guarded transition.
    pub(crate) async fn transition(&self, to: JobState, operation: &'static str) -> Result<()> {
        let mut record = self.record.write().await;
        self.apply_transition(&mut record, to, operation)
    }

    pub(crate) fn arm_input_gate(&self) -> oneshot::Receiver<JsonValue> {
        let (tx, rx) = oneshot::channel();
        self.lock_gates().input = Some(tx);
        rx
    }

    pub(crate) fn arm_confirm_gate(&self) -> oneshot::Receiver<Map<String, JsonValue>> {
        let (tx, rx) = oneshot::channel();
        self.lock_gates().confirm = Some(tx);
        rx
    }

    /// Accepts the artifact an `AwaitingInput` job is waiting for.
    pub(crate) async fn submit_input(&self, artifact: JsonValue) -> Result<JobState> {
        let mut record = self.record.write().await;
        if record.state != JobState::AwaitingInput {
            return Err(JoblineError::StateConflict {
                operation: "submit input",
                state: record.state,
            });
        }
        validate_artifact(&artifact)?;

        let gate = self
            .lock_gates()
            .input
            .take()
            .ok_or_else(|| JoblineError::StageExecution("runner is not waiting for input".into()))?;

        self.apply_transition(&mut record, JobState::Analyzing, "submit input")?;
        record.submitted = Some(artifact.clone());
        self.events.push(ProgressEvent::state_change(
            JobState::Analyzing,
            "input received, analysis started",
        ));
        if gate.send(artifact).is_err() {
            debug!(job_id = %self.id, "runner dropped the input gate before input arrived");
        }
        Ok(record.state)
    }

    /// Releases a job paused at its checkpoint.
    pub(crate) async fn confirm(&self, overrides: Map<String, JsonValue>) -> Result<JobState> {
        let mut record = self.record.write().await;
        if record.state != JobState::AwaitingConfirm {
            return Err(JoblineError::StateConflict {
                operation: "confirm",
                state: record.state,
            });
        }

        let gate = self
            .lock_gates()
            .confirm
            .take()
            .ok_or_else(|| JoblineError::StageExecution("runner is not waiting for confirmation".into()))?;

        self.apply_transition(&mut record, JobState::Executing, "confirm")?;
        for (key, value) in &overrides {
            record.overrides.insert(key.clone(), value.clone());
        }
        self.events.push(ProgressEvent::state_change(
            JobState::Executing,
            "confirmed, executing remaining stages",
        ));
        if gate.send(overrides).is_err() {
            debug!(job_id = %self.id, "runner dropped the confirm gate before confirmation");
        }
        Ok(record.state)
    }

    /// Creation options with confirm-time overrides applied.
    pub fn effective_options(&self, record: &JobRecord) -> Map<String, JsonValue> {
        let mut options = self.inputs.options.clone();
        for (key, value) in &record.overrides {
            options.insert(key.clone(), value.clone());
        }
        options
    }

    /// Drops parked gates and closes the event queue.
    pub(crate) fn release(&self) {
        let state = self.state();
        if state.is_waiting() {
            debug!(job_id = %self.id, %state, "releasing job parked at a gate");
        }
        let mut gates = self.lock_gates();
        gates.input = None;
        gates.confirm = None;
        drop(gates);
        self.events.close();
    }

    fn lock_gates(&self) -> std::sync::MutexGuard<'_, Gates> {
        // Gate operations never panic while holding the lock.
        self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_artifact(artifact: &JsonValue) -> Result<()> {
    let empty = match artifact {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    };
    if empty {
        return Err(JoblineError::Validation(
            "submitted input must not be empty".to_string(),
        ));
    }
    Ok(())
}
