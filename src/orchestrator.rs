//! The in-process request/response surface.
//!
//! [`Orchestrator`] ties a [`Pipeline`], a [`JobStore`], an optional
//! [`JobHistory`] and an [`OrchestratorConfig`] together and exposes the
//! operations a transport layer (HTTP + SSE, gRPC, a CLI) maps onto:
//!
//! | operation        | method                              |
//! |------------------|-------------------------------------|
//! | create job       | [`create_job`](Orchestrator::create_job) |
//! | submit input     | [`submit_input`](Orchestrator::submit_input) |
//! | confirm          | [`confirm`](Orchestrator::confirm) |
//! | stream progress  | [`stream`](Orchestrator::stream) |
//! | get status       | [`status`](Orchestrator::status) |
//! | get artifact     | [`artifact`](Orchestrator::artifact) |
//!
//! Every failure is a [`JoblineError`] whose [`kind`](JoblineError::kind)
//! maps onto the stable error taxonomy.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::OrchestratorConfig;
use crate::history::{HistoryEntry, JobHistory, DEFAULT_HISTORY_LIMIT};
use crate::job::{Job, JobId, JobInputs};
use crate::pipeline::{Pipeline, StageInfo};
use crate::runner::Runner;
use crate::state::JobState;
use crate::status::JobStatus;
use crate::store::JobStore;
use crate::stream::EventStream;
use crate::sweeper::{RetentionSweeper, SweeperHandle};
use crate::{JoblineError, Result};

/// Acknowledgment returned by create, submit-input and confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTicket {
    /// The job's id.
    pub job_id: JobId,
    /// The state the job is in after the operation.
    pub state: JobState,
}

/// Runs jobs of one pipeline.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    store: JobStore,
    history: Option<Arc<dyn JobHistory>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator with its own, empty job store.
    pub fn new(pipeline: Pipeline, config: OrchestratorConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            store: JobStore::new(),
            history: None,
            config,
        }
    }

    /// Records every job to `history`.
    pub fn with_history(mut self, history: Arc<dyn JobHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Uses an existing store, for example one shared with a sweeper.
    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = store;
        self
    }

    /// The job store.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// The pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Creates a job and starts its runner.
    ///
    /// Returns without waiting for any stage work.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::Validation`] if the inputs are incomplete.
    pub async fn create_job(&self, inputs: JobInputs) -> Result<JobTicket> {
        inputs.validate()?;

        let job = self.store.create(inputs, self.pipeline.shape()).await;
        let ticket = JobTicket {
            job_id: job.id().clone(),
            state: self.pipeline.shape().initial_state(),
        };
        info!(
            job_id = %ticket.job_id,
            topic = %job.inputs().topic,
            confirmation_mode = job.inputs().confirmation_mode,
            "job created"
        );

        Runner::new(job, Arc::clone(&self.pipeline), self.history.clone()).spawn();
        Ok(ticket)
    }

    /// Supplies the artifact an `AwaitingInput` job is waiting for.
    ///
    /// # Errors
    ///
    /// - [`JoblineError::JobNotFound`] if the id is unknown
    /// - [`JoblineError::StateConflict`] unless the job is `AwaitingInput`
    /// - [`JoblineError::Validation`] if the artifact is null or empty
    pub async fn submit_input(&self, id: &JobId, artifact: JsonValue) -> Result<JobTicket> {
        let job = self.job(id).await?;
        let state = job.submit_input(artifact).await?;
        info!(job_id = %id, "input submitted");
        Ok(JobTicket {
            job_id: id.clone(),
            state,
        })
    }

    /// Releases a job paused at its checkpoint.
    ///
    /// `overrides` must be a JSON object when present; its keys replace the
    /// job's creation options for every remaining stage.
    ///
    /// # Errors
    ///
    /// - [`JoblineError::JobNotFound`] if the id is unknown
    /// - [`JoblineError::StateConflict`] unless the job is `AwaitingConfirm`
    /// - [`JoblineError::Validation`] if `overrides` is not an object
    pub async fn confirm(&self, id: &JobId, overrides: Option<JsonValue>) -> Result<JobTicket> {
        let job = self.job(id).await?;
        if job.state() != JobState::AwaitingConfirm {
            return Err(JoblineError::StateConflict {
                operation: "confirm",
                state: job.state(),
            });
        }
        let overrides = match overrides {
            None | Some(JsonValue::Null) => Map::new(),
            Some(JsonValue::Object(map)) => map,
            Some(_) => {
                return Err(JoblineError::Validation(
                    "confirm overrides must be a JSON object".to_string(),
                ))
            }
        };

        let state = job.confirm(overrides).await?;
        info!(job_id = %id, "job confirmed");
        Ok(JobTicket {
            job_id: id.clone(),
            state,
        })
    }

    /// Attaches a live observer to a job.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::JobNotFound`] if the id is unknown.
    pub async fn stream(&self, id: &JobId) -> Result<EventStream> {
        let job = self.job(id).await?;
        debug!(job_id = %id, "observer attached");
        Ok(EventStream::new(job, self.config.heartbeat_interval)
            .close_on_checkpoint(self.config.close_stream_on_checkpoint))
    }

    /// Returns a status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::JobNotFound`] if the id is unknown.
    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        let job = self.job(id).await?;
        Ok(JobStatus::capture(&job, &self.pipeline).await)
    }

    /// Looks up a stored artifact.
    ///
    /// `key` is a stage name, optionally followed by a JSON pointer into that
    /// stage's payload: `"compose"` or `"compose/blog_html"`.
    ///
    /// # Errors
    ///
    /// - [`JoblineError::JobNotFound`] if the id is unknown
    /// - [`JoblineError::ArtifactNotFound`] if the stage has not produced a
    ///   payload or the path does not resolve
    pub async fn artifact(&self, id: &JobId, key: &str) -> Result<JsonValue> {
        let job = self.job(id).await?;
        let not_found = || JoblineError::ArtifactNotFound {
            job_id: id.clone(),
            key: key.to_string(),
        };

        let (stage, path) = match key.split_once('/') {
            Some((stage, path)) => (stage, Some(path)),
            None => (key, None),
        };

        let record = job.read().await;
        let result = record
            .stage_results
            .get(stage)
            .filter(|r| r.is_available())
            .ok_or_else(not_found)?;

        match path {
            None | Some("") => Ok(result.payload.clone()),
            Some(path) => result
                .payload
                .pointer(&format!("/{path}"))
                .cloned()
                .ok_or_else(not_found),
        }
    }

    /// Ids of jobs that have not reached a terminal state.
    pub async fn list_active(&self) -> Vec<JobId> {
        self.store.list_active().await
    }

    /// Number of jobs that have not reached a terminal state.
    pub async fn active_job_count(&self) -> usize {
        self.store.list_active().await.len()
    }

    /// The ordered stage catalog.
    pub fn stage_catalog(&self) -> Vec<StageInfo> {
        self.pipeline.catalog()
    }

    /// Waits until the job's state satisfies `predicate`, up to `timeout`.
    ///
    /// # Errors
    ///
    /// - [`JoblineError::JobNotFound`] if the id is unknown
    /// - [`JoblineError::WaitTimeout`] if the timeout elapses first; the
    ///   error carries the last observed state
    pub async fn wait_for_state<F>(&self, id: &JobId, timeout: Duration, predicate: F) -> Result<JobState>
    where
        F: Fn(JobState) -> bool + Send,
    {
        let job = self.job(id).await?;
        let mut rx = job.subscribe_state();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| predicate(*state))).await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            _ => Err(JoblineError::WaitTimeout {
                job_id: id.clone(),
                state: job.state(),
            }),
        }
    }

    /// Recent history entries, newest first.
    ///
    /// `limit` defaults to 20 and is capped by the configured history limit.
    /// Returns an empty list when no history backend is attached.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(self.config.history_list_limit);
        history.list_recent(limit).await
    }

    /// One history entry.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::JobNotFound`] if no entry exists.
    pub async fn history_entry(&self, id: &JobId) -> Result<HistoryEntry> {
        let entry = match &self.history {
            Some(history) => history.get(id).await?,
            None => None,
        };
        entry.ok_or_else(|| JoblineError::JobNotFound(id.clone()))
    }

    /// Starts the retention sweeper over this orchestrator's store.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        RetentionSweeper::new(
            vec![self.store.clone()],
            self.config.retention_window,
            self.config.sweep_interval,
        )
        .spawn()
    }

    async fn job(&self, id: &JobId) -> Result<Arc<Job>> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| JoblineError::JobNotFound(id.clone()))
    }
}
