//! The stage executor.
//!
//! One [`Runner`] task drives one job through its pipeline. It is the only
//! writer of the job's stage results. For each stage it snapshots a
//! [`StageContext`], releases every lock, runs the handler, then classifies
//! the result through the stage's [`FailurePolicy`](crate::FailurePolicy):
//!
//! | outcome    | stage event | job                              |
//! |------------|-------------|----------------------------------|
//! | `Ok`       | `complete`  | continues                        |
//! | `Degraded` | `error`     | continues with a null result     |
//! | `Skipped`  | `skipped`   | continues with a null result     |
//! | `Fatal`    | `error`     | moves to `Error`, stops          |
//!
//! A handler panic, in `execute` or in `skip_reason`, is treated as a handler
//! failure.

use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::event::ProgressEvent;
use crate::history::{HistoryEntry, JobHistory};
use crate::job::{Job, JobRecord};
use crate::pipeline::{Pipeline, StageDescriptor};
use crate::stage::{StageContext, StageOutcome, StageResult, StageStatus};
use crate::state::JobState;
use crate::{JoblineError, Result};

/// Drives one job.
#[derive(Debug)]
pub(crate) struct Runner {
    job: Arc<Job>,
    pipeline: Arc<Pipeline>,
    history: Option<Arc<dyn JobHistory>>,
}

impl Runner {
    pub(crate) fn new(
        job: Arc<Job>,
        pipeline: Arc<Pipeline>,
        history: Option<Arc<dyn JobHistory>>,
    ) -> Self {
        Self {
            job,
            pipeline,
            history,
        }
    }

    /// Starts the runner on its own task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("job", job_id = %self.job.id());
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let outcome = self.drive().await;
        self.finish(outcome).await;
    }

    async fn drive(&self) -> Result<()> {
        let start = self.pipeline.shape().start_state();
        let input_gate = (start == JobState::AwaitingInput).then(|| self.job.arm_input_gate());

        let entry = {
            let mut record = self.job.write().await;
            self.job.apply_transition(&mut record, start, "start")?;
            self.job
                .events()
                .push(ProgressEvent::state_change(start, start_message(start)));
            HistoryEntry::snapshot(&self.job, &record)
        };
        info!(state = %start, stages = self.pipeline.len(), "job started");
        self.record_history(entry).await;

        if let Some(gate) = input_gate {
            debug!("waiting for submitted input");
            gate.await
                .map_err(|_| JoblineError::stage("input gate closed before input arrived"))?;
        }

        for (index, stage) in self.pipeline.stages().iter().enumerate() {
            self.run_stage(stage).await?;
            if self.pipeline.is_checkpoint(index) {
                self.checkpoint().await?;
            }
        }
        Ok(())
    }

    async fn run_stage(&self, stage: &StageDescriptor) -> Result<()> {
        let span = info_span!("stage", stage = %stage.name(), ordinal = stage.ordinal());
        async {
            let ctx = self.context_for(stage).await;

            let skip = panic::catch_unwind(AssertUnwindSafe(|| stage.handler().skip_reason(&ctx)));
            match skip {
                Ok(Some(reason)) => {
                    info!(reason = %reason, "stage skipped");
                    self.record_outcome(stage, &StageOutcome::Skipped(reason)).await;
                    return Ok(());
                }
                Ok(None) => {}
                Err(payload) => {
                    let failure = Err(JoblineError::stage(panic_message(&*payload)));
                    let outcome = StageOutcome::classify(stage.policy(), failure);
                    return self.conclude(stage, outcome).await;
                }
            }

            {
                let mut record = self.job.write().await;
                record
                    .stage_results
                    .insert(stage.name().to_string(), StageResult::running());
                self.job.events().push(ProgressEvent::stage(
                    stage.ordinal(),
                    stage.name(),
                    StageStatus::Running,
                    None,
                ));
            }
            info!("stage started");

            let result = AssertUnwindSafe(stage.handler().execute(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(JoblineError::stage(panic_message(&*panic))));
            self.conclude(stage, StageOutcome::classify(stage.policy(), result))
                .await
        }
        .instrument(span)
        .await
    }

    /// Logs and records a classified outcome; a fatal one becomes the job's error.
    async fn conclude(&self, stage: &StageDescriptor, outcome: StageOutcome) -> Result<()> {
        match &outcome {
            StageOutcome::Ok(_) => info!("stage complete"),
            StageOutcome::Degraded(detail) => {
                let degraded = JoblineError::StageDegraded {
                    stage: stage.name().to_string(),
                    detail: detail.clone(),
                };
                warn!(error = %degraded, kind = ?degraded.kind(), "stage degraded");
            }
            StageOutcome::Fatal(detail) => warn!(detail = %detail, "stage failed"),
            StageOutcome::Skipped(_) => {}
        }
        self.record_outcome(stage, &outcome).await;

        match outcome {
            StageOutcome::Fatal(detail) => Err(JoblineError::StageFatal {
                stage: stage.name().to_string(),
                detail,
            }),
            _ => Ok(()),
        }
    }

    async fn context_for(&self, stage: &StageDescriptor) -> StageContext {
        let record = self.job.read().await;
        StageContext {
            job_id: self.job.id().clone(),
            stage_name: stage.name().to_string(),
            ordinal: stage.ordinal(),
            inputs: Arc::clone(self.job.inputs()),
            options: self.job.effective_options(&record),
            submitted: record.submitted.clone(),
            upstream: record.stage_results.clone(),
        }
    }

    async fn record_outcome(&self, stage: &StageDescriptor, outcome: &StageOutcome) {
        let detail = match outcome {
            StageOutcome::Ok(output) => output.detail.clone(),
            StageOutcome::Degraded(d) | StageOutcome::Fatal(d) | StageOutcome::Skipped(d) => {
                Some(d.clone())
            }
        };

        let mut record = self.job.write().await;
        record
            .stage_results
            .entry(stage.name().to_string())
            .or_insert_with(StageResult::running)
            .finish(outcome);
        self.job.events().push(ProgressEvent::stage(
            stage.ordinal(),
            stage.name(),
            outcome.status(),
            detail,
        ));
    }

    async fn checkpoint(&self) -> Result<()> {
        if !self.job.inputs().confirmation_mode {
            let mut record = self.job.write().await;
            self.job
                .apply_transition(&mut record, JobState::Executing, "execute")?;
            self.job.events().push(ProgressEvent::state_change(
                JobState::Executing,
                "executing remaining stages",
            ));
            return Ok(());
        }

        let gate = self.job.arm_confirm_gate();
        {
            let mut record = self.job.write().await;
            self.job
                .apply_transition(&mut record, JobState::AwaitingConfirm, "pause for confirmation")?;
            self.job
                .events()
                .push(ProgressEvent::draft_ready(results_of(&record)));
            self.job.events().push(ProgressEvent::state_change(
                JobState::AwaitingConfirm,
                "draft ready, waiting for confirmation",
            ));
        }
        info!("paused for confirmation");

        let overrides = gate
            .await
            .map_err(|_| JoblineError::stage("confirm gate closed before confirmation"))?;
        info!(overrides = overrides.len(), "confirmed, resuming");
        Ok(())
    }

    async fn finish(&self, outcome: Result<()>) {
        let mut record = self.job.write().await;
        let outcome = outcome.and_then(|()| {
            self.job
                .apply_transition(&mut record, JobState::Complete, "complete")
        });

        let marker = match outcome {
            Ok(()) => {
                info!("job complete");
                ProgressEvent::complete(results_of(&record))
            }
            Err(e) => {
                let (stage, detail) = match e {
                    JoblineError::StageFatal { stage, detail } => (Some(stage), detail),
                    other => (None, other.to_string()),
                };
                match self
                    .job
                    .apply_transition(&mut record, JobState::Error, "fail")
                {
                    Ok(()) => {
                        record.error = Some(detail.clone());
                        record.failed_stage = stage.clone();
                    }
                    Err(conflict) => error!(error = %conflict, "could not record job failure"),
                }
                error!(stage = stage.as_deref().unwrap_or("-"), detail = %detail, "job failed");
                ProgressEvent::error(stage, detail)
            }
        };

        self.job.events().push(marker);
        let entry = HistoryEntry::snapshot(&self.job, &record);
        drop(record);

        self.job.release();
        self.record_history(entry).await;
    }

    async fn record_history(&self, entry: HistoryEntry) {
        if let Some(history) = &self.history {
            if let Err(e) = history.record(&entry).await {
                warn!(error = %e, "failed to record job history");
            }
        }
    }
}

fn results_of(record: &JobRecord) -> BTreeMap<String, StageResult> {
    record
        .stage_results
        .iter()
        .map(|(name, result)| (name.clone(), result.clone()))
        .collect()
}

fn start_message(state: JobState) -> &'static str {
    match state {
        JobState::AwaitingInput => "waiting for input",
        JobState::Analyzing => "analysis started",
        _ => "pipeline started",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("stage handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("stage handler panicked: {s}")
    } else {
        "stage handler panicked".to_string()
    }
}
