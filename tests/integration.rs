//! Integration tests for the jobline orchestrator.
//!
//! These tests drive whole jobs through the public API:
//! - Non-interactive runs, soft-fail and fatal stages
//! - The confirmation checkpoint and submit-input gate
//! - Live streaming, heartbeats and SSE output
//! - Status, artifacts and history
//! - Retention sweeping

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

use jobline::{
    ErrorKind, EventStream, JobHistory, JobId, JobInputs, JobState, JoblineError, MemoryHistory,
    Orchestrator, OrchestratorConfig, Pipeline, ProgressEvent, Result, RetentionSweeper,
    StageContext, StageHandler, StageOutput, StageStatus,
};

const WAIT: Duration = Duration::from_secs(5);

/// Succeeds with a payload naming the stage, counting calls.
#[derive(Debug, Default)]
struct Step {
    calls: Arc<AtomicU32>,
}

impl Step {
    fn counted(calls: &Arc<AtomicU32>) -> Self {
        Self {
            calls: Arc::clone(calls),
        }
    }
}

#[async_trait]
impl StageHandler for Step {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::new(json!({
            "stage": ctx.stage_name,
            "topic": ctx.topic(),
        }))
        .with_detail(format!("{} done", ctx.stage_name)))
    }
}

/// Always fails.
#[derive(Debug)]
struct Broken(&'static str);

#[async_trait]
impl StageHandler for Broken {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
        Err(jobline::JoblineError::stage(self.0))
    }
}

/// Reports the options and submitted input it was given.
#[derive(Debug)]
struct Inspect;

#[async_trait]
impl StageHandler for Inspect {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        Ok(StageOutput::new(json!({
            "upload_youtube": ctx.flag("upload_youtube"),
            "submitted": ctx.submitted.clone(),
            "draft": ctx.upstream("compose").cloned(),
        })))
    }
}

/// Produces a nested payload.
#[derive(Debug)]
struct Compose;

#[async_trait]
impl StageHandler for Compose {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        Ok(StageOutput::new(json!({
            "title": format!("Review: {}", ctx.topic()),
            "blog_html": "<h1>Review</h1>",
            "tags": ["home", "kitchen"],
        })))
    }
}

/// Blocks until released.
#[derive(Debug)]
struct Hold(Arc<Notify>);

#[async_trait]
impl StageHandler for Hold {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        self.0.notified().await;
        Ok(StageOutput::new(json!({ "stage": ctx.stage_name })))
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig::default().with_heartbeat_interval(Duration::from_secs(30))
}

fn three_stages(calls: &Arc<AtomicU32>) -> Pipeline {
    Pipeline::builder()
        .stage("analyze", Step::counted(calls))
        .stage("content", Step::counted(calls))
        .stage("render", Step::counted(calls))
        .build()
        .unwrap()
}

fn checkpoint_pipeline(requires_input: bool) -> Pipeline {
    let builder = Pipeline::builder()
        .stage("analyze", Step::default())
        .stage("compose", Compose)
        .soft_fail_stage("publish", Inspect)
        .label("compose", "Draft copy")
        .checkpoint("compose");
    if requires_input {
        builder.requires_input().build().unwrap()
    } else {
        builder.build().unwrap()
    }
}

async fn drain(feed: &mut EventStream) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = timeout(WAIT, feed.next()).await.expect("feed stalled") {
        events.push(event);
    }
    events
}

async fn read_until(feed: &mut EventStream, stop: impl Fn(&ProgressEvent) -> bool) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(WAIT, feed.next())
            .await
            .expect("feed stalled")
            .expect("feed ended early");
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

fn stage_ordinals(events: &[ProgressEvent], wanted: StageStatus) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Stage { ordinal, status, .. } if *status == wanted => Some(*ordinal),
            _ => None,
        })
        .collect()
}

fn position(events: &[ProgressEvent], pred: impl Fn(&ProgressEvent) -> bool) -> usize {
    events.iter().position(pred).expect("event not found")
}

async fn wait_for(orchestrator: &Orchestrator, id: &JobId, state: JobState) {
    orchestrator
        .wait_for_state(id, WAIT, |s| s == state)
        .await
        .unwrap_or_else(|e| panic!("job never reached {state}: {e}"));
}

async fn assert_confirm_rejected(orchestrator: &Orchestrator, id: &JobId, expected: JobState) {
    let before = orchestrator.status(id).await.unwrap();
    let err = orchestrator
        .confirm(id, Some(json!({ "upload_youtube": true })))
        .await
        .unwrap_err();
    assert!(
        matches!(err, JoblineError::StateConflict { state, .. } if state == expected),
        "{err}"
    );
    assert_eq!(orchestrator.status(id).await.unwrap(), before);
}

#[tokio::test]
async fn test_non_interactive_pipeline_completes_in_order() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::new(three_stages(&calls), config());

    let ticket = orchestrator.create_job(JobInputs::new("stand mixer")).await.unwrap();
    assert_eq!(ticket.state, JobState::Pending);
    assert_eq!(ticket.job_id.as_str().len(), 12);

    let mut feed = orchestrator.stream(&ticket.job_id).await.unwrap();
    let events = drain(&mut feed).await;

    assert_eq!(stage_ordinals(&events, StageStatus::Complete), vec![1, 2, 3]);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
    assert!(matches!(
        events.first(),
        Some(ProgressEvent::StateChange {
            state: JobState::Running,
            ..
        })
    ));

    let ordinals: Vec<u32> = events.iter().filter_map(ProgressEvent::ordinal).collect();
    assert!(ordinals.windows(2).all(|w| w[0] <= w[1]), "out of order: {ordinals:?}");

    let status = orchestrator.status(&ticket.job_id).await.unwrap();
    assert_eq!(status.state, JobState::Complete);
    assert_eq!(status.results.len(), 3);
    assert!(status.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_checkpoint_pauses_until_confirm() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(false), config());
    let ticket = orchestrator
        .create_job(
            JobInputs::new("air fryer")
                .with_option("upload_youtube", json!(false))
                .with_confirmation(true),
        )
        .await
        .unwrap();
    assert_eq!(ticket.state, JobState::Idle);
    let id = ticket.job_id;

    let mut feed = orchestrator.stream(&id).await.unwrap();
    let events = read_until(&mut feed, ProgressEvent::is_checkpoint_pause).await;

    let compose_done = position(&events, |e| {
        matches!(e, ProgressEvent::Stage { ordinal: 2, status: StageStatus::Complete, .. })
    });
    let draft = position(&events, |e| matches!(e, ProgressEvent::DraftReady { .. }));
    let pause = events.len() - 1;
    assert!(compose_done < draft && draft < pause);

    match &events[draft] {
        ProgressEvent::DraftReady { results, .. } => {
            assert!(results.contains_key("analyze"));
            assert_eq!(results["compose"].payload["title"], json!("Review: air fryer"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(orchestrator.status(&id).await.unwrap().state, JobState::AwaitingConfirm);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = orchestrator.status(&id).await.unwrap();
    assert_eq!(status.state, JobState::AwaitingConfirm);
    assert_eq!(status.stages[2].status, None);

    let ack = orchestrator
        .confirm(&id, Some(json!({ "upload_youtube": true })))
        .await
        .unwrap();
    assert_eq!(ack.state, JobState::Executing);

    let rest = drain(&mut feed).await;
    assert!(matches!(
        rest.first(),
        Some(ProgressEvent::StateChange {
            state: JobState::Executing,
            ..
        })
    ));
    assert_eq!(stage_ordinals(&rest, StageStatus::Complete), vec![3]);
    assert!(matches!(rest.last(), Some(ProgressEvent::Complete { .. })));

    let publish = orchestrator.artifact(&id, "publish").await.unwrap();
    assert_eq!(publish["upload_youtube"], json!(true));
    assert_eq!(publish["draft"]["blog_html"], json!("<h1>Review</h1>"));
}

#[tokio::test]
async fn test_soft_fail_stage_does_not_stop_job() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::builder()
        .stage("analyze", Step::counted(&calls))
        .stage("content", Step::counted(&calls))
        .soft_fail_stage("collect", Broken("stock footage api timed out"))
        .stage("render", Step::counted(&calls))
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(pipeline, config());
    let id = orchestrator.create_job(JobInputs::new("desk fan")).await.unwrap().job_id;

    let events = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert_eq!(stage_ordinals(&events, StageStatus::Error), vec![3]);
    assert_eq!(stage_ordinals(&events, StageStatus::Complete), vec![1, 2, 4]);
    assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));

    let degraded = events
        .iter()
        .find_map(|e| match e {
            ProgressEvent::Stage { ordinal: 3, status: StageStatus::Error, detail, .. } => detail.clone(),
            _ => None,
        })
        .unwrap();
    assert_eq!(degraded, "stock footage api timed out");

    let status = orchestrator.status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Complete);
    assert_eq!(status.failed_stages(), vec!["collect"]);
    assert!(!status.results.contains_key("collect"));
    assert!(status.error.is_none());

    let err = orchestrator.artifact(&id, "collect").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_fatal_stage_halts_job() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::builder()
        .stage("analyze", Broken("product page returned 404"))
        .stage("content", Step::counted(&calls))
        .soft_fail_stage("render", Step::counted(&calls))
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(pipeline, config());
    let id = orchestrator.create_job(JobInputs::new("robot vacuum")).await.unwrap().job_id;

    let events = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert!(events.iter().filter_map(ProgressEvent::ordinal).all(|o| o == 1));
    match events.last() {
        Some(ProgressEvent::Error { stage, error, .. }) => {
            assert_eq!(stage.as_deref(), Some("analyze"));
            assert_eq!(error, "product page returned 404");
        }
        other => panic!("expected error marker, got {other:?}"),
    }

    let status = orchestrator.status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Error);
    assert_eq!(status.error.as_deref(), Some("product page returned 404"));
    assert_eq!(status.failed_stage.as_deref(), Some("analyze"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_swept_job_is_not_found() {
    let calls = Arc::new(AtomicU32::new(0));
    let retention = Duration::from_secs(3600);
    let orchestrator = Orchestrator::new(
        three_stages(&calls),
        config().with_retention_window(retention),
    );
    let id = orchestrator.create_job(JobInputs::new("kettle")).await.unwrap().job_id;
    wait_for(&orchestrator, &id, JobState::Complete).await;

    let sweeper = RetentionSweeper::new(vec![orchestrator.store().clone()], retention, Duration::from_secs(600));
    assert_eq!(sweeper.sweep_once(Utc::now()).await, 0);
    assert!(orchestrator.status(&id).await.is_ok());

    let later = Utc::now() + chrono::Duration::seconds(3601);
    assert_eq!(sweeper.sweep_once(later).await, 1);

    let err = orchestrator.status(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(matches!(err, JoblineError::JobNotFound(ref missing) if *missing == id));
}

#[tokio::test]
async fn test_waiting_job_survives_sweep() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(true), config());
    let id = orchestrator.create_job(JobInputs::new("blender")).await.unwrap().job_id;
    wait_for(&orchestrator, &id, JobState::AwaitingInput).await;

    let far_future = Utc::now() + chrono::Duration::days(30);
    let sweeper = RetentionSweeper::new(vec![orchestrator.store().clone()], Duration::ZERO, Duration::from_secs(1));
    assert_eq!(sweeper.sweep_once(far_future).await, 0);
    assert_eq!(orchestrator.list_active().await, vec![id]);
    assert_eq!(orchestrator.active_job_count().await, 1);
}

#[tokio::test]
async fn test_confirm_twice_is_state_conflict() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(false), config());
    let id = orchestrator
        .create_job(JobInputs::new("toaster").with_confirmation(true))
        .await
        .unwrap()
        .job_id;
    wait_for(&orchestrator, &id, JobState::AwaitingConfirm).await;

    orchestrator.confirm(&id, None).await.unwrap();
    let err = orchestrator.confirm(&id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    wait_for(&orchestrator, &id, JobState::Complete).await;
    let err = orchestrator.confirm(&id, None).await.unwrap_err();
    assert!(matches!(
        err,
        JoblineError::StateConflict {
            state: JobState::Complete,
            ..
        }
    ));
}

#[tokio::test]
async fn test_confirm_rejects_non_object_overrides() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(false), config());
    let id = orchestrator
        .create_job(JobInputs::new("toaster").with_confirmation(true))
        .await
        .unwrap()
        .job_id;
    wait_for(&orchestrator, &id, JobState::AwaitingConfirm).await;

    let err = orchestrator.confirm(&id, Some(json!([true]))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(orchestrator.status(&id).await.unwrap().state, JobState::AwaitingConfirm);
}

#[tokio::test]
async fn test_submit_input_gate() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(true), config());
    let id = orchestrator.create_job(JobInputs::new("rice cooker")).await.unwrap().job_id;
    wait_for(&orchestrator, &id, JobState::AwaitingInput).await;

    let err = orchestrator.confirm(&id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let err = orchestrator.submit_input(&id, JsonValue::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let ack = orchestrator
        .submit_input(&id, json!("https://shop.example/item/42"))
        .await
        .unwrap();
    assert_eq!(ack.state, JobState::Analyzing);

    let err = orchestrator
        .submit_input(&id, json!("https://shop.example/item/43"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    wait_for(&orchestrator, &id, JobState::Complete).await;
    let submitted = orchestrator.artifact(&id, "publish/submitted").await.unwrap();
    assert_eq!(submitted, json!("https://shop.example/item/42"));
}

#[tokio::test]
async fn test_unknown_job_is_not_found_everywhere() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::new(three_stages(&calls), config());
    let id = JobId::from("000000000000");

    let errors = vec![
        orchestrator.submit_input(&id, json!("x")).await.unwrap_err(),
        orchestrator.confirm(&id, None).await.unwrap_err(),
        orchestrator.stream(&id).await.unwrap_err(),
        orchestrator.status(&id).await.unwrap_err(),
        orchestrator.artifact(&id, "analyze").await.unwrap_err(),
    ];
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
    }
}

#[tokio::test]
async fn test_create_rejects_blank_topic() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::new(three_stages(&calls), config());
    let err = orchestrator.create_job(JobInputs::new("  ")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(orchestrator.store().is_empty().await);
}

#[tokio::test]
async fn test_artifact_paths() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(false), config());
    let id = orchestrator.create_job(JobInputs::new("juicer")).await.unwrap().job_id;
    wait_for(&orchestrator, &id, JobState::Complete).await;

    assert_eq!(
        orchestrator.artifact(&id, "compose/blog_html").await.unwrap(),
        json!("<h1>Review</h1>")
    );
    assert_eq!(
        orchestrator.artifact(&id, "compose/tags/1").await.unwrap(),
        json!("kitchen")
    );
    assert!(orchestrator.artifact(&id, "compose").await.unwrap().is_object());

    for key in ["compose/missing", "nope", "analyze/deep/path"] {
        let err = orchestrator.artifact(&id, key).await.unwrap_err();
        assert!(matches!(err, JoblineError::ArtifactNotFound { .. }), "{key}");
    }
}

#[tokio::test]
async fn test_idle_stream_sends_heartbeat() {
    let orchestrator = Orchestrator::new(
        checkpoint_pipeline(true),
        OrchestratorConfig::default().with_heartbeat_interval(Duration::from_millis(50)),
    );
    let id = orchestrator.create_job(JobInputs::new("scale")).await.unwrap().job_id;
    let mut feed = orchestrator.stream(&id).await.unwrap();

    let events = read_until(&mut feed, |e| e.kind() == "heartbeat").await;
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::StateChange {
            state: JobState::AwaitingInput,
            ..
        }
    )));
    assert!(!feed.is_finished());
    assert_eq!(orchestrator.status(&id).await.unwrap().state, JobState::AwaitingInput);
}

#[tokio::test]
async fn test_stream_closes_at_checkpoint_and_reconnects() {
    let orchestrator = Orchestrator::new(
        checkpoint_pipeline(false),
        config().with_close_stream_on_checkpoint(true),
    );
    let id = orchestrator
        .create_job(JobInputs::new("heater").with_confirmation(true))
        .await
        .unwrap()
        .job_id;

    let first = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert!(first.last().unwrap().is_checkpoint_pause());
    assert!(first.iter().any(|e| matches!(e, ProgressEvent::DraftReady { .. })));

    orchestrator.confirm(&id, None).await.unwrap();
    let second = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert_eq!(stage_ordinals(&second, StageStatus::Complete), vec![3]);
    assert!(matches!(second.last(), Some(ProgressEvent::Complete { .. })));
}

#[tokio::test]
async fn test_late_observer_gets_synthesized_marker() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::new(three_stages(&calls), config());
    let id = orchestrator.create_job(JobInputs::new("iron")).await.unwrap().job_id;

    let first = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert!(first.last().unwrap().is_terminal());

    let second = drain(&mut orchestrator.stream(&id).await.unwrap()).await;
    assert_eq!(second.len(), 1);
    match &second[0] {
        ProgressEvent::Complete { results, .. } => assert_eq!(results.len(), 3),
        other => panic!("expected complete marker, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pipe_to_sse() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::new(three_stages(&calls), config());
    let id = orchestrator.create_job(JobInputs::new("lamp")).await.unwrap().job_id;

    let mut body = Vec::new();
    let frames = timeout(WAIT, orchestrator.stream(&id).await.unwrap().pipe_to(&mut body))
        .await
        .unwrap()
        .unwrap();

    let text = String::from_utf8(body).unwrap();
    let data: Vec<JsonValue> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| serde_json::from_str(frame.trim_start_matches("data: ")).unwrap())
        .collect();
    assert_eq!(data.len(), frames);
    assert_eq!(data.last().unwrap()["type"], json!("complete"));
}

#[tokio::test]
async fn test_history_outlives_sweep() {
    let calls = Arc::new(AtomicU32::new(0));
    let history = MemoryHistory::new();
    let orchestrator = Orchestrator::new(three_stages(&calls), config().with_history_list_limit(2))
        .with_history(Arc::new(history.clone()));

    let mut ids = Vec::new();
    for topic in ["a", "b", "c"] {
        let id = orchestrator.create_job(JobInputs::new(topic)).await.unwrap().job_id;
        wait_for(&orchestrator, &id, JobState::Complete).await;
        ids.push(id);
    }

    // The terminal history write happens right after the state flips.
    for _ in 0..50 {
        let done = history.list_recent(10).await.unwrap();
        if done.iter().all(|e| e.state == JobState::Complete) && done.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    RetentionSweeper::new(vec![orchestrator.store().clone()], Duration::ZERO, Duration::from_secs(1))
        .sweep_once(Utc::now() + chrono::Duration::seconds(1))
        .await;
    assert!(orchestrator.store().is_empty().await);

    let entry = orchestrator.history_entry(&ids[0]).await.unwrap();
    assert_eq!(entry.state, JobState::Complete);
    assert_eq!(entry.results.len(), 3);
    assert_eq!(orchestrator.history(Some(50)).await.unwrap().len(), 2);

    let err = orchestrator.history_entry(&JobId::from("nope")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_stage_catalog() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(false), config());
    let catalog = orchestrator.stage_catalog();
    let rows: Vec<_> = catalog
        .iter()
        .map(|s| (s.ordinal, s.name.as_str(), s.label.as_str(), s.checkpoint))
        .collect();
    assert_eq!(
        rows,
        vec![
            (1, "analyze", "analyze", false),
            (2, "compose", "Draft copy", true),
            (3, "publish", "publish", false),
        ]
    );
}

#[tokio::test]
async fn test_wait_for_state_times_out() {
    let orchestrator = Orchestrator::new(checkpoint_pipeline(true), config());
    let id = orchestrator.create_job(JobInputs::new("kettle")).await.unwrap().job_id;
    let err = orchestrator
        .wait_for_state(&id, Duration::from_millis(50), |s| s == JobState::Complete)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(err, JoblineError::WaitTimeout { ref job_id, .. } if *job_id == id));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_history_records_jobs() {
    let calls = Arc::new(AtomicU32::new(0));
    let history = Arc::new(jobline::SqliteHistory::open_in_memory().await.unwrap());
    let orchestrator = Orchestrator::new(three_stages(&calls), config()).with_history(history.clone());

    let id = orchestrator.create_job(JobInputs::new("grill")).await.unwrap().job_id;
    wait_for(&orchestrator, &id, JobState::Complete).await;

    let mut entry = None;
    for _ in 0..50 {
        entry = history.get(&id).await.unwrap();
        if entry.as_ref().is_some_and(|e| e.state == JobState::Complete) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entry = entry.unwrap();
    assert_eq!(entry.state, JobState::Complete);
    assert_eq!(entry.topic, "grill");
}

#[tokio::test]
async fn test_rejected_confirm_never_touches_results() {
    let release = Arc::new(Notify::new());
    let pipeline = Pipeline::builder()
        .stage("analyze", Step::default())
        .stage("compose", Compose)
        .stage("render", Hold(Arc::clone(&release)))
        .soft_fail_stage("publish", Inspect)
        .checkpoint("compose")
        .requires_input()
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(pipeline, config());
    let id = orchestrator
        .create_job(
            JobInputs::new("waffle maker")
                .with_option("upload_youtube", json!(false))
                .with_confirmation(true),
        )
        .await
        .unwrap()
        .job_id;

    wait_for(&orchestrator, &id, JobState::AwaitingInput).await;
    assert_confirm_rejected(&orchestrator, &id, JobState::AwaitingInput).await;

    orchestrator.submit_input(&id, json!("https://shop.example/w/1")).await.unwrap();
    wait_for(&orchestrator, &id, JobState::AwaitingConfirm).await;
    orchestrator.confirm(&id, None).await.unwrap();

    let mut running = None;
    for _ in 0..500 {
        let status = orchestrator.status(&id).await.unwrap();
        running = status.running_stage().map(str::to_string);
        if running.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(running.as_deref(), Some("render"));
    assert_confirm_rejected(&orchestrator, &id, JobState::Executing).await;

    release.notify_one();
    wait_for(&orchestrator, &id, JobState::Complete).await;
    assert_confirm_rejected(&orchestrator, &id, JobState::Complete).await;

    let publish = orchestrator.artifact(&id, "publish").await.unwrap();
    assert_eq!(publish["upload_youtube"], json!(false));
}

#[tokio::test]
async fn test_fatal_stage_after_confirm_halts_job() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::builder()
        .stage("analyze", Step::counted(&calls))
        .stage("compose", Compose)
        .stage("render", Broken("encoder exited with status 1"))
        .soft_fail_stage("publish", Step::counted(&calls))
        .checkpoint("compose")
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(pipeline, config());
    let id = orchestrator
        .create_job(JobInputs::new("hand mixer").with_confirmation(true))
        .await
        .unwrap()
        .job_id;

    let mut feed = orchestrator.stream(&id).await.unwrap();
    read_until(&mut feed, ProgressEvent::is_checkpoint_pause).await;
    orchestrator.confirm(&id, None).await.unwrap();

    let rest = drain(&mut feed).await;
    assert!(matches!(
        rest.first(),
        Some(ProgressEvent::StateChange {
            state: JobState::Executing,
            ..
        })
    ));
    assert_eq!(stage_ordinals(&rest, StageStatus::Error), vec![3]);
    assert!(rest.iter().filter_map(ProgressEvent::ordinal).all(|o| o == 3));
    match rest.last() {
        Some(ProgressEvent::Error { stage, error, .. }) => {
            assert_eq!(stage.as_deref(), Some("render"));
            assert_eq!(error, "encoder exited with status 1");
        }
        other => panic!("expected error marker, got {other:?}"),
    }

    let status = orchestrator.status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Error);
    assert_eq!(status.failed_stage.as_deref(), Some("render"));
    assert_eq!(status.error.as_deref(), Some("encoder exited with status 1"));
    assert_eq!(status.stages[3].status, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
