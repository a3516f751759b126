//! Product campaign pipeline demo.
//!
//! This demo shows:
//! - Building a checkpointed pipeline with fatal and soft-fail stages
//! - Streaming live progress as SSE frames
//! - Confirming a draft with option overrides
//! - Skipping a stage based on options
//! - Reading status and artifacts once the job is done
//!
//! Run with: `cargo run --example campaign`
//! Set `RUST_LOG=jobline=debug` for runner logs.

use async_trait::async_trait;
use jobline::{
    sse_frame, JobInputs, JoblineError, Orchestrator, OrchestratorConfig, Pipeline, Result,
    StageContext, StageHandler, StageOutput,
};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Stage 1: look the product up.
#[derive(Debug)]
struct Analyze;

#[async_trait]
impl StageHandler for Analyze {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(StageOutput::new(json!({
            "product": ctx.topic(),
            "price": "$89.99",
            "rating": 4.6,
        }))
        .with_detail("product page analyzed"))
    }
}

/// Stage 2: write the draft copy. The pipeline pauses after this one.
#[derive(Debug)]
struct Compose;

#[async_trait]
impl StageHandler for Compose {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let price = ctx
            .upstream("analyze")
            .and_then(|a| a["price"].as_str())
            .unwrap_or("n/a");
        Ok(StageOutput::new(json!({
            "title": format!("{} review", ctx.topic()),
            "script": format!("Is the {} worth {price}? Let's find out.", ctx.topic()),
        }))
        .with_detail("draft written"))
    }
}

/// Stage 3: fetch stock footage. The provider is down, which only degrades the job.
#[derive(Debug)]
struct Footage;

#[async_trait]
impl StageHandler for Footage {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(JoblineError::stage("footage provider returned 503"))
    }
}

/// Stage 4: render the video.
#[derive(Debug)]
struct Render;

#[async_trait]
impl StageHandler for Render {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let clips = if ctx.upstream("footage").is_some() { 6 } else { 0 };
        Ok(StageOutput::new(json!({
            "path": format!("/tmp/{}.mp4", ctx.job_id),
            "stock_clips": clips,
        }))
        .with_detail("video rendered"))
    }
}

/// Stage 5: upload, only when asked to.
#[derive(Debug)]
struct Upload;

#[async_trait]
impl StageHandler for Upload {
    fn skip_reason(&self, ctx: &StageContext) -> Option<String> {
        (!ctx.flag("upload_youtube")).then(|| "upload_youtube is off".to_string())
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        Ok(StageOutput::new(json!({ "video_id": format!("yt-{}", ctx.job_id) })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    println!("🏗️  Building campaign pipeline...\n");
    let pipeline = Pipeline::builder()
        .stage("analyze", Analyze)
        .stage("compose", Compose)
        .soft_fail_stage("footage", Footage)
        .stage("render", Render)
        .soft_fail_stage("upload", Upload)
        .label("analyze", "Product analysis")
        .label("compose", "Draft copy")
        .checkpoint("compose")
        .build()?;

    let config = OrchestratorConfig::from_env()?.with_heartbeat_interval(Duration::from_secs(1));
    let orchestrator = Orchestrator::new(pipeline, config);
    let sweeper = orchestrator.spawn_sweeper();

    for stage in orchestrator.stage_catalog() {
        let marker = if stage.checkpoint { " (checkpoint)" } else { "" };
        println!("  {}. {}{}", stage.ordinal, stage.label, marker);
    }
    println!();

    let ticket = orchestrator
        .create_job(
            JobInputs::new("Espresso grinder")
                .with_platforms(["youtube", "blog"])
                .with_option("upload_youtube", json!(false))
                .with_confirmation(true),
        )
        .await?;
    println!("📋 Created job {} ({})\n", ticket.job_id, ticket.state);

    let mut feed = orchestrator.stream(&ticket.job_id).await?;
    while let Some(event) = feed.next().await {
        print!("{}", sse_frame(&event)?);
        if event.is_checkpoint_pause() {
            println!("✋ Draft ready, confirming with uploads enabled...\n");
            orchestrator
                .confirm(&ticket.job_id, Some(json!({ "upload_youtube": true })))
                .await?;
        }
    }

    println!("\n{}\n", orchestrator.status(&ticket.job_id).await?);

    let script = orchestrator.artifact(&ticket.job_id, "compose/script").await?;
    println!("📝 Script: {script}");
    let upload = orchestrator.artifact(&ticket.job_id, "upload/video_id").await?;
    println!("📺 Uploaded as {upload}");

    sweeper.shutdown().await;
    println!("\n✨ Done!");
    Ok(())
}
