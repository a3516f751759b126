//! Stream adapter: turns a job's event queue into a live observer feed.
//!
//! An [`EventStream`] drains its job's queue in emission order. While the
//! queue is idle it yields a synthetic heartbeat every `heartbeat` interval.
//! It ends right after forwarding a terminal marker. If the queue is closed
//! and drained before a marker was seen (another observer took it, or the job
//! was swept), the adapter synthesizes the marker from the job record.
//!
//! Dropping the stream only detaches the observer; the runner keeps going.

use futures::stream::{self, Stream};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::event::{ProgressEvent, QueueRecv};
use crate::job::Job;
use crate::state::JobState;
use crate::{JoblineError, Result};

/// Formats one event as a server-sent-events frame.
pub fn sse_frame(event: &ProgressEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// A live, ordered feed of one job's progress events.
#[derive(Debug)]
pub struct EventStream {
    job: Arc<Job>,
    heartbeat: Duration,
    close_on_checkpoint: bool,
    finished: bool,
}

impl EventStream {
    /// Attaches a new observer to `job`.
    pub fn new(job: Arc<Job>, heartbeat: Duration) -> Self {
        Self {
            job,
            heartbeat,
            close_on_checkpoint: false,
            finished: false,
        }
    }

    /// Ends the feed once the job pauses for confirmation.
    pub fn close_on_checkpoint(mut self, enabled: bool) -> Self {
        self.close_on_checkpoint = enabled;
        self
    }

    /// Returns true once the feed has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits for the next item of the feed. Returns `None` once it has ended.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        match self.job.events().recv(self.heartbeat).await {
            QueueRecv::Event(event) => {
                if event.is_terminal() || (self.close_on_checkpoint && event.is_checkpoint_pause()) {
                    self.finished = true;
                }
                Some(event)
            }
            QueueRecv::Idle => {
                debug!(job_id = %self.job.id(), "stream idle, sending heartbeat");
                Some(ProgressEvent::heartbeat())
            }
            QueueRecv::Closed => {
                self.finished = true;
                Some(self.synthesize_marker().await)
            }
        }
    }

    /// Converts the adapter into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        stream::unfold(self, |mut feed| async move {
            let event = feed.next().await?;
            Some((event, feed))
        })
    }

    /// Writes the whole feed to `writer` as SSE frames.
    ///
    /// Returns the number of frames written. A write failure ends the feed
    /// with [`JoblineError::Transport`]; the job itself is unaffected.
    pub async fn pipe_to<W>(mut self, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let mut frames = 0;
        while let Some(event) = self.next().await {
            let frame = sse_frame(&event)?;
            writer
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| JoblineError::Transport(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| JoblineError::Transport(e.to_string()))?;
            frames += 1;
        }
        Ok(frames)
    }

    async fn synthesize_marker(&self) -> ProgressEvent {
        let record = self.job.read().await;
        if record.state == JobState::Error {
            let detail = record.error.clone().unwrap_or_else(|| "job failed".to_string());
            ProgressEvent::error(record.failed_stage.clone(), detail)
        } else {
            let results: BTreeMap<_, _> = record
                .stage_results
                .iter()
                .map(|(name, result)| (name.clone(), result.clone()))
                .collect();
            ProgressEvent::complete(results)
        }
    }
}
