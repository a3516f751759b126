//! Progress events and the per-job event queue.
//!
//! The runner is the only producer for a job's [`EventQueue`]. Pushing never
//! blocks: the queue is unbounded and buffers until an observer drains it.
//! Observers wait on the queue through [`EventQueue::recv`], which wakes as
//! soon as an event is pushed and otherwise reports idleness after the given
//! interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::stage::{StageResult, StageStatus};
use crate::state::JobState;

/// A progress notification for one job.
///
/// Serialized with a `type` tag so observers can switch on
/// `stage | state_change | draft_ready | complete | error | heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProgressEvent {
    /// A stage changed status.
    Stage {
        /// 1-based stage position.
        ordinal: u32,
        /// Stable stage name.
        name: String,
        /// The stage's new status.
        status: StageStatus,
        /// Summary or failure detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        /// When the event was emitted.
        timestamp: DateTime<Utc>,
    },

    /// The job moved to a new state.
    StateChange {
        /// The state entered.
        state: JobState,
        /// Human-readable description.
        message: String,
        /// When the event was emitted.
        timestamp: DateTime<Utc>,
    },

    /// Every artifact produced up to the checkpoint.
    DraftReady {
        /// Stage results keyed by stage name.
        results: BTreeMap<String, StageResult>,
        /// When the event was emitted.
        timestamp: DateTime<Utc>,
    },

    /// Terminal marker for a job that finished all stages.
    Complete {
        /// Stage results keyed by stage name.
        results: BTreeMap<String, StageResult>,
        /// When the event was emitted.
        timestamp: DateTime<Utc>,
    },

    /// Terminal marker for a job that failed.
    Error {
        /// The stage that failed, if the failure came from a stage.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        /// Failure detail.
        error: String,
        /// When the event was emitted.
        timestamp: DateTime<Utc>,
    },

    /// Keep-alive emitted by a stream adapter when idle. Never queued.
    Heartbeat {
        /// When the heartbeat was generated.
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Creates a stage status event.
    pub fn stage(
        ordinal: u32,
        name: impl Into<String>,
        status: StageStatus,
        detail: Option<String>,
    ) -> Self {
        Self::Stage {
            ordinal,
            name: name.into(),
            status,
            detail,
            timestamp: Utc::now(),
        }
    }

    /// Creates a state change event.
    pub fn state_change(state: JobState, message: impl Into<String>) -> Self {
        Self::StateChange {
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a draft-ready event.
    pub fn draft_ready(results: BTreeMap<String, StageResult>) -> Self {
        Self::DraftReady {
            results,
            timestamp: Utc::now(),
        }
    }

    /// Creates the successful terminal marker.
    pub fn complete(results: BTreeMap<String, StageResult>) -> Self {
        Self::Complete {
            results,
            timestamp: Utc::now(),
        }
    }

    /// Creates the failure terminal marker.
    pub fn error(stage: Option<String>, error: impl Into<String>) -> Self {
        Self::Error {
            stage,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a heartbeat.
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Returns true for the `complete` and `error` markers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Returns true if this event announces the pause at the checkpoint.
    pub fn is_checkpoint_pause(&self) -> bool {
        matches!(
            self,
            Self::StateChange {
                state: JobState::AwaitingConfirm,
                ..
            }
        )
    }

    /// Returns the stage ordinal for stage events.
    pub fn ordinal(&self) -> Option<u32> {
        match self {
            Self::Stage { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }

    /// Returns the stage name, if the event concerns a stage.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::Stage { name, .. } => Some(name),
            Self::Error { stage, .. } => stage.as_deref(),
            _ => None,
        }
    }

    /// The wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stage { .. } => "stage",
            Self::StateChange { .. } => "state_change",
            Self::DraftReady { .. } => "draft_ready",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// What a wait on the queue produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueRecv {
    /// The next event in emission order.
    Event(ProgressEvent),
    /// Nothing arrived within the idle interval.
    Idle,
    /// The queue is closed and fully drained.
    Closed,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<ProgressEvent>,
    closed: bool,
}

/// Unbounded FIFO of progress events for one job.
///
/// Several observers may wait on the same queue; each event is handed to
/// exactly one of them.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl EventQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event. Never blocks; events pushed after close are dropped.
    pub fn push(&self, event: ProgressEvent) {
        {
            let mut inner = self.lock();
            if inner.closed {
                debug!(kind = event.kind(), "dropping event pushed after close");
                return;
            }
            inner.items.push_back(event);
        }
        self.notify.notify_waiters();
    }

    /// Removes the next event without waiting.
    pub fn try_pop(&self) -> Option<ProgressEvent> {
        self.lock().items.pop_front()
    }

    /// Marks the queue closed. Buffered events remain drainable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if no events are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next event, up to `idle`.
    pub async fn recv(&self, idle: Duration) -> QueueRecv {
        let deadline = Instant::now() + idle;
        loop {
            // Register interest before checking so a push in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(event) = inner.items.pop_front() {
                    return QueueRecv::Event(event);
                }
                if inner.closed {
                    return QueueRecv::Closed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return QueueRecv::Idle;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn running(ordinal: u32) -> ProgressEvent {
        ProgressEvent::stage(ordinal, format!("s{ordinal}"), StageStatus::Running, None)
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ProgressEvent::stage(2, "collect", StageStatus::Complete, Some("3 clips".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("stage"));
        assert_eq!(value["ordinal"], json!(2));
        assert_eq!(value["status"], json!("complete"));
        assert_eq!(value["detail"], json!("3 clips"));

        let value = serde_json::to_value(ProgressEvent::heartbeat()).unwrap();
        assert_eq!(value["type"], json!("heartbeat"));
    }

    #[test]
    fn test_event_accessors() {
        let event = running(1);
        assert_eq!(event.ordinal(), Some(1));
        assert_eq!(event.stage_name(), Some("s1"));
        assert!(!event.is_terminal());

        let marker = ProgressEvent::error(Some("analyze".into()), "boom");
        assert!(marker.is_terminal());
        assert_eq!(marker.stage_name(), Some("analyze"));
        assert_eq!(marker.ordinal(), None);

        assert!(ProgressEvent::complete(BTreeMap::new()).is_terminal());
        assert!(ProgressEvent::state_change(JobState::AwaitingConfirm, "x").is_checkpoint_pause());
        assert!(!ProgressEvent::state_change(JobState::Executing, "x").is_checkpoint_pause());
    }

    #[test]
    fn test_queue_fifo() {
        let queue = EventQueue::new();
        for i in 1..=3 {
            queue.push(running(i));
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop())
            .filter_map(|e| e.ordinal())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = EventQueue::new();
        queue.push(running(1));
        queue.close();
        queue.push(running(2));
        assert_eq!(queue.len(), 1);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_recv_drains_before_closed() {
        let queue = EventQueue::new();
        let first = running(1);
        queue.push(first.clone());
        queue.close();
        assert_eq!(queue.recv(Duration::from_millis(10)).await, QueueRecv::Event(first));
        assert_eq!(queue.recv(Duration::from_millis(10)).await, QueueRecv::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_reports_idle() {
        let queue = EventQueue::new();
        assert_eq!(queue.recv(Duration::from_secs(90)).await, QueueRecv::Idle);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        queue.push(running(7));
        match waiter.await.unwrap() {
            QueueRecv::Event(event) => assert_eq!(event.ordinal(), Some(7)),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_wakes_on_close() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), QueueRecv::Closed);
    }
}
