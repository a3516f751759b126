//! Retention sweeper.
//!
//! The sweeper runs on a fixed interval, independent of any job, over an
//! explicit list of [`JobStore`]s. Each pass evicts terminal jobs whose age
//! exceeds the retention window. Non-terminal jobs are never evicted.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, Instrument};

use crate::store::JobStore;

/// Periodic eviction of expired terminal jobs.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    stores: Vec<JobStore>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    /// Creates a sweeper over `stores`.
    pub fn new(stores: Vec<JobStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            stores,
            retention,
            interval,
        }
    }

    /// The retention window.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Runs one pass as of `now` and returns the number of evicted jobs.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for store in &self.stores {
            evicted += store.remove_expired(now, self.retention).await;
        }
        debug!(evicted, stores = self.stores.len(), "sweep pass finished");
        evicted
    }

    /// Starts the periodic loop on the current runtime.
    ///
    /// The first pass runs one interval after start.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let span = info_span!("sweeper", interval_secs = self.interval.as_secs());

        let task = tokio::spawn(
            async move {
                let start = tokio::time::Instant::now() + self.interval;
                let mut ticker = tokio::time::interval_at(start, self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(retention_secs = self.retention.as_secs(), "sweeper started");

                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = ticker.tick() => {
                            self.sweep_once(Utc::now()).await;
                        }
                    }
                }
                info!("sweeper stopped");
            }
            .instrument(span),
        );

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
