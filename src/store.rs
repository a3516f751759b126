//! The job store.
//!
//! [`JobStore`] is inert, concurrency-safe storage keyed by [`JobId`]. It
//! never runs pipeline work and never mutates a job's state or results; the
//! map lock is held only for the insert, lookup or removal itself.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::job::{Job, JobId, JobInputs};
use crate::state::PipelineShape;

/// Shared map of live jobs. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<JobId, Arc<Job>>>>,
}

impl JobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a job in the shape's initial state and stores it.
    pub async fn create(&self, inputs: JobInputs, shape: PipelineShape) -> Arc<Job> {
        let mut jobs = self.jobs.write().await;
        let id = loop {
            let candidate = JobId::generate();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
            debug!(job_id = %candidate, "job id collision, drawing again");
        };
        let job = Arc::new(Job::new(id.clone(), inputs, shape, Utc::now()));
        jobs.insert(id, Arc::clone(&job));
        job
    }

    /// Looks up a job. The job may be swept right after this returns.
    pub async fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Ids of jobs that are not yet terminal, sorted.
    pub async fn list_active(&self) -> Vec<JobId> {
        let jobs = self.jobs.read().await;
        let mut active: Vec<JobId> = jobs
            .values()
            .filter(|job| !job.state().is_terminal())
            .map(|job| job.id().clone())
            .collect();
        active.sort();
        active
    }

    /// Number of stored jobs, terminal or not.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Returns true if the store holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Removes terminal jobs older than `retention` as of `now`.
    ///
    /// A job is removed only if its state is terminal and
    /// `now - created_at > retention`. Removal closes the job's event queue
    /// and drops any parked gates. Returns the number of removed jobs.
    pub async fn remove_expired(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let window = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX);
        let mut jobs = self.jobs.write().await;

        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.state().is_terminal() && now - job.created_at() > window)
            .map(|job| job.id().clone())
            .collect();

        for id in &expired {
            if let Some(job) = jobs.remove(id) {
                job.release();
                debug!(job_id = %id, state = %job.state(), "evicted job");
            }
        }

        if !expired.is_empty() {
            info!(evicted = expired.len(), remaining = jobs.len(), "swept expired jobs");
        }
        expired.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, job: Job) -> Arc<Job> {
        let job = Arc::new(job);
        self.jobs
            .write()
            .await
            .insert(job.id().clone(), Arc::clone(&job));
        job
    }
}
