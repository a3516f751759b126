//! In-memory job history.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{HistoryEntry, JobHistory};
use crate::job::JobId;
use crate::Result;

/// An in-memory implementation of [`JobHistory`].
///
/// Cloning shares the underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    entries: Arc<RwLock<HashMap<JobId, HistoryEntry>>>,
}

impl MemoryHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded jobs.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl JobHistory for MemoryHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.job_id.clone(), entry.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self.entries.read().await;
        let mut recent: Vec<HistoryEntry> = entries.values().cloned().collect();
        recent.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        recent.truncate(limit);
        Ok(recent)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<HistoryEntry>> {
        Ok(self.entries.read().await.get(job_id).cloned())
    }
}
