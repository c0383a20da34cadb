use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{JobStore, StoreState};
use crate::error::StoreError;
use crate::types::{Job, JobUpdate, Watermarks};

/// Non-durable store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `watermarks`, as if left by a previous run.
    pub fn with_watermarks(watermarks: Watermarks) -> Self {
        Self {
            state: RwLock::new(StoreState {
                watermarks: Some(watermarks),
                ..StoreState::default()
            }),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load_jobs_due(
        &self,
        from_exclusive: DateTime<Utc>,
        to_inclusive: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.read().await.jobs_due(from_exclusive, to_inclusive))
    }

    async fn save_watermarks(&self, watermarks: Watermarks) -> Result<(), StoreError> {
        self.state.write().await.watermarks = Some(watermarks);
        Ok(())
    }

    async fn load_watermarks(&self) -> Result<Option<Watermarks>, StoreError> {
        Ok(self.state.read().await.watermarks)
    }

    async fn update_job_status(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        self.state.write().await.apply_update(id, update)
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.state.write().await.insert(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.read().await.all_jobs())
    }
}
