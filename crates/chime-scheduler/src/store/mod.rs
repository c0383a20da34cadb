//! Persistence contract for jobs and watermarks.
//!
//! The engine only needs half-open range scans over next execution time,
//! status write-backs and a single watermark record. Two implementations
//! ship with the crate: [`MemoryStore`] for tests and ephemeral use, and
//! [`JsonFileStore`] which keeps everything in one atomically replaced file.

mod json_file;
mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::types::{Job, JobUpdate, Watermarks};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Durable storage for jobs and scheduling watermarks.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Non-terminal jobs whose next execution time lies in
    /// `(from_exclusive, to_inclusive]`, earliest first.
    async fn load_jobs_due(
        &self,
        from_exclusive: DateTime<Utc>,
        to_inclusive: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Persist both watermarks.
    async fn save_watermarks(&self, watermarks: Watermarks) -> Result<(), StoreError>;

    /// Persisted watermarks, or `None` for a fresh store.
    async fn load_watermarks(&self) -> Result<Option<Watermarks>, StoreError>;

    /// Write back the outcome of an execution attempt.
    async fn update_job_status(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError>;

    /// Add a new job.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Every job, ordered by creation time.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
}

/// Contents shared by the bundled stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub watermarks: Option<Watermarks>,
    #[serde(default)]
    pub jobs: BTreeMap<String, Job>,
}

impl StoreState {
    pub fn jobs_due(&self, from_exclusive: DateTime<Utc>, to_inclusive: DateTime<Utc>) -> Vec<Job> {
        let mut due: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .filter(|job| {
                job.next_execution_time
                    .is_some_and(|t| t > from_exclusive && t <= to_inclusive)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.next_execution_time, a.created_at, &a.id).cmp(&(
                b.next_execution_time,
                b.created_at,
                &b.id,
            ))
        });
        due
    }

    pub fn apply_update(&mut self, id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.apply(update);
        Ok(())
    }

    pub fn insert(&mut self, job: &Job) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::JobExists(job.id.clone()));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }
}

/// Run a store operation, retrying transient failures with exponential
/// backoff until `budget` has elapsed.
pub(crate) async fn with_retry<T, F, Fut>(
    budget: Duration,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(budget))
        .build();

    backoff::future::retry_notify(
        policy,
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: StoreError, wait: Duration| {
            warn!(operation, error = %e, retry_in_ms = wait.as_millis() as u64, "store operation failed, retrying");
        },
    )
    .await
}
