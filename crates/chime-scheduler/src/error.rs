//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Schedule could not be resolved.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted watermarks are ahead of the local clock.
    #[error(
        "clock drift detected: persisted watermarks (ack {ack_level}, read {read_level}) are ahead of now ({now}); sync the system clock before starting"
    )]
    ClockDrift {
        ack_level: DateTime<Utc>,
        read_level: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// Persisted watermarks violate `ack_level <= read_level`.
    #[error("corrupt watermarks: ack level {ack_level} is past read level {read_level}")]
    CorruptWatermarks {
        ack_level: DateTime<Utc>,
        read_level: DateTime<Utc>,
    },

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The engine has been stopped and no longer accepts requests.
    #[error("scheduler engine is stopped")]
    Stopped,

    /// A background task panicked or was aborted.
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

/// Errors returned by [`JobStore`](crate::JobStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job already exists.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Backend reported a failure that may succeed on retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors produced while resolving a schedule's next occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Fixed interval of zero seconds.
    #[error("invalid interval: must be greater than zero")]
    InvalidInterval,

    /// Hour, minute or day outside its calendar range.
    #[error("invalid time of day: {0}")]
    InvalidTime(String),

    /// Cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A new job's schedule has no occurrence after its creation time.
    #[error("schedule has no future occurrence")]
    NoFutureOccurrence,

    /// The search for a next occurrence gave up.
    #[error("no occurrence found within search horizon")]
    SearchExhausted,
}

impl StoreError {
    /// Whether retrying the operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;
