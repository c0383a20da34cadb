//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::schedule::Schedule;

/// Opaque key-value payload handed to the executor.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: String,
    /// What kind of side effect this job performs.
    pub job_type: JobType,
    /// When/how often to run this job.
    pub schedule: Schedule,
    /// Arguments forwarded to the executor.
    #[serde(default)]
    pub payload: Payload,
    /// Current status of the job.
    pub status: JobStatus,
    /// When this job should next run (or retry after failure).
    /// `None` once the job is terminal.
    pub next_execution_time: Option<DateTime<Utc>>,
    /// Failed attempts since the last success.
    pub retry_count: u32,
    /// Failed attempts tolerated before the job is marked failed.
    pub max_retries: u32,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// When this job was last written.
    pub updated_at: DateTime<Utc>,
}

/// Kind of side effect a job performs.
///
/// Serialized as a plain string so new kinds need no schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    Email,
    MobileNotification,
    Custom(String),
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "email_job" => JobType::Email,
            "mobile_notification" => JobType::MobileNotification,
            _ => JobType::Custom(s),
        }
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        match job_type {
            JobType::Email => "email_job".to_string(),
            JobType::MobileNotification => "mobile_notification".to_string(),
            JobType::Custom(s) => s,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Email => write!(f, "email_job"),
            JobType::MobileNotification => write!(f, "mobile_notification"),
            JobType::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to run.
    #[default]
    Pending,
    /// Job is currently executing (or was when the process stopped).
    Running,
    /// Job finished and has no further occurrences.
    Completed,
    /// Job exhausted its retries or its schedule could not be resolved.
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs are never loaded or re-armed.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Fields the engine writes back after each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub next_execution_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// When the engine's clock produced this update.
    pub updated_at: DateTime<Utc>,
}

/// The two scheduling boundaries persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Every obligation due at or before this instant is discharged.
    pub ack_level: DateTime<Utc>,
    /// Jobs due at or before this instant have been loaded.
    pub read_level: DateTime<Utc>,
}

impl Watermarks {
    /// Both levels at the same instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            ack_level: now,
            read_level: now,
        }
    }

    /// Earliest due time a newly stored job can have and still be loaded
    /// after a restart.
    pub fn earliest_admissible(&self) -> DateTime<Utc> {
        self.ack_level + chrono::Duration::nanoseconds(1)
    }
}

impl Job {
    /// Create a pending job whose first run is the schedule's first
    /// occurrence after `now`.
    pub fn new(
        job_type: JobType,
        schedule: Schedule,
        payload: Payload,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        schedule.validate()?;
        let next = schedule
            .next_after(now)?
            .ok_or(ScheduleError::NoFutureOccurrence)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            schedule,
            payload,
            status: JobStatus::Pending,
            next_execution_time: Some(next),
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Next scheduled execution after `after`, per the job's schedule.
    pub fn next_run(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        self.schedule.next_after(after)
    }

    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply an engine write-back.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        self.last_error = update.last_error.clone();
        self.next_execution_time = update.next_execution_time;
        self.retry_count = update.retry_count;
        self.updated_at = update.updated_at;
    }
}
