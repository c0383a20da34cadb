//! Engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// How the recovery backlog runs relative to live scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogPolicy {
    /// Backlog runs on its own bounded path while live scheduling starts.
    #[default]
    Concurrent,
    /// Backlog runs to completion before live scheduling starts.
    Synchronous,
}

impl fmt::Display for BacklogPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacklogPolicy::Concurrent => write!(f, "concurrent"),
            BacklogPolicy::Synchronous => write!(f, "synchronous"),
        }
    }
}

impl FromStr for BacklogPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "concurrent" => Ok(BacklogPolicy::Concurrent),
            "synchronous" | "sync" => Ok(BacklogPolicy::Synchronous),
            other => Err(format!(
                "unknown backlog policy '{other}', expected concurrent or synchronous"
            )),
        }
    }
}

/// Exponential backoff applied between failed execution attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 5min, 10min, 20min, 40min, max 1hr
        Self {
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> chrono::Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }
}

/// Tunables for the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Span of future jobs held in memory per load.
    pub time_window: Duration,
    /// Loader tick period; must be shorter than `time_window`.
    pub look_ahead: Duration,
    /// Concurrent executions on the live path.
    pub workers: usize,
    /// Concurrent executions on the recovery backlog path.
    pub backlog_workers: usize,
    /// How far persisted watermarks may sit past `now + time_window` before
    /// startup reports clock drift.
    pub drift_tolerance: Duration,
    /// Give up retrying a failing store operation after this long.
    pub store_retry_budget: Duration,
    /// Backoff between failed execution attempts.
    pub retry: RetryPolicy,
    /// How the recovery backlog is run.
    pub backlog_policy: BacklogPolicy,
    /// Capacity of the gate command and dispatch queues.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(5 * 60),
            look_ahead: Duration::from_secs(3 * 60),
            workers: 8,
            backlog_workers: 4,
            drift_tolerance: Duration::ZERO,
            store_retry_budget: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            backlog_policy: BacklogPolicy::Concurrent,
            queue_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.time_window.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "time window must be greater than zero".to_string(),
            ));
        }
        if self.look_ahead.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "look-ahead interval must be greater than zero".to_string(),
            ));
        }
        if self.look_ahead >= self.time_window {
            return Err(SchedulerError::InvalidConfig(format!(
                "look-ahead interval ({:?}) must be shorter than the time window ({:?})",
                self.look_ahead, self.time_window
            )));
        }
        if self.workers == 0 || self.backlog_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "worker pools need at least one worker".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.retry.base_delay.is_zero() || self.retry.max_delay < self.retry.base_delay {
            return Err(SchedulerError::InvalidConfig(
                "retry delays must satisfy 0 < base <= max".to_string(),
            ));
        }
        Ok(())
    }

    /// `time_window` as a chrono duration.
    pub(crate) fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.time_window).unwrap_or(chrono::Duration::MAX)
    }

    /// `drift_tolerance` as a chrono duration.
    pub(crate) fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.drift_tolerance).unwrap_or(chrono::Duration::MAX)
    }
}
