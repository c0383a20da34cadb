//! Wall-clock sources.
//!
//! The engine reads wall-clock time through [`Clock`] and waits on tokio
//! timers, so a clock derived from tokio's own time source lets tests drive
//! the whole engine with `tokio::time::pause`.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The operating system's clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time that advances with tokio's timer.
///
/// Under a paused runtime this clock only moves when tokio's clock does.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    /// A clock reading `epoch` right now.
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.origin);
        self.epoch + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}

/// The tokio instant at which `clock` will read `deadline`.
pub(crate) fn instant_at(clock: &dyn Clock, deadline: DateTime<Utc>) -> Instant {
    let wait = (deadline - clock.now()).to_std().unwrap_or_default();
    Instant::now() + wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let epoch = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::starting_at(epoch);
        assert_eq!(clock.now(), epoch);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), epoch + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at_past_deadline_is_now() {
        let epoch = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::starting_at(epoch);
        let at = instant_at(&clock, epoch - chrono::Duration::seconds(5));
        assert!(at <= Instant::now());
    }
}
