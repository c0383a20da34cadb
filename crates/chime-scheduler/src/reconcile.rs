//! Startup reconciliation.
//!
//! Persisted watermarks say how far a previous run got. Comparing them with
//! the clock decides whether to start fresh, pick up where the last run left
//! off, replay a stale backlog, or refuse to start.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::dispatcher::{Dispatcher, DueJob};
use crate::error::SchedulerError;
use crate::shutdown::stopped;
use crate::store::{JobStore, with_retry};
use crate::types::Watermarks;

/// How the engine starts, given the persisted watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Nothing persisted: both levels start at `now`.
    Fresh { now: DateTime<Utc> },
    /// Watermarks are current: rebuild the heap from `(ack, read]`.
    Resume(Watermarks),
    /// The last run fell more than a window behind. Jobs in `(ack, now]`
    /// are run on the backlog path and live scheduling restarts at `now`.
    Stale { ack_level: DateTime<Utc>, now: DateTime<Utc> },
}

/// Classify persisted watermarks against the clock.
pub fn classify(
    persisted: Option<Watermarks>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Result<Startup, SchedulerError> {
    let Some(marks) = persisted else {
        return Ok(Startup::Fresh { now });
    };

    if marks.ack_level > marks.read_level {
        return Err(SchedulerError::CorruptWatermarks {
            ack_level: marks.ack_level,
            read_level: marks.read_level,
        });
    }

    let limit = now + config.window() + config.tolerance();
    if marks.read_level > limit || marks.ack_level > limit {
        return Err(SchedulerError::ClockDrift {
            ack_level: marks.ack_level,
            read_level: marks.read_level,
            now,
        });
    }

    if marks.ack_level < now - config.window() {
        return Ok(Startup::Stale {
            ack_level: marks.ack_level,
            now,
        });
    }

    Ok(Startup::Resume(marks))
}

/// Run every pending job due in `(from, to]` on its own bounded pool.
///
/// The range is read in window-sized pages so a long outage does not pull
/// the whole backlog into memory at once. Returns the number of jobs run.
#[tracing::instrument(skip(config, store, dispatcher, stop))]
pub(crate) async fn run_backlog(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    config: &SchedulerConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    mut stop: watch::Receiver<bool>,
) -> Result<usize, SchedulerError> {
    info!("running recovery backlog");
    let (due_tx, due_rx) = mpsc::channel(config.queue_capacity);
    let pool = tokio::spawn(dispatcher.run(due_rx, stop.clone()));

    let mut cursor = from;
    let mut loaded = 0usize;
    let mut outcome = Ok(());

    'pages: while cursor < to {
        if *stop.borrow() {
            warn!(%cursor, "stopped before backlog finished");
            outcome = Err(SchedulerError::Stopped);
            break;
        }

        let page_end = (cursor + config.window()).min(to);
        let page = match with_retry(config.store_retry_budget, "load_jobs_due", || {
            store.load_jobs_due(cursor, page_end)
        })
        .await
        {
            Ok(page) => page,
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };

        for job in page {
            let Some(due) = job.next_execution_time else {
                continue;
            };
            tokio::select! {
                biased;
                () = stopped(&mut stop) => {
                    outcome = Err(SchedulerError::Stopped);
                    break 'pages;
                }
                sent = due_tx.send(DueJob { job, due }) => {
                    if sent.is_err() {
                        outcome = Err(SchedulerError::Stopped);
                        break 'pages;
                    }
                }
            }
            loaded += 1;
        }
        cursor = page_end;
    }

    drop(due_tx);
    let ran = pool.await.unwrap_or_else(|e| {
        warn!(error = %e, "backlog pool failed");
        0
    });
    outcome?;

    info!(loaded, ran, "recovery backlog complete");
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_unset_watermarks_start_fresh() {
        assert_eq!(
            classify(None, now(), &config()).unwrap(),
            Startup::Fresh { now: now() }
        );
    }

    #[test]
    fn test_current_watermarks_resume() {
        let marks = Watermarks {
            ack_level: now() - Duration::minutes(1),
            read_level: now() + Duration::minutes(4),
        };
        assert_eq!(
            classify(Some(marks), now(), &config()).unwrap(),
            Startup::Resume(marks)
        );
    }

    #[test]
    fn test_old_ack_is_stale() {
        let marks = Watermarks {
            ack_level: now() - Duration::hours(3),
            read_level: now() - Duration::hours(2),
        };
        assert_eq!(
            classify(Some(marks), now(), &config()).unwrap(),
            Startup::Stale {
                ack_level: now() - Duration::hours(3),
                now: now(),
            }
        );
    }

    #[test]
    fn test_future_read_level_is_drift() {
        let marks = Watermarks {
            ack_level: now(),
            read_level: now() + Duration::hours(1),
        };
        assert!(matches!(
            classify(Some(marks), now(), &config()),
            Err(SchedulerError::ClockDrift { .. })
        ));
    }

    #[test]
    fn test_drift_tolerance_widens_limit() {
        let marks = Watermarks {
            ack_level: now(),
            read_level: now() + Duration::minutes(7),
        };
        assert!(classify(Some(marks), now(), &config()).is_err());

        let tolerant = SchedulerConfig {
            drift_tolerance: StdDuration::from_secs(5 * 60),
            ..config()
        };
        assert!(matches!(
            classify(Some(marks), now(), &tolerant),
            Ok(Startup::Resume(_))
        ));
    }

    #[test]
    fn test_ack_past_read_is_corrupt() {
        let marks = Watermarks {
            ack_level: now(),
            read_level: now() - Duration::minutes(1),
        };
        assert!(matches!(
            classify(Some(marks), now(), &config()),
            Err(SchedulerError::CorruptWatermarks { .. })
        ));
    }

    #[test]
    fn test_read_exactly_at_window_edge_is_accepted() {
        let marks = Watermarks {
            ack_level: now(),
            read_level: now() + Duration::minutes(5),
        };
        assert!(matches!(
            classify(Some(marks), now(), &config()),
            Ok(Startup::Resume(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_runs_each_stale_job_once() {
        use crate::clock::TokioClock;
        use crate::config::RetryPolicy;
        use crate::dispatcher::JobExecutor;
        use crate::schedule::Schedule;
        use crate::store::MemoryStore;
        use crate::types::{Job, JobStatus, JobType, Payload};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for offset in [
            -Duration::hours(3),
            -Duration::minutes(90),
            -Duration::minutes(10),
            Duration::minutes(1),
        ] {
            let job = Job::new(
                JobType::Email,
                Schedule::OneTime { at: now() + offset },
                Payload::new(),
                0,
                now() - Duration::hours(4),
            )
            .unwrap();
            store.insert_job(&job).await.unwrap();
            ids.push(job.id);
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let executor: JobExecutor = Box::new(move |_job| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let (controller_tx, _controller_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            "backlog",
            2,
            store.clone(),
            Arc::new(executor),
            Arc::new(TokioClock::starting_at(now())),
            RetryPolicy::default(),
            StdDuration::from_secs(1),
            controller_tx,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let ran = run_backlog(
            now() - Duration::hours(4),
            now(),
            &config(),
            store.clone(),
            dispatcher,
            stop_rx,
        )
        .await
        .unwrap();

        assert_eq!(ran, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        for id in &ids[..3] {
            let job = store.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        let future = store.get_job(&ids[3]).await.unwrap().unwrap();
        assert_eq!(future.status, JobStatus::Pending);
    }
}
