//! Job dispatcher.
//!
//! Executes due jobs on a bounded worker pool, decides what happens to each
//! job afterwards, writes the outcome back to the store and only then tells
//! the watermark controller the obligation is discharged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::heap::HeapEntry;
use crate::shutdown::stopped;
use crate::store::{JobStore, with_retry};
use crate::types::{Job, JobStatus, JobUpdate};
use crate::watermark::ControllerMsg;

/// Type alias for the job executor function.
///
/// Executors must be safe to run more than once for the same occurrence.
pub type JobExecutor =
    Box<dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

/// A job whose due time has been reached.
#[derive(Debug, Clone)]
pub(crate) struct DueJob {
    pub job: Job,
    pub due: DateTime<Utc>,
}

impl From<HeapEntry> for DueJob {
    fn from(entry: HeapEntry) -> Self {
        Self {
            job: entry.job,
            due: entry.due,
        }
    }
}

/// Decide a job's next state after an execution attempt.
///
/// Recurring jobs advance from the later of their due time and `now`, so a
/// job that ran late does not replay the occurrences it missed.
pub fn decide_outcome(
    job: &Job,
    due: DateTime<Utc>,
    result: &Result<(), String>,
    now: DateTime<Utc>,
    retry: &RetryPolicy,
) -> JobUpdate {
    match result {
        Ok(()) if job.schedule.is_recurring() => match job.next_run(due.max(now)) {
            Ok(Some(next)) => JobUpdate {
                status: JobStatus::Pending,
                last_error: None,
                next_execution_time: Some(next),
                retry_count: 0,
                updated_at: now,
            },
            Ok(None) => JobUpdate {
                status: JobStatus::Completed,
                last_error: None,
                next_execution_time: None,
                retry_count: 0,
                updated_at: now,
            },
            Err(e) => JobUpdate {
                status: JobStatus::Failed,
                last_error: Some(e.to_string()),
                next_execution_time: None,
                retry_count: 0,
                updated_at: now,
            },
        },
        Ok(()) => JobUpdate {
            status: JobStatus::Completed,
            last_error: None,
            next_execution_time: None,
            retry_count: 0,
            updated_at: now,
        },
        Err(error) if job.retry_count < job.max_retries => {
            let retry_count = job.retry_count + 1;
            JobUpdate {
                status: JobStatus::Pending,
                last_error: Some(error.clone()),
                next_execution_time: Some(now + retry.delay_for(retry_count)),
                retry_count,
                updated_at: now,
            }
        }
        Err(error) => JobUpdate {
            status: JobStatus::Failed,
            last_error: Some(error.clone()),
            next_execution_time: None,
            retry_count: job.retry_count,
            updated_at: now,
        },
    }
}

struct Shared {
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    store_retry_budget: Duration,
    controller: mpsc::UnboundedSender<ControllerMsg>,
}

/// Bounded pool running due jobs.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    /// Names the pool in logs ("live" or "backlog").
    pool: &'static str,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: &'static str,
        workers: usize,
        store: Arc<dyn JobStore>,
        executor: Arc<JobExecutor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        store_retry_budget: Duration,
        controller: mpsc::UnboundedSender<ControllerMsg>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                executor,
                clock,
                retry,
                store_retry_budget,
                controller,
            }),
            permits: Arc::new(Semaphore::new(workers)),
            pool,
        }
    }

    /// Run jobs from `due` until it closes or `stop` fires, then wait for
    /// every execution already started. Returns the number started.
    pub async fn run(
        self,
        mut due: mpsc::Receiver<DueJob>,
        mut stop: watch::Receiver<bool>,
    ) -> usize {
        info!(pool = self.pool, workers = self.permits.available_permits(), "dispatcher starting");
        let mut in_flight = JoinSet::new();
        let mut started = 0usize;

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(pool = self.pool, error = %e, "execution task failed");
                    }
                }
                next = due.recv() => {
                    let Some(next) = next else { break };
                    let permit = tokio::select! {
                        biased;
                        () = stopped(&mut stop) => break,
                        permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let shared = Arc::clone(&self.shared);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        execute(shared, next).await;
                    });
                    started += 1;
                }
            }
        }

        if !in_flight.is_empty() {
            info!(pool = self.pool, in_flight = in_flight.len(), "waiting for running jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(pool = self.pool, error = %e, "execution task failed");
            }
        }
        info!(pool = self.pool, started, "dispatcher stopped");
        started
    }
}

#[tracing::instrument(skip(shared, due), fields(id = %due.job.id, job_type = %due.job.job_type, due = %due.due))]
async fn execute(shared: Arc<Shared>, due: DueJob) {
    let DueJob { job, due } = due;
    let budget = shared.store_retry_budget;

    // The queued copy can be stale: the job may have been cancelled,
    // deleted, or moved to another occurrence while it waited for a permit.
    let job = match with_retry(budget, "get_job", || shared.store.get_job(&job.id)).await {
        Ok(Some(current))
            if !current.is_terminal() && current.next_execution_time == Some(due) =>
        {
            current
        }
        Ok(Some(current)) => {
            info!(
                status = %current.status,
                next_execution_time = ?current.next_execution_time,
                "job changed while queued, dropping"
            );
            discharge(&shared, job.id, due, None);
            return;
        }
        Ok(None) => {
            warn!("job deleted before it ran, dropping");
            discharge(&shared, job.id, due, None);
            return;
        }
        Err(e) => {
            // Not discharged: the ack stays behind this job and a restart
            // runs it again.
            error!(error = %e, "failed to read job before running, skipping");
            return;
        }
    };

    let running = JobUpdate {
        status: JobStatus::Running,
        last_error: job.last_error.clone(),
        next_execution_time: Some(due),
        retry_count: job.retry_count,
        updated_at: shared.clock.now(),
    };
    match with_retry(budget, "update_job_status", || {
        shared.store.update_job_status(&job.id, &running)
    })
    .await
    {
        Ok(()) => {}
        Err(StoreError::JobNotFound(_)) => {
            warn!("job deleted before it ran, dropping");
            discharge(&shared, job.id, due, None);
            return;
        }
        Err(e) => {
            error!(error = %e, "failed to mark job running, skipping");
            return;
        }
    }

    info!("executing job");
    // Run on its own task so a panicking executor counts as a failure.
    let result = match tokio::spawn((shared.executor.as_ref())(job.clone())).await {
        Ok(result) => result,
        Err(e) => Err(format!("executor panicked: {e}")),
    };

    let now = shared.clock.now();
    let update = decide_outcome(&job, due, &result, now, &shared.retry);
    match (&result, update.status) {
        (Ok(()), JobStatus::Pending) => {
            debug!(next_execution_time = ?update.next_execution_time, "rescheduled recurring job")
        }
        (Ok(()), JobStatus::Completed) => info!("job completed"),
        (Ok(()), _) => {
            error!(error = ?update.last_error, "could not compute next occurrence, job failed")
        }
        (Err(e), JobStatus::Pending) => warn!(
            error = %e,
            retry_count = update.retry_count,
            next_retry = ?update.next_execution_time,
            "job failed, scheduled retry"
        ),
        (Err(e), _) => error!(error = %e, retry_count = update.retry_count, "job failed, retries exhausted"),
    }

    match with_retry(budget, "update_job_status", || {
        shared.store.update_job_status(&job.id, &update)
    })
    .await
    {
        Ok(()) => {
            let follow_up = (update.status == JobStatus::Pending).then(|| {
                let mut next = job.clone();
                next.apply(&update);
                next
            });
            discharge(&shared, job.id, due, follow_up);
        }
        Err(e) => error!(error = %e, "failed to record job outcome, withholding discharge"),
    }
}

fn discharge(shared: &Shared, id: String, due: DateTime<Utc>, follow_up: Option<Job>) {
    if shared
        .controller
        .send(ControllerMsg::Discharged { id, due, follow_up })
        .is_err()
    {
        debug!("watermark controller gone, discharge dropped");
    }
}
