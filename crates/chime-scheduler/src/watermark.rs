//! Watermark controller.
//!
//! The controller is the only owner of `AckLevel` and `ReadLevel`. On every
//! tick it pulls the next slice of the store into the timer gate and persists
//! both levels. It is also the single entry point for jobs that join the
//! engine while it runs (new schedules and dispatcher follow-ups), so a job
//! can never be both loaded by a tick and routed by a message.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{ScheduleError, SchedulerError};
use crate::gate::GateCommand;
use crate::shutdown::stopped;
use crate::store::{JobStore, with_retry};
use crate::types::{Job, Watermarks};

/// Messages accepted by the controller loop.
#[derive(Debug)]
pub(crate) enum ControllerMsg {
    /// Persist a new job and route it.
    Schedule {
        job: Job,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// The dispatcher finished with the obligation `(due, id)`. A follow-up
    /// carries the job's next pending state when it was re-armed.
    Discharged {
        id: String,
        due: DateTime<Utc>,
        follow_up: Option<Job>,
    },
    /// The obligation `(due, id)` was cancelled out of the gate.
    Cancelled { id: String, due: DateTime<Utc> },
    /// The recovery backlog finished; the persisted ack may move again.
    BacklogDone,
    /// Report the current levels.
    Report { reply: oneshot::Sender<WatermarkReport> },
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkReport {
    /// Levels held in memory.
    pub current: Watermarks,
    /// Levels last written to the store.
    pub persisted: Option<Watermarks>,
    /// Obligations loaded or routed but not yet discharged.
    pub outstanding: usize,
    /// Whether a recovery backlog is still holding the persisted ack back.
    pub backlog_pending: bool,
}

/// In-memory levels plus the set of undischarged obligations.
#[derive(Debug, Clone)]
pub(crate) struct Levels {
    ack: DateTime<Utc>,
    read: DateTime<Utc>,
    outstanding: BTreeSet<(DateTime<Utc>, String)>,
}

impl Levels {
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            ack: watermarks.ack_level,
            read: watermarks.read_level,
            outstanding: BTreeSet::new(),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            ack_level: self.ack,
            read_level: self.read,
        }
    }

    pub fn read(&self) -> DateTime<Utc> {
        self.read
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, due: DateTime<Utc>, id: &str) -> bool {
        self.outstanding.contains(&(due, id.to_string()))
    }

    /// Where the next tick moves `ReadLevel`: one window ahead, never past
    /// `now + window`, never backwards.
    pub fn next_read(&self, now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
        let ahead = (self.read + window).min(now + window);
        ahead.max(self.read)
    }

    pub fn advance_read(&mut self, to: DateTime<Utc>) {
        self.read = self.read.max(to);
    }

    pub fn register(&mut self, due: DateTime<Utc>, id: &str) {
        self.outstanding.insert((due, id.to_string()));
    }

    pub fn discharge(&mut self, due: DateTime<Utc>, id: &str) {
        self.outstanding.remove(&(due, id.to_string()));
    }

    /// Move `AckLevel` as far as the outstanding obligations allow.
    ///
    /// Capped at `now` so that a job created or re-armed later (always due
    /// after its creation time) can never land at or below the ack.
    pub fn recompute_ack(&mut self, now: DateTime<Utc>) {
        let mut candidate = self.read.min(now);
        if let Some((earliest, _)) = self.outstanding.first() {
            candidate = candidate.min(*earliest - Duration::nanoseconds(1));
        }
        self.ack = self.ack.max(candidate).min(self.read);
    }
}

/// The controller task.
pub(crate) struct Controller {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    gate: mpsc::Sender<GateCommand>,
    levels: Levels,
    persisted: Option<Watermarks>,
    /// Persisted ack held here until the recovery backlog completes.
    pinned_ack: Option<DateTime<Utc>>,
}

impl Controller {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        gate: mpsc::Sender<GateCommand>,
        watermarks: Watermarks,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            gate,
            levels: Levels::new(watermarks),
            persisted: None,
            pinned_ack: None,
        }
    }

    /// Keep the persisted ack at `ack` until [`ControllerMsg::BacklogDone`].
    pub fn pin_ack(mut self, ack: DateTime<Utc>) -> Self {
        self.pinned_ack = Some(ack);
        self
    }

    /// Run until `stop` fires, then drain the inbox and persist final levels.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ControllerMsg>,
        mut stop: watch::Receiver<bool>,
    ) -> Watermarks {
        info!(
            ack_level = %self.levels.ack,
            read_level = %self.levels.read,
            "watermark controller starting"
        );

        let mut ticker = tokio::time::interval(self.config.look_ahead);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                _ = ticker.tick() => self.tick().await,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }

        while let Ok(msg) = inbox.try_recv() {
            self.handle(msg).await;
        }
        self.levels.recompute_ack(self.clock.now());
        self.persist().await;

        info!(
            ack_level = %self.levels.ack,
            read_level = %self.levels.read,
            outstanding = self.levels.outstanding(),
            "watermark controller stopped"
        );
        self.levels.watermarks()
    }

    /// Load `(from, to]` into the gate. Used on resume, before the loop
    /// starts, to rebuild the heap the previous run lost.
    #[tracing::instrument(skip(self))]
    pub async fn reload(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let store = Arc::clone(&self.store);
        let jobs = with_retry(self.config.store_retry_budget, "load_jobs_due", || {
            store.load_jobs_due(from, to)
        })
        .await?;

        let count = jobs.len();
        for job in jobs {
            self.admit(job).await;
        }
        info!(count, "reloaded pending jobs");
        Ok(count)
    }

    /// Advance `ReadLevel` by one slice and persist.
    ///
    /// The scan starts at the ack rather than the old read level, so a job
    /// written by another store handle into the already loaded window is
    /// still picked up. Obligations already held are skipped.
    async fn tick(&mut self) {
        let now = self.clock.now();
        let from = self.levels.watermarks().ack_level;
        let new_read = self.levels.next_read(now, self.config.window());

        let store = Arc::clone(&self.store);
        match with_retry(self.config.store_retry_budget, "load_jobs_due", || {
            store.load_jobs_due(from, new_read)
        })
        .await
        {
            Ok(jobs) => {
                let mut admitted = 0usize;
                for job in jobs {
                    let Some(due) = job.next_execution_time else {
                        continue;
                    };
                    if !self.levels.is_outstanding(due, &job.id) {
                        self.admit(job).await;
                        admitted += 1;
                    }
                }
                if admitted > 0 {
                    debug!(count = admitted, from = %from, to = %new_read, "loaded jobs");
                }
                self.levels.advance_read(new_read);
            }
            Err(e) => {
                error!(error = %e, from = %from, to = %new_read, "failed to load jobs, abandoning tick");
                return;
            }
        }

        self.levels.recompute_ack(now);
        self.persist().await;
    }

    async fn handle(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Schedule { job, reply } => {
                let result = self.schedule(job).await;
                let _ = reply.send(result);
            }
            ControllerMsg::Discharged { id, due, follow_up } => {
                self.levels.discharge(due, &id);
                if let Some(job) = follow_up {
                    self.route(job).await;
                }
                self.levels.recompute_ack(self.clock.now());
            }
            ControllerMsg::Cancelled { id, due } => {
                self.levels.discharge(due, &id);
                self.levels.recompute_ack(self.clock.now());
            }
            ControllerMsg::BacklogDone => {
                if let Some(pinned) = self.pinned_ack.take() {
                    info!(%pinned, "recovery backlog complete, releasing ack level");
                }
                self.persist().await;
            }
            ControllerMsg::Report { reply } => {
                let _ = reply.send(WatermarkReport {
                    current: self.levels.watermarks(),
                    persisted: self.persisted,
                    outstanding: self.levels.outstanding(),
                    backlog_pending: self.pinned_ack.is_some(),
                });
            }
        }
    }

    #[tracing::instrument(skip(self, job), fields(id = %job.id, job_type = %job.job_type))]
    async fn schedule(&mut self, mut job: Job) -> Result<(), SchedulerError> {
        let due = match job.next_execution_time {
            Some(due) if !job.is_terminal() => due,
            _ => return Err(ScheduleError::NoFutureOccurrence.into()),
        };
        // Nothing at or below the ack is ever reloaded after a restart.
        let marks = self.levels.watermarks();
        if due <= marks.ack_level {
            let moved = marks.earliest_admissible();
            warn!(%due, ack_level = %marks.ack_level, %moved, "job due at or before ack level, moving it past");
            job.next_execution_time = Some(moved);
        }

        let store = Arc::clone(&self.store);
        with_retry(self.config.store_retry_budget, "insert_job", || {
            store.insert_job(&job)
        })
        .await?;

        info!(next_execution_time = ?job.next_execution_time, "job scheduled");
        self.route(job).await;
        Ok(())
    }

    /// Send `job` to the gate if its due time is already covered by
    /// `ReadLevel`; otherwise a later tick loads it from the store.
    async fn route(&mut self, job: Job) {
        let Some(due) = job.next_execution_time else {
            return;
        };
        if job.is_terminal() {
            return;
        }
        if due > self.levels.read() {
            debug!(id = %job.id, %due, "job beyond read level, left for loader");
            return;
        }
        if self.levels.is_outstanding(due, &job.id) {
            debug!(id = %job.id, %due, "job already admitted");
            return;
        }
        self.admit(job).await;
    }

    /// Register the obligation and hand the job to the gate.
    async fn admit(&mut self, job: Job) {
        let Some(due) = job.next_execution_time else {
            return;
        };
        self.levels.register(due, &job.id);
        if self
            .gate
            .send(GateCommand::Insert { job, due })
            .await
            .is_err()
        {
            // Gate is gone; the obligation stays outstanding and the ack
            // holds below it until the next start.
            warn!(%due, "timer gate closed, job not armed");
        }
    }

    async fn persist(&mut self) {
        let current = self.levels.watermarks();
        let marks = Watermarks {
            ack_level: self
                .pinned_ack
                .map_or(current.ack_level, |pinned| pinned.min(current.ack_level)),
            read_level: current.read_level,
        };
        if self.persisted == Some(marks) {
            return;
        }

        let store = Arc::clone(&self.store);
        match with_retry(self.config.store_retry_budget, "save_watermarks", || {
            store.save_watermarks(marks)
        })
        .await
        {
            Ok(()) => {
                debug!(ack_level = %marks.ack_level, read_level = %marks.read_level, "watermarks persisted");
                self.persisted = Some(marks);
            }
            Err(e) => error!(error = %e, "failed to persist watermarks"),
        }
    }
}
