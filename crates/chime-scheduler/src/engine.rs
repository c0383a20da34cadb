//! The scheduling engine and its runtime handle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{BacklogPolicy, SchedulerConfig};
use crate::dispatcher::{Dispatcher, JobExecutor};
use crate::error::{Result, SchedulerError};
use crate::gate::{Gate, GateCommand, GateSnapshot};
use crate::reconcile::{Startup, classify, run_backlog};
use crate::store::{JobStore, with_retry};
use crate::types::{Job, JobStatus, JobUpdate, Watermarks};
use crate::watermark::{Controller, ControllerMsg, WatermarkReport};

/// Reason recorded on jobs removed through [`EngineHandle::cancel`].
const CANCELLED: &str = "cancelled";

/// A reconciled engine, ready to start.
pub struct Engine {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    startup: Startup,
    watermarks: Watermarks,
}

impl Engine {
    /// Validate `config`, read the persisted watermarks and decide how to
    /// start. Fails on clock drift or corrupt watermarks.
    #[tracing::instrument(skip_all)]
    pub async fn initialize(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        executor: JobExecutor,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let persisted = with_retry(config.store_retry_budget, "load_watermarks", || {
            store.load_watermarks()
        })
        .await?;
        let startup = classify(persisted, clock.now(), &config)?;

        let watermarks = match startup {
            Startup::Fresh { now } => {
                let marks = Watermarks::at(now);
                with_retry(config.store_retry_budget, "save_watermarks", || {
                    store.save_watermarks(marks)
                })
                .await?;
                info!(%now, "no persisted watermarks, starting fresh");
                marks
            }
            Startup::Resume(marks) => {
                info!(
                    ack_level = %marks.ack_level,
                    read_level = %marks.read_level,
                    "resuming from persisted watermarks"
                );
                marks
            }
            Startup::Stale { ack_level, now } => {
                warn!(
                    %ack_level,
                    %now,
                    policy = %config.backlog_policy,
                    "watermarks are stale, recovery backlog required"
                );
                Watermarks::at(now)
            }
        };

        Ok(Self {
            config,
            store,
            executor: Arc::new(executor),
            clock,
            startup,
            watermarks,
        })
    }

    /// How reconciliation classified the persisted watermarks.
    pub fn startup(&self) -> Startup {
        self.startup
    }

    /// Levels live scheduling starts from.
    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    fn dispatcher(
        &self,
        pool: &'static str,
        workers: usize,
        controller: mpsc::UnboundedSender<ControllerMsg>,
    ) -> Dispatcher {
        Dispatcher::new(
            pool,
            workers,
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            Arc::clone(&self.clock),
            self.config.retry,
            self.config.store_retry_budget,
            controller,
        )
    }

    /// Spawn the engine's tasks.
    ///
    /// With [`BacklogPolicy::Synchronous`] a stale backlog is run to the end
    /// before anything else starts.
    pub async fn start(self) -> Result<EngineHandle> {
        let capacity = self.config.queue_capacity;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (controller_stop_tx, controller_stop_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = mpsc::channel(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();

        let mut backlog = None;
        let mut pinned_ack = None;
        if let Startup::Stale { ack_level, now } = self.startup {
            let pool = self.dispatcher("backlog", self.config.backlog_workers, controller_tx.clone());
            match self.config.backlog_policy {
                BacklogPolicy::Synchronous => {
                    run_backlog(
                        ack_level,
                        now,
                        &self.config,
                        Arc::clone(&self.store),
                        pool,
                        stop_rx.clone(),
                    )
                    .await?;
                    let marks = Watermarks::at(now);
                    with_retry(self.config.store_retry_budget, "save_watermarks", || {
                        self.store.save_watermarks(marks)
                    })
                    .await?;
                }
                BacklogPolicy::Concurrent => {
                    pinned_ack = Some(ack_level);
                    let config = self.config.clone();
                    let store = Arc::clone(&self.store);
                    let done = controller_tx.clone();
                    let stop = stop_rx.clone();
                    backlog = Some(tokio::spawn(async move {
                        match run_backlog(ack_level, now, &config, store, pool, stop).await {
                            Ok(_) => {
                                let _ = done.send(ControllerMsg::BacklogDone);
                            }
                            Err(e) => error!(error = %e, "recovery backlog did not finish"),
                        }
                    }));
                }
            }
        }

        let gate = tokio::spawn(
            Gate::new(
                Arc::clone(&self.clock),
                gate_rx,
                dispatch_tx,
                stop_rx.clone(),
            )
            .run(),
        );
        let live = self.dispatcher("live", self.config.workers, controller_tx.clone());
        let dispatcher = tokio::spawn(live.run(dispatch_rx, stop_rx));

        let mut controller = Controller::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            gate_tx.clone(),
            self.watermarks,
        );
        if let Some(ack) = pinned_ack {
            controller = controller.pin_ack(ack);
        }

        let mut tasks = Tasks {
            gate,
            dispatcher,
            backlog,
            controller: None,
        };

        if let Startup::Resume(marks) = self.startup {
            if let Err(e) = controller.reload(marks.ack_level, marks.read_level).await {
                error!(error = %e, "failed to rebuild heap, shutting down");
                let _ = stop_tx.send(true);
                tasks.join_workers().await;
                return Err(e);
            }
        }
        tasks.controller = Some(tokio::spawn(
            controller.run(controller_rx, controller_stop_rx),
        ));

        info!(
            workers = self.config.workers,
            time_window_secs = self.config.time_window.as_secs(),
            look_ahead_secs = self.config.look_ahead.as_secs(),
            "scheduler engine started"
        );

        Ok(EngineHandle {
            store: self.store,
            clock: self.clock,
            store_retry_budget: self.config.store_retry_budget,
            gate: gate_tx,
            controller: controller_tx,
            stop: stop_tx,
            controller_stop: controller_stop_tx,
            tasks,
        })
    }
}

struct Tasks {
    gate: JoinHandle<()>,
    dispatcher: JoinHandle<usize>,
    backlog: Option<JoinHandle<()>>,
    controller: Option<JoinHandle<Watermarks>>,
}

impl Tasks {
    /// Wait for everything except the controller.
    async fn join_workers(&mut self) -> Option<String> {
        let mut failure = None;
        if let Err(e) = (&mut self.gate).await {
            failure = Some(format!("timer gate: {e}"));
        }
        if let Err(e) = (&mut self.dispatcher).await {
            failure = Some(format!("dispatcher: {e}"));
        }
        if let Some(backlog) = self.backlog.as_mut() {
            if let Err(e) = backlog.await {
                failure = Some(format!("recovery backlog: {e}"));
            }
        }
        failure
    }
}

/// Point-in-time view of a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub watermarks: WatermarkReport,
    pub gate: GateSnapshot,
}

/// Control surface of a running engine.
pub struct EngineHandle {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    store_retry_budget: std::time::Duration,
    gate: mpsc::Sender<GateCommand>,
    controller: mpsc::UnboundedSender<ControllerMsg>,
    stop: watch::Sender<bool>,
    controller_stop: watch::Sender<bool>,
    tasks: Tasks,
}

impl EngineHandle {
    /// Persist `job` and arm it if it falls inside the loaded window.
    #[tracing::instrument(skip(self, job), fields(id = %job.id))]
    pub async fn schedule(&self, job: Job) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.controller
            .send(ControllerMsg::Schedule { job, reply })
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Mark a job failed with reason "cancelled" and remove it from the
    /// heap. Returns `false` if the job had already finished.
    ///
    /// A job already waiting for a worker is dropped without running. A job
    /// that is executing when cancelled runs to completion and its outcome
    /// overwrites the cancellation.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let budget = self.store_retry_budget;
        let job = with_retry(budget, "get_job", || self.store.get_job(id))
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        if job.is_terminal() {
            return Ok(false);
        }

        let update = JobUpdate {
            status: JobStatus::Failed,
            last_error: Some(CANCELLED.to_string()),
            next_execution_time: None,
            retry_count: job.retry_count,
            updated_at: self.clock.now(),
        };
        with_retry(budget, "update_job_status", || {
            self.store.update_job_status(id, &update)
        })
        .await?;

        let (reply, rx) = oneshot::channel();
        self.gate
            .send(GateCommand::Cancel {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        if let Some(entry) = rx.await.map_err(|_| SchedulerError::Stopped)? {
            let _ = self.controller.send(ControllerMsg::Cancelled {
                id: id.to_string(),
                due: entry.due,
            });
        }

        info!("job cancelled");
        Ok(true)
    }

    /// Watermarks, outstanding obligations and heap state.
    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.controller
            .send(ControllerMsg::Report { reply })
            .map_err(|_| SchedulerError::Stopped)?;
        let watermarks = rx.await.map_err(|_| SchedulerError::Stopped)?;

        let (reply, rx) = oneshot::channel();
        self.gate
            .send(GateCommand::Snapshot { reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        let gate = rx.await.map_err(|_| SchedulerError::Stopped)?;

        Ok(EngineSnapshot { watermarks, gate })
    }

    /// Stop the engine: no new dispatches, running jobs finish, final
    /// watermarks are persisted and returned.
    pub async fn stop(mut self) -> Result<Watermarks> {
        info!("stopping scheduler engine");
        let _ = self.stop.send(true);
        let failure = self.tasks.join_workers().await;

        // The controller outlives the dispatcher so late discharges count.
        let _ = self.controller_stop.send(true);
        let marks = match self.tasks.controller.take() {
            Some(controller) => controller
                .await
                .map_err(|e| SchedulerError::TaskFailed(format!("watermark controller: {e}")))?,
            None => return Err(SchedulerError::Stopped),
        };

        if let Some(failure) = failure {
            return Err(SchedulerError::TaskFailed(failure));
        }
        info!(
            ack_level = %marks.ack_level,
            read_level = %marks.read_level,
            "scheduler engine stopped"
        );
        Ok(marks)
    }
}
