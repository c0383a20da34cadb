//! Timer gate.
//!
//! A single task owns the [`TimerHeap`] and the only timer in the engine.
//! Everything else talks to it through [`GateCommand`]s, so the heap needs no
//! lock. The timer is always armed for the heap minimum, or disarmed when the
//! heap is empty.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace};

use crate::clock::{Clock, instant_at};
use crate::dispatcher::DueJob;
use crate::heap::{HeapEntry, TimerHeap};
use crate::shutdown::stopped;
use crate::types::Job;

/// Requests accepted by the gate.
#[derive(Debug)]
pub(crate) enum GateCommand {
    /// Arm `job` to fire at `due`, replacing any entry with the same id.
    Insert { job: Job, due: DateTime<Utc> },
    /// Remove a job, replying with the entry if it was still waiting.
    Cancel {
        id: String,
        reply: oneshot::Sender<Option<HeapEntry>>,
    },
    /// Describe the heap and timer.
    Snapshot { reply: oneshot::Sender<GateSnapshot> },
}

/// Heap and timer state at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSnapshot {
    /// Jobs waiting in the heap.
    pub len: usize,
    /// Deadline the timer is armed for.
    pub armed_deadline: Option<DateTime<Utc>>,
    /// Earliest due time in the heap.
    pub next_due: Option<DateTime<Utc>>,
}

/// One re-armable timer.
struct Timer {
    sleep: Pin<Box<Sleep>>,
    deadline: Option<DateTime<Utc>>,
}

impl Timer {
    fn disarmed() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep_until(Instant::now())),
            deadline: None,
        }
    }

    fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Drop any pending expiry and arm for `deadline`.
    fn arm(&mut self, clock: &dyn Clock, deadline: DateTime<Utc>) {
        self.sleep.as_mut().reset(instant_at(clock, deadline));
        self.deadline = Some(deadline);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }
}

pub(crate) struct Gate {
    clock: Arc<dyn Clock>,
    heap: TimerHeap,
    timer: Timer,
    commands: mpsc::Receiver<GateCommand>,
    dispatch: mpsc::Sender<DueJob>,
    stop: watch::Receiver<bool>,
}

impl Gate {
    pub fn new(
        clock: Arc<dyn Clock>,
        commands: mpsc::Receiver<GateCommand>,
        dispatch: mpsc::Sender<DueJob>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            clock,
            heap: TimerHeap::new(),
            timer: Timer::disarmed(),
            commands,
            dispatch,
            stop,
        }
    }

    pub async fn run(mut self) {
        info!("timer gate starting");

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut self.stop) => break,
                () = self.timer.sleep.as_mut(), if self.timer.is_armed() => {
                    if !self.fire().await {
                        break;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }

        self.timer.disarm();
        info!(pending = self.heap.len(), "timer gate stopped");
    }

    /// Send every due entry to the dispatcher, then re-arm. Returns `false`
    /// once the gate should stop.
    async fn fire(&mut self) -> bool {
        let now = self.clock.now();
        while let Some(entry) = self.heap.pop_due(now) {
            trace!(id = %entry.id(), due = %entry.due, "job due");
            let due = DueJob::from(entry);
            tokio::select! {
                biased;
                () = stopped(&mut self.stop) => return false,
                sent = self.dispatch.send(due) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        self.rearm();
        true
    }

    fn handle(&mut self, cmd: GateCommand) {
        match cmd {
            GateCommand::Insert { job, due } => {
                let id = job.id.clone();
                self.heap.insert(job, due);
                // Only an earlier deadline disturbs the armed timer. A later
                // replacement of the current minimum fires early and re-arms.
                if self.timer.deadline.is_none_or(|armed| due < armed) {
                    self.timer.arm(self.clock.as_ref(), due);
                }
                debug!(%id, %due, pending = self.heap.len(), "job armed");
            }
            GateCommand::Cancel { id, reply } => {
                let removed = self.heap.remove(&id);
                if removed.is_some() && self.heap.next_due() != self.timer.deadline {
                    self.rearm();
                }
                debug!(%id, found = removed.is_some(), "job removed from gate");
                let _ = reply.send(removed);
            }
            GateCommand::Snapshot { reply } => {
                let _ = reply.send(GateSnapshot {
                    len: self.heap.len(),
                    armed_deadline: self.timer.deadline,
                    next_due: self.heap.next_due(),
                });
            }
        }
    }

    fn rearm(&mut self) {
        match self.heap.next_due() {
            Some(deadline) => self.timer.arm(self.clock.as_ref(), deadline),
            None => self.timer.disarm(),
        }
    }
}
