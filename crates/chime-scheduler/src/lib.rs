//! Durable, watermark-driven job scheduler.
//!
//! This crate provides a scheduler that:
//! - Keeps only the next time window of jobs in memory, in a min-heap
//! - Fires each job from a single timer armed for the earliest entry
//! - Tracks progress with two persisted watermarks so restarts neither skip
//!   nor lose jobs (delivery is at least once)
//! - Replays a bounded backlog after long outages and refuses to start on
//!   clock drift
//! - Retries failed jobs with exponential backoff and re-arms recurring ones
//!
//! Build an [`Engine`] with [`Engine::initialize`], then [`Engine::start`] it
//! to get an [`EngineHandle`].

mod clock;
mod config;
mod dispatcher;
mod engine;
mod error;
mod gate;
mod heap;
mod reconcile;
mod schedule;
mod shutdown;
mod store;
mod types;
mod watermark;

pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{BacklogPolicy, RetryPolicy, SchedulerConfig};
pub use dispatcher::{JobExecutor, decide_outcome};
pub use engine::{Engine, EngineHandle, EngineSnapshot};
pub use error::{Result, ScheduleError, SchedulerError, StoreError};
pub use gate::GateSnapshot;
pub use heap::{HeapEntry, TimerHeap};
pub use reconcile::{Startup, classify};
pub use schedule::{Schedule, ScheduleKind};
pub use store::{JobStore, JsonFileStore, MemoryStore};
pub use types::{Job, JobStatus, JobType, JobUpdate, Payload, Watermarks};
pub use watermark::WatermarkReport;
