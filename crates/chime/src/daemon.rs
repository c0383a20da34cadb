//! The long-running scheduler process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chime_scheduler::{Engine, JsonFileStore, SchedulerConfig, SystemClock};
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

use crate::executor::logging_executor;

/// How often engine state is logged while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the engine against the store at `store_path` until ctrl-c.
pub async fn run(store_path: &Path, config: SchedulerConfig) -> Result<()> {
    let store = Arc::new(JsonFileStore::open(store_path).await.into_diagnostic()?);

    let engine = Engine::initialize(config, store, logging_executor(), Arc::new(SystemClock))
        .await
        .into_diagnostic()?;
    info!(startup = ?engine.startup(), "reconciled watermarks");

    let handle = engine.start().await.into_diagnostic()?;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c, stopping");
                }
                info!("received shutdown signal");
                break;
            }
            _ = status.tick() => match handle.snapshot().await {
                Ok(snapshot) => info!(
                    ack_level = %snapshot.watermarks.current.ack_level,
                    read_level = %snapshot.watermarks.current.read_level,
                    outstanding = snapshot.watermarks.outstanding,
                    backlog_pending = snapshot.watermarks.backlog_pending,
                    heap_len = snapshot.gate.len,
                    "engine status"
                ),
                Err(e) => warn!(error = %e, "failed to read engine status"),
            },
        }
    }

    let marks = handle.stop().await.into_diagnostic()?;
    info!(
        ack_level = %marks.ack_level,
        read_level = %marks.read_level,
        "shutdown complete"
    );
    Ok(())
}
