//! Chime: durable job scheduler
//!
//! Main binary with subcommands:
//! - `run`: Run the scheduling engine until interrupted
//! - `add`: Insert a job into the store
//! - `list`: Show stored jobs
//! - `watermarks`: Show persisted watermarks and how startup would treat them

use std::path::PathBuf;
use std::time::Duration;

use chime_scheduler::{BacklogPolicy, JobType, RetryPolicy, Schedule, SchedulerConfig};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod daemon;
mod executor;

#[derive(Parser)]
#[command(name = "chime")]
#[command(about = "Durable watermark-driven job scheduler", long_about = None)]
struct Cli {
    /// Path of the JSON job store
    #[arg(long, global = true, env = "CHIME_STORE", default_value = "chime-store.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling engine until interrupted
    Run {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Insert a job into the store.
    ///
    /// A running engine picks the job up on its next loader tick.
    Add {
        /// Job type (email_job, mobile_notification, or any custom name)
        #[arg(long = "type", value_name = "TYPE")]
        job_type: String,

        /// Schedule as JSON, e.g. '{"kind":"daily","hour":9,"minute":0}'
        #[arg(long, value_parser = parse_schedule)]
        schedule: Schedule,

        /// Payload as a JSON object
        #[arg(long, value_parser = parse_payload)]
        payload: Option<chime_scheduler::Payload>,

        /// Failed attempts tolerated before the job is marked failed
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },

    /// List stored jobs
    List {
        /// Only show jobs with this status
        #[arg(long)]
        status: Option<chime_scheduler::JobStatus>,
    },

    /// Show persisted watermarks
    Watermarks {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

/// Engine tunables, each with a `CHIME_*` environment fallback.
#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Span of future jobs held in memory, in seconds
    #[arg(long, env = "CHIME_TIME_WINDOW", default_value = "300")]
    time_window: u64,

    /// Loader tick period in seconds (must be shorter than the window)
    #[arg(long, env = "CHIME_LOOK_AHEAD", default_value = "180")]
    look_ahead: u64,

    /// Concurrent executions on the live path
    #[arg(long, env = "CHIME_WORKERS", default_value = "8")]
    workers: usize,

    /// Concurrent executions while replaying a stale backlog
    #[arg(long, env = "CHIME_BACKLOG_WORKERS", default_value = "4")]
    backlog_workers: usize,

    /// Backlog policy: concurrent or synchronous
    #[arg(long, env = "CHIME_BACKLOG_POLICY", default_value = "concurrent")]
    backlog_policy: BacklogPolicy,

    /// Allowed clock drift past the window at startup, in seconds
    #[arg(long, env = "CHIME_DRIFT_TOLERANCE", default_value = "0")]
    drift_tolerance: u64,

    /// Base retry delay in seconds
    #[arg(long, env = "CHIME_RETRY_BASE", default_value = "300")]
    retry_base: u64,

    /// Maximum retry delay in seconds
    #[arg(long, env = "CHIME_RETRY_MAX", default_value = "3600")]
    retry_max: u64,

    /// Give up on a failing store operation after this many seconds
    #[arg(long, env = "CHIME_STORE_RETRY_BUDGET", default_value = "120")]
    store_retry_budget: u64,
}

impl EngineArgs {
    fn config(&self) -> SchedulerConfig {
        SchedulerConfig {
            time_window: Duration::from_secs(self.time_window),
            look_ahead: Duration::from_secs(self.look_ahead),
            workers: self.workers,
            backlog_workers: self.backlog_workers,
            drift_tolerance: Duration::from_secs(self.drift_tolerance),
            store_retry_budget: Duration::from_secs(self.store_retry_budget),
            retry: RetryPolicy {
                base_delay: Duration::from_secs(self.retry_base),
                max_delay: Duration::from_secs(self.retry_max),
            },
            backlog_policy: self.backlog_policy,
            ..SchedulerConfig::default()
        }
    }
}

fn parse_schedule(s: &str) -> Result<Schedule, String> {
    let schedule: Schedule =
        serde_json::from_str(s).map_err(|e| format!("invalid schedule JSON: {e}"))?;
    schedule.validate().map_err(|e| e.to_string())?;
    Ok(schedule)
}

fn parse_payload(s: &str) -> Result<chime_scheduler::Payload, String> {
    serde_json::from_str(s).map_err(|e| format!("payload must be a JSON object: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chime=info,chime_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { engine } => daemon::run(&cli.store, engine.config()).await,

        Commands::Add {
            job_type,
            schedule,
            payload,
            max_retries,
        } => {
            admin::add(
                &cli.store,
                JobType::from(job_type),
                schedule,
                payload.unwrap_or_default(),
                max_retries,
            )
            .await
        }

        Commands::List { status } => admin::list(&cli.store, status).await,

        Commands::Watermarks { engine } => admin::watermarks(&cli.store, &engine.config()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_engine_defaults_match_library_defaults() {
        let cli = Cli::parse_from(["chime", "run"]);
        let Commands::Run { engine } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(engine.config(), SchedulerConfig::default());
    }

    #[test]
    fn test_parse_schedule_rejects_invalid_hour() {
        assert!(parse_schedule(r#"{"kind":"daily","hour":9,"minute":30}"#).is_ok());
        assert!(parse_schedule(r#"{"kind":"daily","hour":24,"minute":0}"#).is_err());
        assert!(parse_schedule("not json").is_err());
    }

    #[test]
    fn test_parse_payload_requires_object() {
        assert!(parse_payload(r#"{"to":"a@example.com"}"#).is_ok());
        assert!(parse_payload("[1, 2]").is_err());
    }
}
