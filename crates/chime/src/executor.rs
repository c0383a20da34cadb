//! Job executors for the bundled job types.
//!
//! Delivery is at least once, so every handler here must tolerate running
//! the same job twice.

use chime_scheduler::{Job, JobExecutor, JobType};
use tracing::info;

/// Executor that logs a structured delivery event per job type.
pub fn logging_executor() -> JobExecutor {
    Box::new(|job| Box::pin(async move { deliver(&job) }))
}

fn deliver(job: &Job) -> Result<(), String> {
    let recipient = job
        .payload
        .get("to")
        .and_then(|v| v.as_str())
        .unwrap_or("<unset>");

    match &job.job_type {
        JobType::Email => {
            let subject = job
                .payload
                .get("subject")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            info!(id = %job.id, to = recipient, subject, "sending email");
        }
        JobType::MobileNotification => {
            info!(id = %job.id, to = recipient, "sending mobile notification");
        }
        JobType::Custom(name) => {
            if job.payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
                return Err(format!("job type {name} asked to fail"));
            }
            info!(id = %job.id, job_type = %name, payload = ?job.payload, "running custom job");
        }
    }
    Ok(())
}
