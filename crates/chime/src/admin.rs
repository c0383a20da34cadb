//! Store administration commands.

use std::path::Path;

use chime_scheduler::{
    Clock, Job, JobStatus, JobStore, JobType, JsonFileStore, Payload, Schedule, SchedulerConfig,
    SystemClock, classify,
};
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

/// Create a job and write it to the store.
pub async fn add(
    store_path: &Path,
    job_type: JobType,
    schedule: Schedule,
    payload: Payload,
    max_retries: u32,
) -> Result<()> {
    let store = JsonFileStore::open(store_path).await.into_diagnostic()?;
    let mut job = Job::new(job_type, schedule, payload, max_retries, SystemClock.now())
        .into_diagnostic()?;

    if let (Some(marks), Some(due)) = (
        store.load_watermarks().await.into_diagnostic()?,
        job.next_execution_time,
    ) {
        // Nothing at or below the ack is ever loaded again.
        if due <= marks.ack_level {
            let moved = marks.earliest_admissible();
            warn!(%due, ack_level = %marks.ack_level, %moved, "job due at or before ack level, moving it past");
            job.next_execution_time = Some(moved);
        }
    }
    store.insert_job(&job).await.into_diagnostic()?;

    info!(id = %job.id, job_type = %job.job_type, "job added");
    println!("{}", job.id);
    if let Some(next) = job.next_execution_time {
        println!("next run: {next}");
    }
    Ok(())
}

/// Print stored jobs, optionally filtered by status.
pub async fn list(store_path: &Path, status: Option<JobStatus>) -> Result<()> {
    let store = JsonFileStore::open(store_path).await.into_diagnostic()?;
    let jobs = store.list_jobs().await.into_diagnostic()?;

    let mut shown = 0;
    for job in jobs.iter().filter(|j| status.is_none_or(|s| j.status == s)) {
        println!("{}", format_job(job));
        shown += 1;
    }
    if shown == 0 {
        println!("no jobs");
    }
    Ok(())
}

/// Print persisted watermarks and the startup decision they lead to.
pub async fn watermarks(store_path: &Path, config: &SchedulerConfig) -> Result<()> {
    let store = JsonFileStore::open(store_path).await.into_diagnostic()?;
    let persisted = store.load_watermarks().await.into_diagnostic()?;

    match persisted {
        Some(marks) => {
            println!("ack level:  {}", marks.ack_level);
            println!("read level: {}", marks.read_level);
        }
        None => println!("no watermarks persisted"),
    }
    match classify(persisted, SystemClock.now(), config) {
        Ok(startup) => println!("startup:    {startup:?}"),
        Err(e) => println!("startup:    refused ({e})"),
    }
    Ok(())
}

fn format_job(job: &Job) -> String {
    let next = job
        .next_execution_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{}  {:<20} {:<14} {:<9} next={} retries={}/{}",
        job.id,
        job.job_type.to_string(),
        job.schedule.kind().to_string(),
        job.status.to_string(),
        next,
        job.retry_count,
        job.max_retries,
    );
    if let Some(err) = &job.last_error {
        line.push_str(&format!(" error={err}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_scheduler::Watermarks;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_add_persists_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        add(
            &path,
            JobType::Email,
            Schedule::Daily { hour: 9, minute: 0 },
            Payload::new(),
            2,
        )
        .await
        .unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].max_retries, 2);
    }

    #[tokio::test]
    async fn test_add_moves_job_past_persisted_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let ahead = Watermarks::at(Utc::now() + chrono::Duration::days(2));
        JsonFileStore::open(&path)
            .await
            .unwrap()
            .save_watermarks(ahead)
            .await
            .unwrap();

        add(
            &path,
            JobType::Email,
            Schedule::Daily { hour: 9, minute: 0 },
            Payload::new(),
            0,
        )
        .await
        .unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs[0].next_execution_time, Some(ahead.earliest_admissible()));
    }

    #[test]
    fn test_format_job_shows_error() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut job = Job::new(
            JobType::MobileNotification,
            Schedule::OneTime {
                at: now + chrono::Duration::hours(1),
            },
            Payload::new(),
            0,
            now,
        )
        .unwrap();
        job.status = JobStatus::Failed;
        job.next_execution_time = None;
        job.last_error = Some("cancelled".to_string());

        let line = format_job(&job);
        assert!(line.contains("mobile_notification"));
        assert!(line.contains("next=-"));
        assert!(line.ends_with("error=cancelled"));
    }
}
