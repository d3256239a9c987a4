#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durable_jobs::{
    ArtificialClock, CurrentJob, DurableJob, DurableJobsConfig, InMemoryJobRepo, IsolationLevel,
    JobName, JobOp, JobRecord, JobRepo, JobType, Jobs, NewJobRecord, NotificationConfig,
    RecordingNotificationSender, error::BoxError,
};

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

pub async fn init_pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    let Ok(pg_con) = std::env::var("PG_CON") else {
        return Ok(None);
    };
    let pool = sqlx::PgPool::connect(&pg_con).await?;
    Ok(Some(pool))
}

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Saturday 2024-06-15 23:00 in Los Angeles.
pub fn saturday_night() -> DateTime<Utc> {
    utc("2024-06-16T06:00:00Z")
}

pub fn la_clock(now: DateTime<Utc>) -> Arc<ArtificialClock> {
    ArtificialClock::handle(now, chrono_tz::America::Los_Angeles)
}

pub fn notification_config() -> NotificationConfig {
    NotificationConfig {
        base_url: "https://jobs.example.org/".to_string(),
        it_email_address: "it@example.org".to_string(),
        support_email_address: "support@example.org".to_string(),
    }
}

pub struct TestJobs {
    pub jobs: Jobs<InMemoryJobRepo>,
    pub repo: InMemoryJobRepo,
    pub clock: Arc<ArtificialClock>,
    pub notifier: RecordingNotificationSender,
}

pub fn test_jobs(now: DateTime<Utc>) -> TestJobs {
    test_jobs_with_config(now, DurableJobsConfig::test_mode())
}

pub fn test_jobs_with_config(now: DateTime<Utc>, config: DurableJobsConfig) -> TestJobs {
    let repo = InMemoryJobRepo::new();
    let clock = la_clock(now);
    let notifier = RecordingNotificationSender::new();
    let jobs = Jobs::with_repo(
        repo.clone(),
        config,
        notification_config(),
        clock.clone(),
        notifier.clone(),
    );
    TestJobs {
        jobs,
        repo,
        clock,
        notifier,
    }
}

pub async fn seed<R: JobRepo>(
    repo: &R,
    job_name: &'static str,
    job_type: JobType,
    execution_time: DateTime<Utc>,
    remaining_attempts: u32,
) -> anyhow::Result<JobRecord> {
    let mut op = repo.begin_op(IsolationLevel::ReadCommitted).await?;
    let job = op
        .insert(
            NewJobRecord::builder()
                .job_name(job_name)
                .job_type(job_type)
                .execution_time(execution_time)
                .remaining_attempts(remaining_attempts)
                .build()?,
        )
        .await?;
    op.commit().await?;
    Ok(job)
}

pub fn records_named(repo: &InMemoryJobRepo, name: &str) -> Vec<JobRecord> {
    repo.all_jobs()
        .into_iter()
        .filter(|job| job.job_name == JobName::from(name.to_string()))
        .collect()
}

/// Counts its executions.
#[derive(Clone, Default)]
pub struct Counter(pub Arc<AtomicUsize>);

impl Counter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableJob for Counter {
    async fn run(&self, _current_job: CurrentJob) -> Result<(), BoxError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct AlwaysFails;

#[async_trait]
impl DurableJob for AlwaysFails {
    async fn run(&self, _current_job: CurrentJob) -> Result<(), BoxError> {
        Err(anyhow::anyhow!("report service unavailable")
            .context("refreshing reports")
            .into())
    }
}

pub struct Panics;

#[async_trait]
impl DurableJob for Panics {
    async fn run(&self, _current_job: CurrentJob) -> Result<(), BoxError> {
        panic!("boom");
    }
}

/// Moves the artificial clock forward while "working".
pub struct AdvancesClock {
    pub clock: Arc<ArtificialClock>,
    pub by: chrono::Duration,
    pub runs: Counter,
}

#[async_trait]
impl DurableJob for AdvancesClock {
    async fn run(&self, current_job: CurrentJob) -> Result<(), BoxError> {
        self.clock.advance(self.by);
        self.runs.run(current_job).await
    }
}
