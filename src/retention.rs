//! Ready-made job that purges old terminal records.

use async_trait::async_trait;
use chrono::Duration;

use super::{
    current::CurrentJob,
    entity::{JobName, JobRecord},
    error::BoxError,
    job::DurableJob,
    repo::{IsolationLevel, JobOp, JobRepo},
};

pub const OLD_JOB_CLEANUP: JobName = JobName::new("OLD_JOB_CLEANUP");

/// Roughly six months.
pub const DEFAULT_RETENTION_DAYS: i64 = 183;

/// Deletes succeeded and exhausted records due longer ago than the retention window.
///
/// # Examples
///
/// ```ignore
/// jobs.register_recurring(
///     OLD_JOB_CLEANUP,
///     OldJobsCleanupJob::initializer(repo.clone()),
///     MonthlyAt::first_of_month_at_2am(),
/// )?;
/// ```
#[derive(Clone)]
pub struct OldJobsCleanupJob<R: JobRepo> {
    repo: R,
    retention: Duration,
}

impl<R: JobRepo> OldJobsCleanupJob<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Factory suitable for registration.
    pub fn initializer(repo: R) -> impl Fn(&JobRecord) -> Self + Send + Sync + 'static {
        let job = Self::new(repo);
        move |_: &JobRecord| job.clone()
    }
}

#[async_trait]
impl<R: JobRepo> DurableJob for OldJobsCleanupJob<R> {
    async fn run(&self, current_job: CurrentJob) -> Result<(), BoxError> {
        let cutoff = current_job.clock().now() - self.retention;
        let mut op = self.repo.begin_op(IsolationLevel::ReadCommitted).await?;
        let deleted = op.delete_records_older_than(cutoff).await?;
        op.commit().await?;
        tracing::info!(deleted, cutoff = %cutoff, "old job records deleted");
        Ok(())
    }
}
