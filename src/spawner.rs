//! Seeds job records outside of the schedulers.

use chrono::{DateTime, Utc};
use tracing::instrument;

use std::sync::Arc;

use super::{
    clock::ClockHandle,
    entity::{JobName, JobRecord, JobType, NewJobRecord},
    error::JobError,
    registry::JobRegistry,
    repo::{IsolationLevel, JobOp, JobRepo},
};

/// Inserts records for registered jobs.
///
/// Returned by [`Jobs::spawner`](crate::Jobs::spawner). Used for one-shot and
/// startup jobs that no resolver books, and to trigger a recurring job ahead
/// of its schedule.
///
/// # Examples
///
/// ```ignore
/// let spawner = jobs.spawner();
/// spawner.spawn_at("BACKFILL_ACCOUNTS", JobType::RunOnce, cutover).await?;
/// spawner.spawn_now("NIGHTLY_REPORT").await?;
/// ```
#[derive(Clone)]
pub struct JobSpawner<R: JobRepo> {
    repo: R,
    registry: Arc<JobRegistry>,
    clock: ClockHandle,
    max_job_attempts: u32,
}

impl<R: JobRepo> JobSpawner<R> {
    pub(crate) fn new(
        repo: R,
        registry: Arc<JobRegistry>,
        clock: ClockHandle,
        max_job_attempts: u32,
    ) -> Self {
        Self {
            repo,
            registry,
            clock,
            max_job_attempts,
        }
    }

    /// Insert a record of `job_type` that becomes eligible at `execution_time`.
    ///
    /// Fails with [`JobError::JobNotFound`] if `job_name` is not registered.
    #[instrument(
        name = "durable_jobs.spawner.spawn_at",
        skip(self, job_name),
        fields(job_name = tracing::field::Empty),
        err
    )]
    pub async fn spawn_at(
        &self,
        job_name: impl Into<JobName>,
        job_type: JobType,
        execution_time: DateTime<Utc>,
    ) -> Result<JobRecord, JobError> {
        let job_name = job_name.into();
        tracing::Span::current().record("job_name", tracing::field::display(&job_name));
        self.registry.get(&job_name)?;

        let new_job = NewJobRecord::builder()
            .job_name(job_name)
            .job_type(job_type)
            .execution_time(execution_time)
            .remaining_attempts(self.max_job_attempts)
            .build()?;
        let mut op = self.repo.begin_op(IsolationLevel::ReadCommitted).await?;
        let job = op.insert(new_job).await?;
        op.commit().await?;
        Ok(job)
    }

    /// Insert a `RECURRING` record due now, so the next recurring pass runs it.
    pub async fn spawn_now(&self, job_name: impl Into<JobName>) -> Result<JobRecord, JobError> {
        self.spawn_at(job_name, JobType::Recurring, self.clock.now())
            .await
    }
}
