//! Books future records for scheduled registrations.

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{Span, instrument};

use std::{sync::Arc, time::Duration};

use super::{
    clock::ClockHandle,
    config::DurableJobsConfig,
    entity::{JobType, NewJobRecord},
    error::JobError,
    registry::{JobRegistry, RegisteredJob},
    repo::{IsolationLevel, JobOp, JobRepo},
    resolver::ExecutionTimeResolver,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Which registrations a scheduler books.
pub enum SchedulerFlavor {
    /// `RUN_ONCE` and `RUN_ON_EACH_STARTUP` registrations.
    Startup,
    /// `RECURRING` registrations.
    Recurring,
}

impl SchedulerFlavor {
    pub fn allows(&self, job_type: JobType) -> bool {
        match self {
            SchedulerFlavor::Startup => {
                matches!(job_type, JobType::RunOnce | JobType::RunOnEachStartup)
            }
            SchedulerFlavor::Recurring => job_type == JobType::Recurring,
        }
    }
}

impl std::fmt::Display for SchedulerFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerFlavor::Startup => f.write_str("startup"),
            SchedulerFlavor::Recurring => f.write_str("recurring"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Tally of one [`JobScheduler::schedule_jobs`] invocation.
pub struct ScheduleSummary {
    pub scheduled: usize,
    pub already_scheduled: usize,
    /// Registrations left unscheduled until the next pass.
    pub deferred: usize,
}

/// Makes sure every scheduled registration has a record to run.
///
/// The existence check and the insert share one serializable transaction, so
/// concurrent schedulers in other processes cannot both insert the same slot.
/// Invocations on the same scheduler never overlap.
pub struct JobScheduler<R: JobRepo> {
    flavor: SchedulerFlavor,
    repo: R,
    registry: Arc<JobRegistry>,
    config: DurableJobsConfig,
    clock: ClockHandle,
    lock: tokio::sync::Mutex<()>,
}

impl<R: JobRepo> JobScheduler<R> {
    pub fn new(
        flavor: SchedulerFlavor,
        repo: R,
        registry: Arc<JobRegistry>,
        config: DurableJobsConfig,
        clock: ClockHandle,
    ) -> Self {
        Self {
            flavor,
            repo,
            registry,
            config,
            clock,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn flavor(&self) -> SchedulerFlavor {
        self.flavor
    }

    /// Books a record for every registration this scheduler owns.
    ///
    /// Failures are logged and counted as deferred; the next pass retries them.
    #[instrument(
        name = "durable_jobs.schedule_jobs",
        skip(self),
        fields(flavor = %self.flavor, n_scheduled, n_deferred)
    )]
    pub async fn schedule_jobs(&self) -> ScheduleSummary {
        let _guard = self.lock.lock().await;
        let mut summary = ScheduleSummary::default();

        for job in self.registry.scheduled_jobs() {
            if !self.flavor.allows(job.job_type()) {
                continue;
            }
            let Some(resolver) = job.resolver() else {
                continue;
            };
            match self.schedule_job(job, &**resolver).await {
                Ok(true) => summary.scheduled += 1,
                Ok(false) => summary.already_scheduled += 1,
                Err(e) => {
                    summary.deferred += 1;
                    tracing::error!(
                        job_name = %job.name(),
                        error = %e,
                        "could not schedule job, deferring to next pass"
                    );
                }
            }
        }

        let span = Span::current();
        span.record("n_scheduled", summary.scheduled);
        span.record("n_deferred", summary.deferred);
        summary
    }

    async fn schedule_job(
        &self,
        job: &RegisteredJob,
        resolver: &dyn ExecutionTimeResolver,
    ) -> Result<bool, JobError> {
        let mut attempts_left = self.config.max_schedule_attempts.max(1);
        loop {
            attempts_left -= 1;
            let execution_time = resolver.resolve_execution_time(&*self.clock);
            match self.try_schedule(job, execution_time).await {
                Err(e) if e.is_serialization_conflict() && attempts_left > 0 => {
                    let pause = retry_pause(self.config.schedule_retry_max_jitter);
                    tracing::warn!(
                        job_name = %job.name(),
                        attempts_left,
                        pause_ms = pause.as_millis() as u64,
                        "scheduling conflict, retrying"
                    );
                    tokio::time::sleep(pause).await;
                }
                result => return result,
            }
        }
    }

    #[instrument(
        name = "durable_jobs.schedule_job",
        skip(self, job),
        fields(job_name = %job.name(), job_type = %job.job_type(), conclusion)
    )]
    async fn try_schedule(
        &self,
        job: &RegisteredJob,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        let mut op = self.repo.begin_op(IsolationLevel::Serializable).await?;
        let existing = match job.job_type() {
            JobType::Recurring => {
                match op
                    .find_existing_schedule(job.name(), Some(execution_time))
                    .await?
                {
                    Some(existing) => Some(existing),
                    None => {
                        op.find_pending_schedule(job.name(), self.clock.now())
                            .await?
                    }
                }
            }
            JobType::RunOnce => op.find_existing_schedule(job.name(), None).await?,
            JobType::RunOnEachStartup => None,
        };
        if existing.is_some() {
            op.rollback().await?;
            Span::current().record("conclusion", "AlreadyScheduled");
            return Ok(false);
        }

        let new_job = NewJobRecord::builder()
            .job_name(job.name().clone())
            .job_type(job.job_type())
            .execution_time(execution_time)
            .remaining_attempts(self.config.job_attempts())
            .build()?;
        let id = new_job.id;
        op.insert(new_job).await?;
        op.commit().await?;
        Span::current().record("conclusion", "Scheduled");
        tracing::info!(
            job_name = %job.name(),
            job_id = %id,
            execution_time = %execution_time,
            "job scheduled"
        );
        Ok(true)
    }
}

fn retry_pause(max_jitter: Duration) -> Duration {
    let max_ms = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
