//! Drains due job records one at a time.

use chrono::{DateTime, Utc};
use tracing::{Span, instrument};

use std::sync::Arc;

use super::{
    clock::ClockHandle,
    config::{DurableJobsConfig, NotificationConfig},
    dispatcher::{JobConclusion, JobDispatcher},
    entity::{JobRecord, JobType},
    error::JobError,
    notification::{NotificationSender, exhausted_body, exhausted_subject},
    registry::JobRegistry,
    repo::{DueJobQuery, IsolationLevel, JobOp, JobRepo},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Which records a runner may select and when it stops draining.
pub enum RunnerFlavor {
    /// Any pending `RUN_ONCE` or `RUN_ON_EACH_STARTUP` record; drains until none is left.
    Startup,
    /// `RECURRING` records that are due; drains until none is left or the
    /// poll interval has elapsed.
    Recurring,
}

impl RunnerFlavor {
    pub fn job_types(&self) -> Vec<JobType> {
        match self {
            RunnerFlavor::Startup => vec![JobType::RunOnce, JobType::RunOnEachStartup],
            RunnerFlavor::Recurring => vec![JobType::Recurring],
        }
    }

    fn due_job_query(&self, now: DateTime<Utc>) -> DueJobQuery {
        DueJobQuery {
            job_types: self.job_types(),
            due_at: match self {
                RunnerFlavor::Startup => None,
                RunnerFlavor::Recurring => Some(now),
            },
        }
    }
}

impl std::fmt::Display for RunnerFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerFlavor::Startup => f.write_str("startup"),
            RunnerFlavor::Recurring => f.write_str("recurring"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Tally of one [`DurableJobRunner::run_jobs`] invocation.
pub struct JobRunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that consumed the last attempt. Also counted in `failed`.
    pub exhausted: usize,
    /// Records removed because their job is no longer registered.
    pub deleted: usize,
}

impl JobRunSummary {
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Selects due records and executes them under a timeout.
///
/// Each record is handled in its own transaction: the selection locks the
/// row, and the attempt decrement, outcome and error log are committed
/// together. Invocations on the same runner never overlap.
pub struct DurableJobRunner<R: JobRepo> {
    flavor: RunnerFlavor,
    repo: R,
    registry: Arc<JobRegistry>,
    notifier: Arc<dyn NotificationSender>,
    notification: NotificationConfig,
    config: DurableJobsConfig,
    clock: ClockHandle,
    lock: tokio::sync::Mutex<()>,
}

impl<R: JobRepo> DurableJobRunner<R> {
    pub fn new(
        flavor: RunnerFlavor,
        repo: R,
        registry: Arc<JobRegistry>,
        notifier: Arc<dyn NotificationSender>,
        notification: NotificationConfig,
        config: DurableJobsConfig,
        clock: ClockHandle,
    ) -> Self {
        Self {
            flavor,
            repo,
            registry,
            notifier,
            notification,
            config,
            clock,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn flavor(&self) -> RunnerFlavor {
        self.flavor
    }

    /// Executes due records until none is left or the budget is spent.
    ///
    /// Job failures never surface here; they are recorded on the record.
    /// Only storage errors end the invocation early.
    #[instrument(
        name = "durable_jobs.run_jobs",
        skip(self),
        fields(flavor = %self.flavor, n_succeeded, n_failed, n_deleted),
        err
    )]
    pub async fn run_jobs(&self) -> Result<JobRunSummary, JobError> {
        let _guard = self.lock.lock().await;
        let deadline = match self.flavor {
            RunnerFlavor::Startup => None,
            RunnerFlavor::Recurring => chrono::Duration::from_std(self.config.poll_interval())
                .ok()
                .and_then(|budget| self.clock.now().checked_add_signed(budget)),
        };
        let dispatcher =
            JobDispatcher::new(&self.registry, &self.clock, self.config.job_timeout());
        let mut summary = JobRunSummary::default();
        tracing::info!(flavor = %self.flavor, "job runner started");

        loop {
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                tracing::debug!(flavor = %self.flavor, "runner lifespan elapsed");
                break;
            }
            let mut op = self.repo.begin_op(IsolationLevel::ReadCommitted).await?;
            let query = self.flavor.due_job_query(self.clock.now());
            let Some(job) = op.find_due_job(&query).await? else {
                op.rollback().await?;
                break;
            };

            let conclusion = dispatcher.execute_job(&mut op, job).await?;
            op.commit().await?;

            match conclusion {
                JobConclusion::Succeeded(_) => summary.succeeded += 1,
                JobConclusion::Deleted => summary.deleted += 1,
                JobConclusion::Failed(job) => {
                    summary.failed += 1;
                    if job.has_failed_with_no_remaining_attempts() {
                        summary.exhausted += 1;
                        self.notify_final_failure(&job).await;
                    }
                }
            }
        }

        let span = Span::current();
        span.record("n_succeeded", summary.succeeded);
        span.record("n_failed", summary.failed);
        span.record("n_deleted", summary.deleted);
        tracing::info!(flavor = %self.flavor, "job runner stopped");
        Ok(summary)
    }

    async fn notify_final_failure(&self, job: &JobRecord) {
        let to = self.notification.operator_address();
        let subject = exhausted_subject(&self.notification, job);
        let body = exhausted_body(job);
        if let Err(e) = self.notifier.send(to, &subject, &body).await {
            tracing::error!(
                job_name = %job.job_name,
                job_id = %job.id,
                error = %e,
                "could not notify operator about exhausted job"
            );
        }
    }
}
