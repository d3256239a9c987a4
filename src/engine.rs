//! Scheduler and runner pairs driven by an external trigger.

use tracing::instrument;

use std::sync::Arc;

use super::{
    clock::ClockHandle,
    config::{DurableJobsConfig, NotificationConfig},
    error::JobError,
    notification::NotificationSender,
    registry::JobRegistry,
    repo::JobRepo,
    runner::{DurableJobRunner, JobRunSummary, RunnerFlavor},
    scheduler::{JobScheduler, ScheduleSummary, SchedulerFlavor},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub schedule: ScheduleSummary,
    pub run: JobRunSummary,
}

/// The startup and recurring scheduler/runner pairs sharing one registry.
///
/// Whatever drives the engine (a cron tick, the built-in poller, a test)
/// calls [`run_startup_pass`](Self::run_startup_pass) once per process start
/// and [`run_recurring_pass`](Self::run_recurring_pass) periodically.
pub struct JobEngine<R: JobRepo> {
    registry: Arc<JobRegistry>,
    startup_scheduler: JobScheduler<R>,
    startup_runner: DurableJobRunner<R>,
    recurring_scheduler: JobScheduler<R>,
    recurring_runner: DurableJobRunner<R>,
}

impl<R: JobRepo> JobEngine<R> {
    pub fn new(
        repo: R,
        registry: Arc<JobRegistry>,
        notifier: Arc<dyn NotificationSender>,
        notification: NotificationConfig,
        config: DurableJobsConfig,
        clock: ClockHandle,
    ) -> Self {
        let scheduler = |flavor| {
            JobScheduler::new(
                flavor,
                repo.clone(),
                Arc::clone(&registry),
                config.clone(),
                clock.clone(),
            )
        };
        let runner = |flavor| {
            DurableJobRunner::new(
                flavor,
                repo.clone(),
                Arc::clone(&registry),
                Arc::clone(&notifier),
                notification.clone(),
                config.clone(),
                clock.clone(),
            )
        };
        Self {
            startup_scheduler: scheduler(SchedulerFlavor::Startup),
            startup_runner: runner(RunnerFlavor::Startup),
            recurring_scheduler: scheduler(SchedulerFlavor::Recurring),
            recurring_runner: runner(RunnerFlavor::Recurring),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn startup_scheduler(&self) -> &JobScheduler<R> {
        &self.startup_scheduler
    }

    pub fn startup_runner(&self) -> &DurableJobRunner<R> {
        &self.startup_runner
    }

    pub fn recurring_scheduler(&self) -> &JobScheduler<R> {
        &self.recurring_scheduler
    }

    pub fn recurring_runner(&self) -> &DurableJobRunner<R> {
        &self.recurring_runner
    }

    /// Books `RUN_ONCE`/`RUN_ON_EACH_STARTUP` registrations, then drains them.
    #[instrument(name = "durable_jobs.startup_pass", skip(self), err)]
    pub async fn run_startup_pass(&self) -> Result<PassSummary, JobError> {
        let schedule = self.startup_scheduler.schedule_jobs().await;
        let run = self.startup_runner.run_jobs().await?;
        Ok(PassSummary { schedule, run })
    }

    /// Tops up `RECURRING` registrations, then drains what is due.
    #[instrument(name = "durable_jobs.recurring_pass", skip(self), err)]
    pub async fn run_recurring_pass(&self) -> Result<PassSummary, JobError> {
        let schedule = self.recurring_scheduler.schedule_jobs().await;
        let run = self.recurring_runner.run_jobs().await?;
        Ok(PassSummary { schedule, run })
    }
}
