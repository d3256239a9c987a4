mod helpers;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use durable_jobs::{
    ArtificialClock, Clock, CurrentJob, DueJobQuery, DurableJob, DurableJobsConfig,
    InMemoryJobOp, InMemoryJobRepo, IsolationLevel, JobId, JobInitializer, JobName, JobOp,
    JobRecord, JobRepo, JobType, Jobs, NewJobRecord, RecordingNotificationSender,
    error::{BoxError, JobError},
};

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use helpers::*;

#[tokio::test]
async fn successful_job_is_never_selected_again() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    let counter = Counter::default();
    let body = counter.clone();
    t.jobs
        .register("REFRESH_REPORTS", move |_: &JobRecord| body.clone())?;
    let job = seed(
        &t.repo,
        "REFRESH_REPORTS",
        JobType::Recurring,
        t.clock.now() - Duration::hours(1),
        5,
    )
    .await?;

    let engine = t.jobs.engine();
    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(counter.count(), 1);

    let job = t.jobs.find(job.id).await?;
    assert_eq!(job.success_time(), Some(t.clock.now()));
    assert_eq!(job.remaining_attempts(), 4);

    t.clock.advance(Duration::days(30));
    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.executed(), 0);
    assert_eq!(counter.count(), 1);

    let mut op = t.repo.begin_op(IsolationLevel::ReadCommitted).await?;
    let due = op
        .find_due_job(&DueJobQuery {
            job_types: vec![JobType::Recurring],
            due_at: Some(t.clock.now()),
        })
        .await?;
    assert!(due.is_none());
    Ok(())
}

#[tokio::test]
async fn unregistered_job_is_deleted_and_the_loop_continues() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    let counter = Counter::default();
    let body = counter.clone();
    t.jobs
        .register("STILL_HERE", move |_: &JobRecord| body.clone())?;
    seed(
        &t.repo,
        "RETIRED",
        JobType::Recurring,
        t.clock.now() - Duration::hours(2),
        5,
    )
    .await?;
    let kept = seed(
        &t.repo,
        "STILL_HERE",
        JobType::Recurring,
        t.clock.now() - Duration::hours(1),
        5,
    )
    .await?;

    let summary = t.jobs.engine().recurring_runner().run_jobs().await?;

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(records_named(&t.repo, "RETIRED").is_empty());
    assert!(t.jobs.find(kept.id).await?.succeeded());
    assert_eq!(counter.count(), 1);
    Ok(())
}

#[tokio::test]
async fn exhausting_the_last_attempt_notifies_once() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    t.jobs.register("FLAKY_EXPORT", |_: &JobRecord| AlwaysFails)?;
    let job = seed(
        &t.repo,
        "FLAKY_EXPORT",
        JobType::Recurring,
        t.clock.now() - Duration::minutes(5),
        1,
    )
    .await?;

    let engine = t.jobs.engine();
    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exhausted, 1);

    let job = t.jobs.find(job.id).await?;
    assert_eq!(job.remaining_attempts(), 0);
    assert!(job.success_time().is_none());
    assert!(job.has_failed_with_no_remaining_attempts());
    let error = job.last_error_message().unwrap();
    assert!(error.starts_with("ExecutionFailure"));
    assert!(error.contains("refreshing reports"));

    let sent = t.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "it@example.org");
    assert!(sent[0].subject.contains("jobs.example.org"));
    assert!(sent[0].subject.contains("FLAKY_EXPORT"));
    assert!(sent[0].body.contains("FLAKY_EXPORT"));
    assert!(sent[0].body.contains(&job.id.to_string()));

    t.clock.advance(Duration::days(1));
    engine.recurring_runner().run_jobs().await?;
    assert_eq!(t.notifier.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn failures_with_attempts_left_are_retried_and_accumulate_errors() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    t.jobs.register("FLAKY_EXPORT", |_: &JobRecord| AlwaysFails)?;
    let job = seed(
        &t.repo,
        "FLAKY_EXPORT",
        JobType::Recurring,
        t.clock.now() - Duration::minutes(5),
        3,
    )
    .await?;

    let engine = t.jobs.engine();
    let first = engine.recurring_runner().run_jobs().await?;
    // The record stays eligible, so the same invocation keeps draining it.
    assert_eq!(first.failed, 3);
    assert_eq!(first.exhausted, 1);

    let job = t.jobs.find(job.id).await?;
    assert_eq!(job.remaining_attempts(), 0);
    assert_eq!(job.error_messages().len(), 3);
    assert!(job.error_messages()[0].contains("attempts_remaining=2"));
    assert!(job.error_messages()[2].contains("attempts_remaining=0"));
    assert_eq!(t.notifier.sent().len(), 1);
    Ok(())
}

/// Pushes the artificial clock past the runner lifespan, then blocks its
/// thread until cancelled.
struct BlocksUntilCancelled {
    clock: Arc<ArtificialClock>,
    observed_cancellation: Arc<AtomicBool>,
}

#[async_trait]
impl DurableJob for BlocksUntilCancelled {
    async fn run(&self, current_job: CurrentJob) -> Result<(), BoxError> {
        self.clock.advance(Duration::minutes(1));
        while !current_job.is_cancelled() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        self.observed_cancellation.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn timeout_consumes_exactly_one_attempt() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    let observed = Arc::new(AtomicBool::new(false));
    let clock = t.clock.clone();
    let flag = observed.clone();
    t.jobs
        .register("SLOW_REPORT", move |_: &JobRecord| BlocksUntilCancelled {
            clock: clock.clone(),
            observed_cancellation: flag.clone(),
        })?;
    let job = seed(
        &t.repo,
        "SLOW_REPORT",
        JobType::Recurring,
        t.clock.now() - Duration::minutes(1),
        5,
    )
    .await?;

    let started = std::time::Instant::now();
    let summary = t.jobs.engine().recurring_runner().run_jobs().await?;
    assert!(started.elapsed() >= std::time::Duration::from_millis(2500));
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exhausted, 0);

    let job = t.jobs.find(job.id).await?;
    assert!(job.success_time().is_none());
    assert_eq!(job.remaining_attempts(), 4);
    assert_eq!(job.error_messages().len(), 1);
    assert!(job.error_messages()[0].starts_with("Timeout"));
    assert!(job.is_eligible());

    for _ in 0..100 {
        if observed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(observed.load(Ordering::SeqCst));
    Ok(())
}

struct ReportsCancelled;

#[async_trait]
impl DurableJob for ReportsCancelled {
    async fn run(&self, _current_job: CurrentJob) -> Result<(), BoxError> {
        Err(JobError::Cancelled.into())
    }
}

#[tokio::test]
async fn bodies_reporting_cancellation_are_cancelled_failures() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    t.jobs.register("ABORTED_IMPORT", |_: &JobRecord| ReportsCancelled)?;
    let job = seed(
        &t.repo,
        "ABORTED_IMPORT",
        JobType::RunOnce,
        t.clock.now(),
        1,
    )
    .await?;

    let summary = t.jobs.engine().startup_runner().run_jobs().await?;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exhausted, 1);

    let job = t.jobs.find(job.id).await?;
    let error = job.last_error_message().unwrap();
    assert!(error.starts_with("Cancelled"));
    assert!(error.contains("job_name=\"ABORTED_IMPORT\""));
    assert!(!error.contains("trace="));
    Ok(())
}

/// Store whose deletes always fail.
#[derive(Clone)]
struct UndeletableRepo(InMemoryJobRepo);

struct UndeletableOp(InMemoryJobOp);

#[async_trait]
impl JobRepo for UndeletableRepo {
    type Op = UndeletableOp;

    async fn begin_op(&self, isolation: IsolationLevel) -> Result<UndeletableOp, JobError> {
        Ok(UndeletableOp(self.0.begin_op(isolation).await?))
    }
}

#[async_trait]
impl JobOp for UndeletableOp {
    async fn find_due_job(&mut self, query: &DueJobQuery) -> Result<Option<JobRecord>, JobError> {
        self.0.find_due_job(query).await
    }

    async fn find_existing_schedule(
        &mut self,
        job_name: &JobName,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Option<JobRecord>, JobError> {
        self.0.find_existing_schedule(job_name, execution_time).await
    }

    async fn find_pending_schedule(
        &mut self,
        job_name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, JobError> {
        self.0.find_pending_schedule(job_name, now).await
    }

    async fn find_by_id(&mut self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        self.0.find_by_id(id).await
    }

    async fn list_by_name(&mut self, job_name: &JobName) -> Result<Vec<JobRecord>, JobError> {
        self.0.list_by_name(job_name).await
    }

    async fn insert(&mut self, new_job: NewJobRecord) -> Result<JobRecord, JobError> {
        self.0.insert(new_job).await
    }

    async fn update(&mut self, job: &JobRecord) -> Result<(), JobError> {
        self.0.update(job).await
    }

    async fn delete(&mut self, _id: JobId) -> Result<bool, JobError> {
        Err(JobError::Config("deletes are disabled".to_string()))
    }

    async fn delete_records_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        self.0.delete_records_older_than(cutoff).await
    }

    async fn commit(self) -> Result<(), JobError> {
        self.0.commit().await
    }

    async fn rollback(self) -> Result<(), JobError> {
        self.0.rollback().await
    }
}

#[tokio::test]
async fn unregistered_job_that_cannot_be_deleted_is_recorded_as_not_found() -> anyhow::Result<()> {
    let memory = InMemoryJobRepo::new();
    let clock = la_clock(saturday_night());
    let notifier = RecordingNotificationSender::new();
    let jobs = Jobs::with_repo(
        UndeletableRepo(memory.clone()),
        DurableJobsConfig::test_mode(),
        notification_config(),
        clock.clone(),
        notifier.clone(),
    );
    let job = seed(
        &memory,
        "RETIRED",
        JobType::Recurring,
        clock.now() - Duration::hours(1),
        2,
    )
    .await?;

    let summary = jobs.engine().recurring_runner().run_jobs().await?;
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.exhausted, 1);

    let job = jobs.find(job.id).await?;
    assert_eq!(job.remaining_attempts(), 0);
    assert_eq!(job.error_messages().len(), 2);
    assert!(job.error_messages().iter().all(|e| {
        e.starts_with("JobNotFound")
            && e.contains("delete failed")
            && e.contains("deletes are disabled")
    }));
    assert_eq!(notifier.sent().len(), 1);
    assert!(notifier.sent()[0].subject.contains("RETIRED"));
    Ok(())
}

#[tokio::test]
async fn panics_are_recorded_as_execution_failures() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    t.jobs.register("PANICKY", |_: &JobRecord| Panics)?;
    let job = seed(
        &t.repo,
        "PANICKY",
        JobType::RunOnce,
        t.clock.now() + Duration::days(1),
        1,
    )
    .await?;

    let summary = t.jobs.engine().startup_runner().run_jobs().await?;
    assert_eq!(summary.failed, 1);

    let job = t.jobs.find(job.id).await?;
    let error = job.last_error_message().unwrap();
    assert!(error.starts_with("ExecutionFailure"));
    assert!(error.contains("Job panicked: boom"));
    assert!(!error.contains("trace="));
    assert_eq!(t.notifier.sent().len(), 1);
    Ok(())
}

struct RejectsRecord;

impl JobInitializer for RejectsRecord {
    fn init(&self, job: &JobRecord) -> Result<Box<dyn DurableJob>, BoxError> {
        Err(format!("no tenant configured for {}", job.job_name).into())
    }
}

#[tokio::test]
async fn initializer_errors_are_invalid_argument_failures() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    t.jobs.register("TENANT_SYNC", RejectsRecord)?;
    let job = seed(
        &t.repo,
        "TENANT_SYNC",
        JobType::RunOnEachStartup,
        t.clock.now(),
        2,
    )
    .await?;

    t.jobs.engine().startup_runner().run_jobs().await?;

    let job = t.jobs.find(job.id).await?;
    assert_eq!(job.remaining_attempts(), 0);
    assert!(
        job.error_messages()
            .iter()
            .all(|e| e.starts_with("InvalidArgument") && e.contains("no tenant configured"))
    );
    Ok(())
}

#[tokio::test]
async fn recurring_runner_yields_once_its_lifespan_is_spent() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    let runs = Counter::default();
    let clock = t.clock.clone();
    let body_runs = runs.clone();
    t.jobs.register("BATCH", move |_: &JobRecord| AdvancesClock {
        clock: clock.clone(),
        by: Duration::seconds(2),
        runs: body_runs.clone(),
    })?;
    for minutes in 1..=3 {
        seed(
            &t.repo,
            "BATCH",
            JobType::Recurring,
            t.clock.now() - Duration::minutes(minutes),
            5,
        )
        .await?;
    }

    let engine = t.jobs.engine();
    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runs.count(), 1);

    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runs.count(), 2);
    Ok(())
}

#[tokio::test]
async fn runner_flavors_only_select_their_own_job_types() -> anyhow::Result<()> {
    let t = test_jobs(saturday_night());
    let counter = Counter::default();
    let body = counter.clone();
    t.jobs.register("EITHER", move |_: &JobRecord| body.clone())?;
    let recurring = seed(
        &t.repo,
        "EITHER",
        JobType::Recurring,
        t.clock.now() - Duration::hours(1),
        5,
    )
    .await?;
    let future_recurring = seed(
        &t.repo,
        "EITHER",
        JobType::Recurring,
        t.clock.now() + Duration::hours(1),
        5,
    )
    .await?;
    let startup = seed(
        &t.repo,
        "EITHER",
        JobType::RunOnce,
        t.clock.now() + Duration::hours(1),
        5,
    )
    .await?;

    let engine = t.jobs.engine();
    let summary = engine.startup_runner().run_jobs().await?;
    assert_eq!(summary.succeeded, 1);
    assert!(t.jobs.find(startup.id).await?.succeeded());
    assert!(!t.jobs.find(recurring.id).await?.succeeded());

    let summary = engine.recurring_runner().run_jobs().await?;
    assert_eq!(summary.succeeded, 1);
    assert!(t.jobs.find(recurring.id).await?.succeeded());
    assert!(!t.jobs.find(future_recurring.id).await?.succeeded());
    assert_eq!(counter.count(), 2);
    Ok(())
}
