use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Span, instrument};

use std::{panic::AssertUnwindSafe, time::Duration};

use super::{
    clock::ClockHandle,
    current::CurrentJob,
    entity::JobRecord,
    error::{BoxError, JobError},
    job::DurableJob,
    registry::JobRegistry,
    repo::JobOp,
};

/// What happened to a record the runner selected.
#[derive(Debug)]
pub(crate) enum JobConclusion {
    Succeeded(JobRecord),
    Failed(JobRecord),
    /// The name is no longer registered and the record was removed.
    Deleted,
}

#[derive(Debug)]
enum JobFailure {
    InvalidArgument(String),
    Cancelled(String),
    Timeout(String),
    /// `trace` is the error's source chain; panics carry none.
    Execution {
        message: String,
        trace: Option<String>,
    },
}

impl JobFailure {
    fn kind(&self) -> &'static str {
        match self {
            JobFailure::InvalidArgument(_) => "InvalidArgument",
            JobFailure::Cancelled(_) => "Cancelled",
            JobFailure::Timeout(_) => "Timeout",
            JobFailure::Execution { .. } => "ExecutionFailure",
        }
    }
}

/// Executes one selected record inside the runner's transaction.
pub(crate) struct JobDispatcher<'a> {
    registry: &'a JobRegistry,
    clock: &'a ClockHandle,
    job_timeout: Duration,
}

impl<'a> JobDispatcher<'a> {
    pub fn new(registry: &'a JobRegistry, clock: &'a ClockHandle, job_timeout: Duration) -> Self {
        Self {
            registry,
            clock,
            job_timeout,
        }
    }

    #[instrument(
        name = "durable_jobs.execute_job",
        skip_all,
        fields(job_id, job_name, job_type, attempts_remaining, conclusion, error, error.message, duration_s),
        err
    )]
    pub async fn execute_job<O: JobOp>(
        &self,
        op: &mut O,
        mut job: JobRecord,
    ) -> Result<JobConclusion, JobError> {
        let started = Instant::now();
        let span = Span::current();
        span.record("job_id", tracing::field::display(job.id));
        span.record("job_name", tracing::field::display(&job.job_name));
        span.record("job_type", tracing::field::display(job.job_type));

        job.decrement_remaining_attempts();
        op.update(&job).await?;
        span.record("attempts_remaining", job.remaining_attempts());

        let registered = match self.registry.get(&job.job_name) {
            Ok(registered) => registered,
            Err(e) => return self.handle_unregistered(op, job, e, started).await,
        };

        tracing::info!(
            job_name = %job.job_name,
            job_id = %job.id,
            attempts_remaining = job.remaining_attempts(),
            "executing job"
        );

        let result = match registered.init(&job) {
            Ok(body) => self.run_with_timeout(body, &job).await,
            Err(e) => Err(JobFailure::InvalidArgument(e.to_string())),
        };
        let duration_s = started.elapsed().as_secs_f64();
        span.record("duration_s", duration_s);

        match result {
            Ok(()) => {
                span.record("conclusion", "Succeeded");
                job.succeed(self.clock.now());
                op.update(&job).await?;
                tracing::info!(
                    job_name = %job.job_name,
                    job_id = %job.id,
                    duration_s,
                    "job succeeded"
                );
                Ok(JobConclusion::Succeeded(job))
            }
            Err(failure) => {
                span.record("conclusion", failure.kind());
                span.record("error", true);
                let message = failure_message(&job, &failure, duration_s);
                span.record("error.message", tracing::field::display(&message));
                tracing::error!(job_name = %job.job_name, job_id = %job.id, "{message}");
                job.append_error_message(message);
                op.update(&job).await?;
                Ok(JobConclusion::Failed(job))
            }
        }
    }

    async fn handle_unregistered<O: JobOp>(
        &self,
        op: &mut O,
        mut job: JobRecord,
        error: JobError,
        started: Instant,
    ) -> Result<JobConclusion, JobError> {
        let span = Span::current();
        let delete_error = match op.delete(job.id).await {
            Ok(true) => {
                span.record("conclusion", "Deleted");
                tracing::info!(
                    job_name = %job.job_name,
                    job_id = %job.id,
                    "job is not registered, record deleted"
                );
                return Ok(JobConclusion::Deleted);
            }
            Ok(false) => "record was already gone".to_string(),
            Err(e) => e.to_string(),
        };
        span.record("conclusion", "DeleteFailed");
        span.record("error", true);
        let message = format!(
            "JobNotFound job_name=\"{}\", job_id={}, attempts_remaining={}, duration_s={:.3}, message: {error}; delete failed: {delete_error}",
            job.job_name,
            job.id,
            job.remaining_attempts(),
            started.elapsed().as_secs_f64(),
        );
        span.record("error.message", tracing::field::display(&message));
        tracing::error!(job_name = %job.job_name, job_id = %job.id, "{message}");
        job.append_error_message(message);
        op.update(&job).await?;
        Ok(JobConclusion::Failed(job))
    }

    /// Runs the body on its own OS thread and waits for it on this task.
    ///
    /// The body thread drives the future with the caller's runtime handle, so
    /// a body that blocks cannot starve the timer even on a current-thread
    /// runtime.
    async fn run_with_timeout(
        &self,
        body: Box<dyn DurableJob>,
        job: &JobRecord,
    ) -> Result<(), JobFailure> {
        let cancellation = CancellationToken::new();
        let current_job = CurrentJob::new(
            job.id,
            job.job_name.clone(),
            job.remaining_attempts(),
            job.execution_time(),
            self.clock.clone(),
            cancellation.clone(),
        );
        let runtime = tokio::runtime::Handle::current();
        let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name(format!("durable-job-{}", job.id))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(body.run(current_job))
                }));
                let _ = outcome_tx.send(outcome);
            })
            .map_err(|e| JobFailure::Execution {
                message: format!("could not start job thread: {e}"),
                trace: None,
            })?;

        match tokio::time::timeout(self.job_timeout, outcome_rx).await {
            Ok(Ok(Ok(Ok(())))) => Ok(()),
            Ok(Ok(Ok(Err(e)))) => Err(body_failure(e)),
            Ok(Ok(Err(panic))) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic payload".to_string()
                };
                tracing::error!(
                    target: "durable_jobs.panic",
                    panic_message = %message,
                    "Job panicked during execution"
                );
                Err(JobFailure::Execution {
                    message: format!("Job panicked: {message}"),
                    trace: None,
                })
            }
            Ok(Err(_)) => Err(JobFailure::Cancelled(
                "job thread exited without reporting an outcome".to_string(),
            )),
            Err(_) => {
                // The thread keeps running detached; it only sees the cancellation signal.
                cancellation.cancel();
                Err(JobFailure::Timeout(
                    JobError::Timeout(self.job_timeout).to_string(),
                ))
            }
        }
    }
}

fn body_failure(error: BoxError) -> JobFailure {
    if let Some(cancelled @ JobError::Cancelled) = error.downcast_ref::<JobError>() {
        return JobFailure::Cancelled(cancelled.to_string());
    }
    let mut trace = format!("{error:?}");
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str("\ncaused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    JobFailure::Execution {
        message: error.to_string(),
        trace: Some(trace),
    }
}

fn failure_message(job: &JobRecord, failure: &JobFailure, duration_s: f64) -> String {
    let prefix = format!(
        "{} job_name=\"{}\", job_id={}, attempts_remaining={}, duration_s={duration_s:.3}",
        failure.kind(),
        job.job_name,
        job.id,
        job.remaining_attempts(),
    );
    match failure {
        JobFailure::InvalidArgument(message)
        | JobFailure::Cancelled(message)
        | JobFailure::Timeout(message) => format!("{prefix}, message: {message}"),
        JobFailure::Execution {
            message,
            trace: Some(trace),
        } => format!("{prefix}, error_message={message}, trace={trace}"),
        JobFailure::Execution {
            message,
            trace: None,
        } => format!("{prefix}, error_message={message}"),
    }
}
