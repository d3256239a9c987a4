//! Execution-time context available to running jobs.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{JobId, clock::ClockHandle, entity::JobName};

/// Context provided to a [`DurableJob`](crate::DurableJob) while it is executing.
pub struct CurrentJob {
    id: JobId,
    job_name: JobName,
    remaining_attempts: u32,
    execution_time: DateTime<Utc>,
    clock: ClockHandle,
    cancellation: CancellationToken,
}

impl CurrentJob {
    pub(super) fn new(
        id: JobId,
        job_name: JobName,
        remaining_attempts: u32,
        execution_time: DateTime<Utc>,
        clock: ClockHandle,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            job_name,
            remaining_attempts,
            execution_time,
            clock,
            cancellation,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_name(&self) -> &JobName {
        &self.job_name
    }

    /// Attempts left after this one. `0` means this is the final attempt.
    pub fn remaining_attempts(&self) -> u32 {
        self.remaining_attempts
    }

    pub fn execution_time(&self) -> DateTime<Utc> {
        self.execution_time
    }

    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }

    /// Non-blocking check whether the runner gave up on this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the runner stops waiting for this attempt.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use durable_jobs::CurrentJob;
    /// # async fn example(current_job: CurrentJob) {
    /// tokio::select! {
    ///     _ = current_job.cancelled() => {
    ///         // Timed out, stop early
    ///         return;
    ///     }
    ///     _ = do_work() => {}
    /// }
    /// # }
    /// # async fn do_work() {}
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
