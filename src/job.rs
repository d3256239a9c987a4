//! Traits implemented by application code to provide job bodies.

use async_trait::async_trait;

use super::{current::CurrentJob, entity::JobRecord, error::BoxError};

#[async_trait]
/// The work performed when a job record comes due.
///
/// Returning `Err` records an execution failure on the record and consumes the
/// attempt. The body runs on a dedicated thread that drives it with the
/// engine's runtime handle. When the configured timeout elapses the runner
/// stops waiting and fires [`CurrentJob::cancelled`], but the thread is never
/// killed, so long-running bodies should check for cancellation.
pub trait DurableJob: Send + Sync + 'static {
    async fn run(&self, current_job: CurrentJob) -> Result<(), BoxError>;
}

/// Builds a [`DurableJob`] bound to the record about to execute.
///
/// Any `Fn(&JobRecord) -> J` closure where `J: DurableJob` is an initializer.
pub trait JobInitializer: Send + Sync + 'static {
    fn init(&self, job: &JobRecord) -> Result<Box<dyn DurableJob>, BoxError>;
}

impl<F, J> JobInitializer for F
where
    F: Fn(&JobRecord) -> J + Send + Sync + 'static,
    J: DurableJob,
{
    fn init(&self, job: &JobRecord) -> Result<Box<dyn DurableJob>, BoxError> {
        Ok(Box::new(self(job)))
    }
}
