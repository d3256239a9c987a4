//! Catalogue of job bodies keyed by job name.

use std::{collections::HashMap, sync::Arc};

use super::{
    entity::{JobName, JobRecord, JobType},
    error::JobError,
    job::{DurableJob, JobInitializer},
    resolver::ExecutionTimeResolver,
};

/// A registered job body together with how it gets scheduled.
pub struct RegisteredJob {
    name: JobName,
    job_type: JobType,
    initializer: Box<dyn JobInitializer>,
    resolver: Option<Arc<dyn ExecutionTimeResolver>>,
}

impl RegisteredJob {
    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn resolver(&self) -> Option<&Arc<dyn ExecutionTimeResolver>> {
        self.resolver.as_ref()
    }

    pub(crate) fn init(&self, job: &JobRecord) -> Result<Box<dyn DurableJob>, JobError> {
        self.initializer
            .init(job)
            .map_err(|e| JobError::JobInitError(e.to_string()))
    }
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.name)
            .field("job_type", &self.job_type)
            .field("scheduled", &self.resolver.is_some())
            .finish()
    }
}

/// Write-once-per-name mapping from job name to its body.
///
/// Built at startup and then shared read-only with the schedulers and runners.
/// A record referencing a name missing from the registry is not an error here;
/// the runner deletes such records when it encounters them.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<JobName, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that only runs when a record is seeded for it.
    pub fn register<I: JobInitializer>(
        &mut self,
        name: impl Into<JobName>,
        initializer: I,
    ) -> Result<(), JobError> {
        self.insert(name.into(), JobType::RunOnce, Box::new(initializer), None)
    }

    /// Register a job the scheduler books via `resolver`.
    ///
    /// `job_type` decides which scheduler flavor books it: `RECURRING` jobs
    /// are topped up by the recurring scheduler, `RUN_ONCE` and
    /// `RUN_ON_EACH_STARTUP` by the startup scheduler.
    pub fn register_scheduled<I, R>(
        &mut self,
        name: impl Into<JobName>,
        job_type: JobType,
        initializer: I,
        resolver: R,
    ) -> Result<(), JobError>
    where
        I: JobInitializer,
        R: ExecutionTimeResolver,
    {
        self.insert(
            name.into(),
            job_type,
            Box::new(initializer),
            Some(Arc::new(resolver)),
        )
    }

    /// Shorthand for [`register_scheduled`](Self::register_scheduled) with [`JobType::Recurring`].
    pub fn register_recurring<I, R>(
        &mut self,
        name: impl Into<JobName>,
        initializer: I,
        resolver: R,
    ) -> Result<(), JobError>
    where
        I: JobInitializer,
        R: ExecutionTimeResolver,
    {
        self.register_scheduled(name, JobType::Recurring, initializer, resolver)
    }

    pub fn get(&self, name: &JobName) -> Result<&RegisteredJob, JobError> {
        self.jobs
            .get(name)
            .ok_or_else(|| JobError::JobNotFound(name.clone()))
    }

    pub fn contains(&self, name: &JobName) -> bool {
        self.jobs.contains_key(name)
    }

    /// All registrations carrying a resolver, ordered by name.
    pub fn scheduled_jobs(&self) -> Vec<&RegisteredJob> {
        let mut jobs: Vec<_> = self
            .jobs
            .values()
            .filter(|job| job.resolver.is_some())
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn insert(
        &mut self,
        name: JobName,
        job_type: JobType,
        initializer: Box<dyn JobInitializer>,
        resolver: Option<Arc<dyn ExecutionTimeResolver>>,
    ) -> Result<(), JobError> {
        if self.jobs.contains_key(&name) {
            return Err(JobError::DuplicateRegistration(name));
        }
        tracing::debug!(job_name = %name, job_type = %job_type, "job registered");
        self.jobs.insert(
            name.clone(),
            RegisteredJob {
                name,
                job_type,
                initializer,
                resolver,
            },
        );
        Ok(())
    }
}
