//! Error types surfaced by the durable job engine.

use thiserror::Error;

use std::time::Duration;

use crate::{JobId, entity::JobName};

/// Error type returned by job bodies and initializers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("JobError - Sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JobError - Migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("JobError - Config: {0}")]
    Config(String),
    #[error("JobError - JobNotFound: no job registered under '{0}'")]
    JobNotFound(JobName),
    #[error("JobError - DuplicateRegistration: '{0}' is already registered")]
    DuplicateRegistration(JobName),
    #[error("JobError - RegistryFinalized: jobs can no longer be registered")]
    RegistryFinalized,
    #[error("JobError - JobInitError: {0}")]
    JobInitError(String),
    #[error("JobError - Timeout: job did not complete within {0:?}")]
    Timeout(Duration),
    #[error("JobError - Cancelled: job execution was cancelled")]
    Cancelled,
    #[error("JobError - SerializationConflict: concurrent transaction touched the same rows")]
    SerializationConflict,
    #[error("JobError - RecordNotFound: {0}")]
    RecordNotFound(JobId),
    #[error("JobError - InvalidJobType: {0}")]
    InvalidJobType(String),
}

impl JobError {
    /// `true` when retrying the whole transaction may succeed.
    pub fn is_serialization_conflict(&self) -> bool {
        matches!(self, JobError::SerializationConflict)
    }
}
