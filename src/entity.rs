//! Persisted job records and their lifecycle transitions.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use std::borrow::Cow;

use crate::{JobId, error::JobError};

/// Number of execution attempts a freshly scheduled record starts with.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Name a job is registered under.
///
/// Kept as a plain string at the persistence boundary so that records written
/// by older deployments stay readable after a job has been retired.
///
/// # Examples
///
/// ```rust
/// use durable_jobs::JobName;
///
/// const CLEANUP: JobName = JobName::new("OLD_JOB_CLEANUP");
/// ```
pub struct JobName(Cow<'static, str>);

impl JobName {
    pub const fn new(job_name: &'static str) -> Self {
        JobName(Cow::Borrowed(job_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobName {
    fn from(value: String) -> Self {
        JobName(Cow::Owned(value))
    }
}

impl From<&'static str> for JobName {
    fn from(value: &'static str) -> Self {
        JobName(Cow::Borrowed(value))
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Decides which scheduler and runner pairing may touch a record.
pub enum JobType {
    /// Executes at most once over the lifetime of the deployment.
    RunOnce,
    /// Scheduled afresh on every startup pass.
    RunOnEachStartup,
    /// Always has a future instance booked by its resolver.
    Recurring,
}

impl JobType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobType::RunOnce => "RUN_ONCE",
            JobType::RunOnEachStartup => "RUN_ON_EACH_STARTUP",
            JobType::Recurring => "RECURRING",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUN_ONCE" => Ok(JobType::RunOnce),
            "RUN_ON_EACH_STARTUP" => Ok(JobType::RunOnEachStartup),
            "RECURRING" => Ok(JobType::Recurring),
            other => Err(JobError::InvalidJobType(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Builder)]
#[builder(pattern = "owned", build_fn(error = "JobError"))]
/// Durable state of one job instance.
///
/// Repository implementations hydrate records through [`JobRecord::builder`];
/// the engine mutates them only through the lifecycle methods below.
pub struct JobRecord {
    pub id: JobId,
    #[builder(setter(into))]
    pub job_name: JobName,
    pub job_type: JobType,
    execution_time: DateTime<Utc>,
    remaining_attempts: u32,
    #[builder(default)]
    success_time: Option<DateTime<Utc>>,
    #[builder(default)]
    error_messages: Vec<String>,
}

impl From<derive_builder::UninitializedFieldError> for JobError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        JobError::Config(e.to_string())
    }
}

impl JobRecord {
    pub fn builder() -> JobRecordBuilder {
        JobRecordBuilder::default()
    }

    pub fn execution_time(&self) -> DateTime<Utc> {
        self.execution_time
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.remaining_attempts
    }

    pub fn success_time(&self) -> Option<DateTime<Utc>> {
        self.success_time
    }

    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }

    /// Most recently appended failure description.
    pub fn last_error_message(&self) -> Option<&str> {
        self.error_messages.last().map(String::as_str)
    }

    /// A record that succeeded is terminal.
    pub fn succeeded(&self) -> bool {
        self.success_time.is_some()
    }

    /// Every attempt consumed without a success.
    pub fn has_failed_with_no_remaining_attempts(&self) -> bool {
        self.remaining_attempts == 0 && self.success_time.is_none()
    }

    /// Whether a runner may still pick this record up.
    pub fn is_eligible(&self) -> bool {
        self.success_time.is_none() && self.remaining_attempts > 0
    }

    /// Consumes one attempt. Called before the body runs, so a crash mid-run still counts.
    pub(crate) fn decrement_remaining_attempts(&mut self) {
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
    }

    pub(crate) fn succeed(&mut self, at: DateTime<Utc>) {
        self.success_time = Some(at);
    }

    pub(crate) fn append_error_message(&mut self, message: String) {
        self.error_messages.push(message);
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(build_fn(error = "JobError"))]
/// A record that has not been persisted yet.
pub struct NewJobRecord {
    #[builder(setter(into), default = "JobId::new()")]
    pub id: JobId,
    #[builder(setter(into))]
    pub job_name: JobName,
    pub job_type: JobType,
    pub execution_time: DateTime<Utc>,
    #[builder(default = "DEFAULT_MAX_ATTEMPTS")]
    pub remaining_attempts: u32,
}

impl NewJobRecord {
    pub fn builder() -> NewJobRecordBuilder {
        NewJobRecordBuilder::default()
    }
}

impl From<NewJobRecord> for JobRecord {
    fn from(new_job: NewJobRecord) -> Self {
        JobRecord {
            id: new_job.id,
            job_name: new_job.job_name,
            job_type: new_job.job_type,
            execution_time: new_job.execution_time,
            remaining_attempts: new_job.remaining_attempts,
            success_time: None,
            error_messages: Vec::new(),
        }
    }
}
