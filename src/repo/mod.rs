//! Storage contract the engine is written against.
//!
//! The engine never issues queries of its own; every read and write goes
//! through a [`JobOp`], which represents one database transaction.

mod memory;
mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{InMemoryJobOp, InMemoryJobRepo};
pub use pg::{PgJobOp, PgJobRepo};

use crate::{
    JobId,
    entity::{JobName, JobRecord, JobType, NewJobRecord},
    error::JobError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

#[derive(Clone, Debug)]
/// Criteria for selecting the next record a runner should execute.
///
/// Only records without a success time and with attempts left qualify.
pub struct DueJobQuery {
    pub job_types: Vec<JobType>,
    /// When set, only records whose execution time is at or before this instant qualify.
    pub due_at: Option<DateTime<Utc>>,
}

#[async_trait]
/// Factory for transactions against the job store.
pub trait JobRepo: Clone + Send + Sync + 'static {
    type Op: JobOp;

    async fn begin_op(&self, isolation: IsolationLevel) -> Result<Self::Op, JobError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        let mut op = self.begin_op(IsolationLevel::ReadCommitted).await?;
        let job = op.find_by_id(id).await?;
        op.rollback().await?;
        Ok(job)
    }

    async fn list_by_name(&self, job_name: &JobName) -> Result<Vec<JobRecord>, JobError> {
        let mut op = self.begin_op(IsolationLevel::ReadCommitted).await?;
        let jobs = op.list_by_name(job_name).await?;
        op.rollback().await?;
        Ok(jobs)
    }
}

#[async_trait]
/// A single transaction. Dropping it without `commit` rolls it back.
pub trait JobOp: Send + 'static {
    /// Selects and row-locks at most one eligible record.
    ///
    /// Records locked by a concurrent transaction are skipped, so two callers
    /// never receive the same record.
    async fn find_due_job(&mut self, query: &DueJobQuery) -> Result<Option<JobRecord>, JobError>;

    /// Looks up a record with the given name and, if provided, execution time.
    async fn find_existing_schedule(
        &mut self,
        job_name: &JobName,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Option<JobRecord>, JobError>;

    /// Earliest record with the given name that has not succeeded and is due
    /// strictly after `now`.
    async fn find_pending_schedule(
        &mut self,
        job_name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, JobError>;

    async fn find_by_id(&mut self, id: JobId) -> Result<Option<JobRecord>, JobError>;

    async fn list_by_name(&mut self, job_name: &JobName) -> Result<Vec<JobRecord>, JobError>;

    async fn insert(&mut self, new_job: NewJobRecord) -> Result<JobRecord, JobError>;

    async fn update(&mut self, job: &JobRecord) -> Result<(), JobError>;

    /// Returns `false` if no record with this id existed.
    async fn delete(&mut self, id: JobId) -> Result<bool, JobError>;

    /// Purges succeeded or exhausted records due before `cutoff`.
    async fn delete_records_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64, JobError>;

    async fn commit(self) -> Result<(), JobError>;

    async fn rollback(self) -> Result<(), JobError>;
}
