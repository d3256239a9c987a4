use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{DueJobQuery, IsolationLevel, JobOp, JobRepo};
use crate::{
    JobId,
    entity::{JobName, JobRecord, NewJobRecord},
    error::JobError,
};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    type Op = PgJobOp;

    async fn begin_op(&self, isolation: IsolationLevel) -> Result<PgJobOp, JobError> {
        let mut tx = self.pool.begin().await?;
        if isolation == IsolationLevel::Serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
        }
        Ok(PgJobOp { tx })
    }
}

pub struct PgJobOp {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_name: String,
    job_type: String,
    execution_time: DateTime<Utc>,
    remaining_attempts: i32,
    success_time: Option<DateTime<Utc>>,
    error_messages: Vec<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        JobRecord::builder()
            .id(JobId::from(row.id))
            .job_name(JobName::from(row.job_name))
            .job_type(row.job_type.parse()?)
            .execution_time(row.execution_time)
            .remaining_attempts(u32::try_from(row.remaining_attempts).unwrap_or(0))
            .success_time(row.success_time)
            .error_messages(row.error_messages)
            .build()
    }
}

fn map_conflict(e: sqlx::Error) -> JobError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION)
        ) {
            return JobError::SerializationConflict;
        }
    }
    JobError::Sqlx(e)
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobOp for PgJobOp {
    #[instrument(name = "job_repo.find_due_job", skip(self), err)]
    async fn find_due_job(&mut self, query: &DueJobQuery) -> Result<Option<JobRecord>, JobError> {
        let job_types: Vec<String> = query
            .job_types
            .iter()
            .map(|job_type| job_type.as_str().to_string())
            .collect();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_name, job_type, execution_time, remaining_attempts, success_time, error_messages
            FROM durable_jobs
            WHERE job_type = ANY($1)
              AND success_time IS NULL
              AND remaining_attempts > 0
              AND ($2::timestamptz IS NULL OR execution_time <= $2)
            ORDER BY execution_time, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&job_types)
        .bind(query.due_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn find_existing_schedule(
        &mut self,
        job_name: &JobName,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_name, job_type, execution_time, remaining_attempts, success_time, error_messages
            FROM durable_jobs
            WHERE job_name = $1
              AND ($2::timestamptz IS NULL OR execution_time = $2)
            ORDER BY execution_time, id
            LIMIT 1
            "#,
        )
        .bind(job_name.as_str())
        .bind(execution_time)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn find_pending_schedule(
        &mut self,
        job_name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_name, job_type, execution_time, remaining_attempts, success_time, error_messages
            FROM durable_jobs
            WHERE job_name = $1
              AND success_time IS NULL
              AND execution_time > $2
            ORDER BY execution_time, id
            LIMIT 1
            "#,
        )
        .bind(job_name.as_str())
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn find_by_id(&mut self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_name, job_type, execution_time, remaining_attempts, success_time, error_messages
            FROM durable_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list_by_name(&mut self, job_name: &JobName) -> Result<Vec<JobRecord>, JobError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_name, job_type, execution_time, remaining_attempts, success_time, error_messages
            FROM durable_jobs
            WHERE job_name = $1
            ORDER BY execution_time, id
            "#,
        )
        .bind(job_name.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    #[instrument(name = "job_repo.insert", skip(self, new_job), fields(job_name = %new_job.job_name), err)]
    async fn insert(&mut self, new_job: NewJobRecord) -> Result<JobRecord, JobError> {
        sqlx::query(
            r#"
            INSERT INTO durable_jobs (id, job_name, job_type, execution_time, remaining_attempts)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(new_job.id)
        .bind(new_job.job_name.as_str())
        .bind(new_job.job_type.as_str())
        .bind(new_job.execution_time)
        .bind(attempts_column(new_job.remaining_attempts))
        .execute(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        Ok(JobRecord::from(new_job))
    }

    async fn update(&mut self, job: &JobRecord) -> Result<(), JobError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_jobs
            SET remaining_attempts = $2, success_time = $3, error_messages = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(attempts_column(job.remaining_attempts()))
        .bind(job.success_time())
        .bind(job.error_messages())
        .execute(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        if result.rows_affected() == 0 {
            return Err(JobError::RecordNotFound(job.id));
        }
        Ok(())
    }

    async fn delete(&mut self, id: JobId) -> Result<bool, JobError> {
        let result = sqlx::query("DELETE FROM durable_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_conflict)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_records_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        let result = sqlx::query(
            r#"
            DELETE FROM durable_jobs
            WHERE execution_time < $1
              AND (success_time IS NOT NULL OR remaining_attempts <= 0)
            "#,
        )
        .bind(cutoff)
        .execute(&mut *self.tx)
        .await
        .map_err(map_conflict)?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), JobError> {
        self.tx.commit().await.map_err(map_conflict)
    }

    async fn rollback(self) -> Result<(), JobError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
