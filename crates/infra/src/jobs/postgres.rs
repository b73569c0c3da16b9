//! Postgres-backed job store.
//!
//! ## Claim safety
//!
//! Every state change is a single conditional `UPDATE ... WHERE status = ...`.
//! A claim succeeds only when exactly one row moved from `PENDING`, so two
//! workers polling the same table can never both run the same claim. When an
//! update touches no rows, the current status is read back to tell a missing
//! job, an idempotent terminal no-op and an invalid transition apart.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed / Io / Tls / other | `Storage` |
//! | Row decode failure | `Storage` |
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`. The synchronous [`JobStore`] impl drives
//! the async methods on the runtime handle captured at construction, so it
//! must be called from a thread that is not itself running async tasks (the
//! worker loop thread is such a thread).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use jobrunner_core::{SubjectId, TenantId, UserId};

use super::store::{JobStore, JobStoreError};
use super::types::{ErrorDetails, Job, JobId, JobStatus, JobType, NewJob};

/// DDL for the `jobs` table and its polling indexes.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               UUID PRIMARY KEY,
    job_type         TEXT NOT NULL,
    status           TEXT NOT NULL
                     CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'FAILED')),
    progress_message TEXT,
    progress_percent SMALLINT CHECK (progress_percent BETWEEN 0 AND 100),
    tenant_id        UUID NOT NULL,
    subject_id       UUID,
    requester_id     UUID NOT NULL,
    result           JSONB,
    error_message    TEXT,
    error_details    JSONB,
    attempts         INTEGER NOT NULL DEFAULT 0,
    created_at       TIMESTAMPTZ NOT NULL,
    started_at       TIMESTAMPTZ,
    last_claimed_at  TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    updated_at       TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_pending_fifo_idx
    ON jobs (created_at, id) WHERE status = 'PENDING';

CREATE INDEX IF NOT EXISTS jobs_in_progress_claim_idx
    ON jobs (last_claimed_at) WHERE status = 'IN_PROGRESS';

CREATE INDEX IF NOT EXISTS jobs_tenant_idx ON jobs (tenant_id, created_at);
"#;

const JOB_COLUMNS: &str = "id, job_type, status, progress_message, progress_percent, tenant_id, \
    subject_id, requester_id, result, error_message, error_details, attempts, created_at, \
    started_at, last_claimed_at, completed_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store over an existing pool.
    ///
    /// `runtime` is the tokio runtime the pool was created on; the blocking
    /// [`JobStore`] methods run their queries on it.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect to `database_url` on the current runtime.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the `jobs` table and indexes if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(job_type = %request.job_type, tenant_id = %request.tenant_id), err)]
    pub async fn insert_job(&self, request: NewJob) -> Result<Job, JobStoreError> {
        let job = Job::new(request);
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, progress_message, progress_percent, tenant_id,
                subject_id, requester_id, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.progress_message.as_deref())
        .bind(job.progress_percent.map(i16::from))
        .bind(job.tenant_id.as_uuid())
        .bind(job.subject_id.map(Uuid::from))
        .bind(job.requester_id.as_uuid())
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn fetch_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_claimable(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'PENDING' \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_claimable", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_stuck(&self, timeout: Duration) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'IN_PROGRESS' \
             AND COALESCE(last_claimed_at, started_at) < now() - ($1::double precision * interval '1 second') \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(timeout.as_secs_f64())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_stuck", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn claim(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'IN_PROGRESS',
                started_at = COALESCE(started_at, now()),
                last_claimed_at = now(),
                attempts = attempts + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.require_exists(job_id).await?;
        Ok(false)
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    pub async fn write_progress(
        &self,
        job_id: JobId,
        message: &str,
        percent: Option<u8>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress_message = $2,
                progress_percent = CASE
                    WHEN $3::smallint IS NULL THEN progress_percent
                    ELSE GREATEST(COALESCE(progress_percent, 0), LEAST($3::smallint, 100))
                END,
                updated_at = now()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .bind(percent.map(i16::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_progress", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let status = self.require_exists(job_id).await?;
        Err(JobStoreError::InvalidTransition {
            id: job_id,
            status,
            operation: "update_progress",
        })
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    pub async fn write_completed(
        &self,
        job_id: JobId,
        result: serde_json::Value,
    ) -> Result<bool, JobStoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED',
                progress_percent = 100,
                result = $2,
                error_message = NULL,
                error_details = NULL,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_completed", e))?;

        self.terminal_outcome(job_id, outcome.rows_affected(), "complete")
            .await
    }

    #[instrument(skip(self, message, details), fields(job_id = %job_id), err)]
    pub async fn write_failed(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<bool, JobStoreError> {
        let details = serde_json::to_value(&details)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode error details: {e}")))?;
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED',
                result = NULL,
                error_message = $2,
                error_details = $3,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .bind(details)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_failed", e))?;

        self.terminal_outcome(job_id, outcome.rows_affected(), "fail")
            .await
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    pub async fn write_reset(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING',
                progress_message = $2,
                updated_at = now()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_reset", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.require_exists(job_id).await?;
        Ok(false)
    }

    async fn terminal_outcome(
        &self,
        job_id: JobId,
        rows_affected: u64,
        operation: &'static str,
    ) -> Result<bool, JobStoreError> {
        if rows_affected == 1 {
            return Ok(true);
        }
        match self.require_exists(job_id).await? {
            status if status.is_terminal() => Ok(false),
            status => Err(JobStoreError::InvalidTransition {
                id: job_id,
                status,
                operation,
            }),
        }
    }

    async fn require_exists(&self, job_id: JobId) -> Result<JobStatus, JobStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_status", e))?;

        let status = status.ok_or(JobStoreError::NotFound(job_id))?;
        status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("job {job_id}: {e}")))
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, JobStoreError>
    where
        F: std::future::Future<Output = Result<T, JobStoreError>>,
    {
        if Handle::try_current().is_ok() {
            return Err(JobStoreError::Storage(
                "blocking job store call made from inside an async runtime; \
                 call it from the worker thread or use the async methods"
                    .to_string(),
            ));
        }
        self.runtime.block_on(fut)
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, request: NewJob) -> Result<Job, JobStoreError> {
        self.block_on(self.insert_job(request))
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn list_claimable(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_claimable(limit))
    }

    fn list_stuck(&self, timeout: Duration) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_stuck(timeout))
    }

    fn mark_in_progress(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.block_on(self.claim(job_id))
    }

    fn update_progress(
        &self,
        job_id: JobId,
        message: &str,
        percent: Option<u8>,
    ) -> Result<(), JobStoreError> {
        self.block_on(self.write_progress(job_id, message, percent))
    }

    fn complete(&self, job_id: JobId, result: serde_json::Value) -> Result<bool, JobStoreError> {
        self.block_on(self.write_completed(job_id, result))
    }

    fn fail(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<bool, JobStoreError> {
        self.block_on(self.write_failed(job_id, message, details))
    }

    fn reset_stuck(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        self.block_on(self.write_reset(job_id, message))
    }
}

/// Map SQLx errors to JobStoreError.
///
/// Every database failure is treated as transient from the worker's point of
/// view: it is logged and the next tick tries again.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    status: String,
    progress_message: Option<String>,
    progress_percent: Option<i16>,
    tenant_id: Uuid,
    subject_id: Option<Uuid>,
    requester_id: Uuid,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,
    attempts: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            progress_message: row.try_get("progress_message")?,
            progress_percent: row.try_get("progress_percent")?,
            tenant_id: row.try_get("tenant_id")?,
            subject_id: row.try_get("subject_id")?,
            requester_id: row.try_get("requester_id")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            last_claimed_at: row.try_get("last_claimed_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_uuid(row.id);
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("job {id}: {e}")))?;
        let error_details = row
            .error_details
            .map(serde_json::from_value::<ErrorDetails>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {id}: bad error_details: {e}")))?;

        Ok(Job {
            id,
            job_type: JobType::from(row.job_type),
            status,
            progress_message: row.progress_message,
            progress_percent: row.progress_percent.map(|p| p.clamp(0, 100) as u8),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            subject_id: row.subject_id.map(SubjectId::from_uuid),
            requester_id: UserId::from_uuid(row.requester_id),
            result: row.result,
            error_message: row.error_message,
            error_details,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
            started_at: row.started_at,
            last_claimed_at: row.last_claimed_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    Job::try_from(row)
}
