//! Postgres-backed job store.
//!
//! One row per job in `batch_jobs`. The context is kept as `(job_type,
//! context jsonb)` and re-validated on load; progress, result and errors are
//! plain columns / jsonb.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Insert of an existing id |
//! | Database (check violation) | `23514` | `Storage` | Row breaks a table constraint |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | Other | N/A | `Storage` | Pool closed, network errors, etc. |
//!
//! ## Optimistic Concurrency
//!
//! `update` locks the row (`SELECT ... FOR UPDATE`), compares the stored
//! `version` with the caller's expectation, applies the shared update checks,
//! and writes `version + 1` in the same transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use forgebatch_batch::{BatchJob, BatchJobContext, BatchJobError, BatchJobProgress, BatchJobResult, BatchJobStatus};
use forgebatch_core::{BatchJobId, ExpectedVersion, UserId};

use super::store::{check_update, JobQuery, JobStore, JobStoreError};

/// DDL for the `batch_jobs` table. Applied by [`PostgresJobStore::migrate`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_jobs (
    id                UUID PRIMARY KEY,
    job_type          TEXT NOT NULL,
    context           JSONB NOT NULL,
    status            TEXT NOT NULL,
    advancement_count BIGINT NOT NULL DEFAULT 0 CHECK (advancement_count >= 0),
    total_count       BIGINT NULL CHECK (total_count IS NULL OR total_count >= 0),
    result            JSONB NULL,
    error             JSONB NULL,
    last_error        JSONB NULL,
    created_by        UUID NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 0,
    cancel_requested  BOOLEAN NOT NULL DEFAULT FALSE,
    retry_scheduled   BOOLEAN NOT NULL DEFAULT FALSE,
    version           BIGINT NOT NULL CHECK (version > 0),
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    processing_at     TIMESTAMPTZ NULL,
    completed_at      TIMESTAMPTZ NULL,
    failed_at         TIMESTAMPTZ NULL,
    canceled_at       TIMESTAMPTZ NULL
);
CREATE INDEX IF NOT EXISTS batch_jobs_created_by_idx ON batch_jobs (created_by, created_at DESC);
"#;

const COLUMNS: &str = "id, job_type, context, status, advancement_count, total_count, result, error, \
    last_error, created_by, attempts, cancel_requested, retry_scheduled, version, created_at, \
    updated_at, processing_at, completed_at, failed_at, canceled_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the table if it does not exist.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(job_id = %job.id), err)]
    async fn insert(&self, mut job: BatchJob) -> Result<BatchJob, JobStoreError> {
        job.version = 1;
        let sql = format!(
            "INSERT INTO batch_jobs ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        bind_job(sqlx::query(&sql), &job)?
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        Ok(job)
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM batch_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job.id, status = job.status.as_str()), err)]
    async fn update(&self, mut job: BatchJob, expected: ExpectedVersion) -> Result<BatchJob, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {COLUMNS} FROM batch_jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(*job.id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_row", e))?
            .ok_or(JobStoreError::NotFound(job.id))?;
        let stored = decode_row(&row)?;

        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: stored.version,
            });
        }
        check_update(&stored, &job)?;
        job.version = stored.version + 1;

        sqlx::query(
            r#"
            UPDATE batch_jobs SET
                status = $2,
                advancement_count = $3,
                total_count = $4,
                result = $5,
                error = $6,
                last_error = $7,
                attempts = $8,
                cancel_requested = $9,
                retry_scheduled = $10,
                version = $11,
                updated_at = $12,
                processing_at = $13,
                completed_at = $14,
                failed_at = $15,
                canceled_at = $16
            WHERE id = $1
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(to_i64(job.progress.advancement_count))
        .bind(job.progress.total_count.map(to_i64))
        .bind(to_json(&job.result)?)
        .bind(to_json(&job.error)?)
        .bind(to_json(&job.last_error)?)
        .bind(job.attempts as i32)
        .bind(job.cancel_requested)
        .bind(job.retry_scheduled)
        .bind(to_i64(job.version))
        .bind(job.updated_at)
        .bind(job.processing_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.canceled_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip_all, err)]
    async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, JobStoreError> {
        let statuses: Option<Vec<String>> = query
            .status
            .as_ref()
            .map(|s| s.iter().map(|st| st.as_str().to_string()).collect());

        let sql = format!(
            "SELECT {COLUMNS} FROM batch_jobs \
             WHERE ($1::uuid IS NULL OR created_by = $1) \
               AND ($2::text IS NULL OR job_type = $2) \
               AND ($3::text[] IS NULL OR status = ANY($3)) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $4 OFFSET $5"
        );
        let rows = sqlx::query(&sql)
            .bind(query.created_by.map(|u| *u.as_uuid()))
            .bind(query.job_type.as_deref())
            .bind(statuses)
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_row).collect()
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_job<'q>(query: PgQuery<'q>, job: &BatchJob) -> Result<PgQuery<'q>, JobStoreError> {
    Ok(query
        .bind(*job.id.as_uuid())
        .bind(job.job_type())
        .bind(job.context.to_json())
        .bind(job.status.as_str())
        .bind(to_i64(job.progress.advancement_count))
        .bind(job.progress.total_count.map(to_i64))
        .bind(to_json(&job.result)?)
        .bind(to_json(&job.error)?)
        .bind(to_json(&job.last_error)?)
        .bind(*job.created_by.as_uuid())
        .bind(job.attempts as i32)
        .bind(job.cancel_requested)
        .bind(job.retry_scheduled)
        .bind(to_i64(job.version))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.processing_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.canceled_at))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<JsonValue>, JobStoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to encode column: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Option<JsonValue>) -> Result<Option<T>, JobStoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to decode column: {e}")))
}

#[derive(Debug, FromRow)]
struct BatchJobRow {
    id: uuid::Uuid,
    job_type: String,
    context: JsonValue,
    status: String,
    advancement_count: i64,
    total_count: Option<i64>,
    result: Option<JsonValue>,
    error: Option<JsonValue>,
    last_error: Option<JsonValue>,
    created_by: uuid::Uuid,
    attempts: i32,
    cancel_requested: bool,
    retry_scheduled: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processing_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<BatchJob, JobStoreError> {
    let r = BatchJobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize batch job row: {e}")))?;
    let id = BatchJobId::from_uuid(r.id);
    let corrupt = |what: String| JobStoreError::Storage(format!("corrupt batch job {id}: {what}"));

    let context = BatchJobContext::from_parts(&r.job_type, r.context).map_err(|e| corrupt(e.to_string()))?;
    let status: BatchJobStatus = r
        .status
        .parse()
        .map_err(|_| corrupt(format!("unknown status '{}'", r.status)))?;
    let result: Option<BatchJobResult> = from_json(r.result)?;
    let error: Option<BatchJobError> = from_json(r.error)?;
    let last_error: Option<BatchJobError> = from_json(r.last_error)?;

    Ok(BatchJob {
        id,
        context,
        status,
        progress: BatchJobProgress {
            advancement_count: u64::try_from(r.advancement_count).unwrap_or(0),
            total_count: r.total_count.and_then(|t| u64::try_from(t).ok()),
        },
        result,
        error,
        last_error,
        created_by: UserId::from_uuid(r.created_by),
        attempts: u32::try_from(r.attempts).unwrap_or(0),
        cancel_requested: r.cancel_requested,
        retry_scheduled: r.retry_scheduled,
        version: u64::try_from(r.version).unwrap_or(0),
        created_at: r.created_at,
        updated_at: r.updated_at,
        processing_at: r.processing_at,
        completed_at: r.completed_at,
        failed_at: r.failed_at,
        canceled_at: r.canceled_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Storage(format!("constraint violated: {msg}")),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed during {operation}")),
        other => JobStoreError::Storage(format!("database error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
