//! PostgreSQL store implementation.
//!
//! The claim relies on `FOR UPDATE SKIP LOCKED` so concurrent claimers never
//! block each other and never receive the same row. The priority column is
//! text, so claim ordering ranks it explicitly instead of trusting lexical
//! order.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobAttempt, JobId, JobPriority, JobStatus};
use crate::store::{JobFilter, JobStore, NewAttempt, NewJob};

const DEFAULT_LIST_LIMIT: i64 = 100;

const JOB_COLUMNS: &str = "id, queue, payload, max_retries, run_at, created_at, updated_at, \
                           status, priority, idempotency_key, locked_by, locked_at";

const PRIORITY_RANK: &str =
    "CASE priority WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END";

/// Apply the schema migrations. Safe to run on every startup.
pub async fn setup_database(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// A [`JobStore`] backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: Value,
    max_retries: i32,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
    priority: String,
    idempotency_key: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            queue: row.queue,
            payload: row.payload,
            max_retries: row.max_retries,
            run_at: row.run_at,
            status: JobStatus::from_str(&row.status)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            priority: JobPriority::from_str(&row.priority)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            idempotency_key: row.idempotency_key,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    job_id: Uuid,
    attempt_number: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    error_message: Option<String>,
}

impl TryFrom<AttemptRow> for JobAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(JobAttempt {
            id: row.id,
            job_id: row.job_id,
            attempt_number: row.attempt_number,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status: JobStatus::from_str(&row.status)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            error_message: row.error_message,
        })
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO jobs (id, queue, payload, max_retries, run_at, status, priority, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7) \
             RETURNING {JOB_COLUMNS}"
        );
        let result = sqlx::query_as::<_, JobRow>(&query)
            .bind(new.id)
            .bind(&new.queue)
            .bind(&new.payload)
            .bind(new.max_retries)
            .bind(new.run_at)
            .bind(new.priority.as_str())
            .bind(&new.idempotency_key)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation()
                    && db.constraint() == Some("jobs_idempotency_key_key") =>
            {
                let existing = sqlx::query_scalar::<_, Uuid>(
                    "SELECT id FROM jobs WHERE idempotency_key = $1",
                )
                .bind(&new.idempotency_key)
                .fetch_one(&self.pool)
                .await?;
                Err(StoreError::DuplicateIdempotencyKey { existing })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "WITH next_job AS ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND run_at <= $2 \
                 ORDER BY {PRIORITY_RANK} DESC, created_at ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             UPDATE jobs \
             SET status = 'processing', locked_by = $1, locked_at = $2, updated_at = $2 \
             FROM next_job \
             WHERE jobs.id = next_job.id \
             RETURNING jobs.*"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        self.guarded_transition(id, "completed", &["processing"], None)
            .await
    }

    async fn mark_failed(&self, id: JobId) -> Result<bool, StoreError> {
        self.guarded_transition(id, "failed", &["processing"], None)
            .await
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<bool, StoreError> {
        self.guarded_transition(id, "cancelled", &["pending", "processing"], None)
            .await
    }

    async fn reschedule_for_retry(
        &self,
        id: JobId,
        new_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.guarded_transition(id, "pending", &["processing"], Some(new_run_at))
            .await
    }

    async fn retry_now(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.guarded_transition(id, "pending", &["failed"], Some(now))
            .await
    }

    async fn append_attempt(&self, new: NewAttempt) -> Result<JobAttempt, StoreError> {
        sqlx::query_as::<_, AttemptRow>(
            "INSERT INTO job_attempts (id, job_id, attempt_number, started_at, status) \
             VALUES ($1, $2, $3, $4, 'processing') \
             RETURNING id, job_id, attempt_number, started_at, completed_at, status, error_message",
        )
        .bind(new.id)
        .bind(new.job_id)
        .bind(new.attempt_number)
        .bind(new.started_at)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE job_attempts SET status = $2, error_message = $3, completed_at = $4 \
             WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(&error_message)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, StoreError> {
        sqlx::query_as::<_, AttemptRow>(
            "SELECT id, job_id, attempt_number, started_at, completed_at, status, error_message \
             FROM job_attempts WHERE job_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(JobAttempt::try_from)
        .collect()
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR queue = $2) \
             ORDER BY created_at DESC \
             LIMIT $3"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(&filter.queue)
            .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(0))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn job_stats(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row: PgRow| {
                let status: String = row.try_get("status")?;
                let count: i64 = row.try_get("count")?;
                Ok((status, count))
            })
            .collect()
    }

    async fn release_expired(
        &self,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = now - chrono::Duration::milliseconds(visibility_timeout.as_millis() as i64);
        let result = sqlx::query(
            "UPDATE jobs \
             SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = $2 \
             WHERE status = 'processing' AND locked_at < $1",
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl PgStore {
    async fn guarded_transition(
        &self,
        id: JobId,
        to: &str,
        from: &[&str],
        new_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let query = "UPDATE jobs \
             SET status = $2, locked_by = NULL, locked_at = NULL, updated_at = NOW(), \
                 run_at = COALESCE($3, run_at) \
             WHERE id = $1 AND status = ANY($4)";
        let result = sqlx::query(query)
            .bind(id)
            .bind(to)
            .bind(new_run_at)
            .bind(from.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
