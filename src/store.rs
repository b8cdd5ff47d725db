//! The store interface: the only shared mutable state in the system.
//!
//! Every operation either commits atomically or has no effect. The
//! transition methods return `bool` rather than failing so callers can
//! distinguish "the row was not in the expected state" (a lost race with a
//! concurrent cancel or lease expiry) from an infrastructure error.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobAttempt, JobId, JobPriority, JobStatus};

/// Input to [`JobStore::create_job`]. The store fills `status`, the lock
/// fields, and both timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-assigned id (typically a fresh v4 UUID).
    pub id: JobId,
    /// Non-empty routing label.
    pub queue: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Retry budget after the first failure.
    pub max_retries: i32,
    /// Earliest eligible claim instant.
    pub run_at: DateTime<Utc>,
    /// Scheduling priority.
    pub priority: JobPriority,
    /// Optional deduplication token.
    pub idempotency_key: Option<String>,
}

/// Input to [`JobStore::append_attempt`]. Attempts start in `processing`
/// and are finished in place via [`JobStore::finish_attempt`].
#[derive(Debug, Clone)]
pub struct NewAttempt {
    /// Caller-assigned id.
    pub id: Uuid,
    /// The job being executed.
    pub job_id: JobId,
    /// Count of existing attempts for the job plus 1.
    pub attempt_number: i32,
    /// Instant the handler was invoked.
    pub started_at: DateTime<Utc>,
}

/// Filters for [`JobStore::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in this state.
    pub status: Option<JobStatus>,
    /// Only jobs on this queue.
    pub queue: Option<String>,
    /// Maximum number of rows; `None` means the store default of 100.
    pub limit: Option<i64>,
}

/// Transactional persistence for jobs and attempts.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a job. Fails with [`StoreError::DuplicateIdempotencyKey`] when
    /// the idempotency key is already taken.
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Point read.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically claim the highest-priority, earliest-created `pending` job
    /// with `run_at <= now`, transitioning it to `processing` locked by
    /// `worker_id`. Concurrent claimers never block each other and never
    /// receive the same row.
    async fn claim_one(&self, worker_id: &str, now: DateTime<Utc>)
        -> Result<Option<Job>, StoreError>;

    /// `processing -> completed`, clearing the lock. `false` when the job was
    /// no longer `processing`.
    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError>;

    /// `processing -> failed`, clearing the lock. `false` when the job was no
    /// longer `processing`.
    async fn mark_failed(&self, id: JobId) -> Result<bool, StoreError>;

    /// `pending|processing -> cancelled`, clearing the lock. `false` when the
    /// job was already terminal (or absent); there is no transition out of
    /// `completed` or `cancelled`.
    async fn mark_cancelled(&self, id: JobId) -> Result<bool, StoreError>;

    /// `processing -> pending` with a new `run_at`, clearing the lock. The
    /// sole path back to `pending` on the retry route. `false` when the job
    /// was no longer `processing`.
    async fn reschedule_for_retry(
        &self,
        id: JobId,
        new_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Admin force-retry: `failed -> pending` with `run_at = now`. `false`
    /// when the job was not `failed`.
    async fn retry_now(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Append one attempt row in `processing` state.
    async fn append_attempt(&self, new: NewAttempt) -> Result<JobAttempt, StoreError>;

    /// Record the terminal outcome of an attempt.
    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All attempts for a job, `attempt_number` ascending.
    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, StoreError>;

    /// Jobs matching the filter, `created_at` descending.
    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Per-status job counts.
    async fn job_stats(&self) -> Result<BTreeMap<String, i64>, StoreError>;

    /// Return `processing` jobs whose lease expired before `now` to
    /// `pending`. Run at startup to recover jobs orphaned by a crash; returns
    /// the number of recovered rows.
    async fn release_expired(
        &self,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
