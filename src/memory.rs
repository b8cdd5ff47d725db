//! In-process store, for tests and single-node embedding.
//!
//! A single mutex over the whole state makes every operation atomic, which
//! trivially satisfies the claim mutual-exclusion contract. Not durable.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobAttempt, JobId, JobStatus};
use crate::store::{JobFilter, JobStore, NewAttempt, NewJob};

const DEFAULT_LIST_LIMIT: usize = 100;

/// A [`JobStore`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    attempts: Vec<JobAttempt>,
    // Insertion sequence per job, the final claim-order tiebreaker when
    // created_at timestamps collide.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock();

        if let Some(key) = new.idempotency_key.as_deref() {
            if let Some(existing) = inner
                .jobs
                .values()
                .find(|job| job.idempotency_key.as_deref() == Some(key))
            {
                return Err(StoreError::DuplicateIdempotencyKey {
                    existing: existing.id,
                });
            }
        }

        let now = Utc::now();
        let job = Job {
            id: new.id,
            queue: new.queue,
            payload: new.payload,
            max_retries: new.max_retries,
            run_at: new.run_at,
            status: JobStatus::Pending,
            priority: new.priority,
            idempotency_key: new.idempotency_key,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(job.id, seq);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock();

        let best = {
            let seq = &inner.seq;
            inner
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Pending && job.run_at <= now)
                .max_by_key(|job| {
                    (
                        job.priority,
                        Reverse(job.created_at),
                        Reverse(seq.get(&job.id).copied().unwrap_or(u64::MAX)),
                    )
                })
                .map(|job| job.id)
        };

        let Some(id) = best else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).ok_or_else(|| {
            StoreError::Decode(format!("claimed job {id} disappeared"))
        })?;
        job.status = JobStatus::Processing;
        job.locked_by = Some(worker_id.to_owned());
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.transition(id, &[JobStatus::Processing], JobStatus::Completed, None))
    }

    async fn mark_failed(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.transition(id, &[JobStatus::Processing], JobStatus::Failed, None))
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.transition(
            id,
            &[JobStatus::Pending, JobStatus::Processing],
            JobStatus::Cancelled,
            None,
        ))
    }

    async fn reschedule_for_retry(
        &self,
        id: JobId,
        new_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.transition(
            id,
            &[JobStatus::Processing],
            JobStatus::Pending,
            Some(new_run_at),
        ))
    }

    async fn retry_now(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.transition(id, &[JobStatus::Failed], JobStatus::Pending, Some(now)))
    }

    async fn append_attempt(&self, new: NewAttempt) -> Result<JobAttempt, StoreError> {
        let attempt = JobAttempt {
            id: new.id,
            job_id: new.job_id,
            attempt_number: new.attempt_number,
            started_at: new.started_at,
            completed_at: None,
            status: JobStatus::Processing,
            error_message: None,
        };
        self.inner.lock().attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(attempt) = inner.attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.status = status;
            attempt.error_message = error_message;
            attempt.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn list_attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, StoreError> {
        let inner = self.inner.lock();
        let mut attempts: Vec<JobAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| {
                filter
                    .queue
                    .as_deref()
                    .is_none_or(|q| job.queue == q)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| {
            (
                Reverse(job.created_at),
                Reverse(inner.seq.get(&job.id).copied().unwrap_or(0)),
            )
        });
        let limit = filter
            .limit
            .map(|l| l.max(0) as usize)
            .unwrap_or(DEFAULT_LIST_LIMIT);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn job_stats(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let inner = self.inner.lock();
        let mut stats = BTreeMap::new();
        for job in inner.jobs.values() {
            *stats.entry(job.status.as_str().to_owned()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn release_expired(
        &self,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = now - chrono::Duration::milliseconds(visibility_timeout.as_millis() as i64);
        let mut inner = self.inner.lock();
        let mut released = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.locked_at.is_some_and(|locked_at| locked_at < cutoff)
            {
                job.status = JobStatus::Pending;
                job.locked_by = None;
                job.locked_at = None;
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}

impl MemoryStore {
    fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        new_run_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return false;
        };
        if !from.contains(&job.status) {
            return false;
        }
        job.status = to;
        job.locked_by = None;
        job.locked_at = None;
        if let Some(run_at) = new_run_at {
            job.run_at = run_at;
        }
        job.updated_at = Utc::now();
        true
    }
}
