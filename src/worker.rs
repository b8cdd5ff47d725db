//! The claim → execute → record → emit loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::job::{Job, JobEvent, JobStatus};
use crate::registry::{HandlerRegistry, JobContext};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, NewAttempt};

/// Upper bound of the extra sleep after a claim error, so a store hiccup
/// does not turn the pool into a thundering herd.
const ERROR_JITTER: Duration = Duration::from_secs(1);

const NO_HANDLER_ERROR: &str = "no_handler_registered";

pub(crate) struct Worker {
    pub(crate) id: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) events: mpsc::Sender<JobEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) visibility_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) retry: RetryPolicy,
}

impl Worker {
    /// Claim and process jobs until shutdown is signaled. A job claimed
    /// before the signal is always driven to its terminal store write.
    pub(crate) async fn run(mut self) {
        debug!("worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.store.claim_one(&self.id, Utc::now()).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    trace!("no eligible jobs, polling again");
                    if self.idle_wait(self.poll_interval).await {
                        break;
                    }
                }
                Err(error) => {
                    error!(%error, "failed to claim a job");
                    let jitter =
                        rand::thread_rng().gen_range(0..=ERROR_JITTER.as_millis() as u64);
                    let backoff = self.poll_interval + Duration::from_millis(jitter);
                    if self.idle_wait(backoff).await {
                        break;
                    }
                }
            }
        }
        debug!("worker shutting down");
    }

    /// Sleep, waking early on shutdown. Returns `true` when shutdown was
    /// signaled.
    async fn idle_wait(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = sleep(duration) => false,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => *self.shutdown.borrow(),
                Err(_) => true,
            },
        }
    }

    async fn process(&self, job: Job) {
        let span = info_span!("job", job.id = %job.id, job.queue = %job.queue);
        self.process_inner(job).instrument(span).await;
    }

    async fn process_inner(&self, job: Job) {
        let Some(handler) = self.registry.get(&job.queue) else {
            // A missing handler is a configuration error, not a transient
            // failure: terminal, no retry budget consumed.
            warn!("no handler registered for queue");
            match self.store.mark_failed(job.id).await {
                Ok(true) => self.emit(JobEvent::failed(&job, NO_HANDLER_ERROR)).await,
                Ok(false) => debug!("job left processing before unroutable failure was recorded"),
                Err(error) => error!(%error, "failed to mark unroutable job as failed"),
            }
            return;
        };

        self.emit(JobEvent::started(&job)).await;

        let attempt_number = match self.store.list_attempts(job.id).await {
            Ok(attempts) => attempts.len() as i32 + 1,
            Err(error) => {
                error!(%error, "failed to count prior attempts");
                return;
            }
        };

        let started_at = Utc::now();
        let attempt = match self
            .store
            .append_attempt(NewAttempt {
                id: Uuid::new_v4(),
                job_id: job.id,
                attempt_number,
                started_at,
            })
            .await
        {
            Ok(attempt) => attempt,
            Err(error) => {
                error!(%error, "failed to record attempt");
                return;
            }
        };

        debug!(attempt = attempt_number, "running handler");
        let deadline = started_at
            + chrono::Duration::milliseconds(self.visibility_timeout.as_millis() as i64);
        let ctx = JobContext { deadline };

        // The handler deadline equals the visibility timeout: past it the
        // lease may have been reclaimed, so the outcome must not count.
        let invocation = AssertUnwindSafe(handler(ctx, job.clone())).catch_unwind();
        let result = match tokio::time::timeout(self.visibility_timeout, invocation).await {
            Err(_) => Err(anyhow!(
                "handler deadline exceeded after {:?}",
                self.visibility_timeout
            )),
            Ok(Err(panic)) => Err(panic_error(&*panic)),
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(()) => self.record_success(&job, attempt.id).await,
            Err(error) => {
                self.record_failure(&job, attempt.id, attempt_number, &error)
                    .await;
            }
        }
    }

    async fn record_success(&self, job: &Job, attempt_id: Uuid) {
        if let Err(error) = self
            .store
            .finish_attempt(attempt_id, JobStatus::Completed, None, Utc::now())
            .await
        {
            error!(%error, "failed to finish attempt record");
        }
        match self.store.mark_completed(job.id).await {
            Ok(true) => self.emit(JobEvent::succeeded(job)).await,
            // Cancelled (or reclaimed) while running: the attempt record
            // stands, the outcome is discarded.
            Ok(false) => debug!("job no longer processing, discarding success"),
            Err(error) => error!(%error, "failed to mark job completed"),
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        attempt_id: Uuid,
        attempt_number: i32,
        handler_error: &anyhow::Error,
    ) {
        let message = handler_error.to_string();
        warn!(attempt = attempt_number, error = %message, "handler failed");

        if let Err(error) = self
            .store
            .finish_attempt(
                attempt_id,
                JobStatus::Failed,
                Some(message.clone()),
                Utc::now(),
            )
            .await
        {
            error!(%error, "failed to finish attempt record");
        }

        if attempt_number <= job.max_retries {
            let delay = self.retry.delay_with_jitter(attempt_number.max(0) as u32);
            let run_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            match self.store.reschedule_for_retry(job.id, run_at).await {
                Ok(true) => {
                    debug!(attempt = attempt_number, run_at = %run_at, "retry scheduled");
                    self.emit(JobEvent::failed(job, message)).await;
                    self.emit(JobEvent::retry_scheduled(job, run_at)).await;
                }
                Ok(false) => debug!("job no longer processing, discarding retry"),
                Err(error) => error!(%error, "failed to reschedule job"),
            }
        } else {
            match self.store.mark_failed(job.id).await {
                Ok(true) => self.emit(JobEvent::failed(job, message)).await,
                Ok(false) => debug!("job no longer processing, discarding failure"),
                Err(error) => error!(%error, "failed to mark job failed"),
            }
        }
    }

    async fn emit(&self, event: JobEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event ingress closed, dropping event");
        }
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = payload.downcast_ref::<&str>() {
        anyhow!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        anyhow!("handler panicked: {message}")
    } else {
        anyhow!("handler panicked")
    }
}
