//! Owns the worker pool, the event ingress, and shutdown coordination.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::StoreError;
use crate::job::{JobEvent, JobId, JobPriority};
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::store::{JobStore, NewJob};
use crate::worker::Worker;
use crate::DEFAULT_QUEUE;

/// Pool and pipeline settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of workers.
    pub pool_size: usize,
    /// Lease duration; also the handler deadline.
    pub visibility_timeout: Duration,
    /// How long an idle worker sleeps before the next claim.
    pub poll_interval: Duration,
    /// Backoff policy applied to failed attempts.
    pub retry: RetryPolicy,
    /// `max_retries` for enqueue requests that do not specify one.
    pub default_max_retries: i32,
    /// Bound of the event ingress channel.
    pub event_buffer: usize,
    /// Extra time past the visibility timeout before shutdown aborts
    /// workers that have not returned.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            pool_size: 10,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            default_max_retries: 5,
            event_buffer: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// A job submission. Absent fields take the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueRequest {
    /// Routing label; empty means `default`.
    #[serde(default)]
    pub queue: String,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Retry budget; defaults to the configured `max_attempts`.
    #[serde(default)]
    pub max_retries: Option<i32>,
    /// Scheduling priority; defaults to `normal`.
    #[serde(default)]
    pub priority: Option<JobPriority>,
    /// Earliest execution instant; defaults to now.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// Deduplication token.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Id of the stored job: the new one, or the existing one on dedup.
    pub job_id: JobId,
    /// `true` when the idempotency key matched an existing job and nothing
    /// was inserted.
    pub deduplicated: bool,
}

/// Outcome of an admin transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// The transition applied.
    Applied,
    /// No job with that id.
    NotFound,
    /// The job was not in a state the transition applies to.
    Rejected,
}

struct Tasks {
    workers: Vec<JoinHandle<()>>,
    observer: JoinHandle<()>,
}

/// Coordinates the worker pool and fans lifecycle events out to the bus.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    bus: Arc<EventBus>,
    config: DispatcherConfig,
    events: Mutex<Option<mpsc::Sender<JobEvent>>>,
    ingress: Mutex<Option<mpsc::Receiver<JobEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<Tasks>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Dispatcher {
    /// Wire up a dispatcher. Workers do not run until [`start`](Self::start).
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        bus: Arc<EventBus>,
        config: DispatcherConfig,
    ) -> Self {
        let (events, ingress) = mpsc::channel(config.event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Dispatcher {
            store,
            registry,
            bus,
            config,
            events: Mutex::new(Some(events)),
            ingress: Mutex::new(Some(ingress)),
            shutdown,
            tasks: Mutex::new(None),
        }
    }

    /// Spawn the worker pool and the ingress observer. Calling it twice is a
    /// logged no-op.
    pub fn start(&self) {
        let Some(mut ingress) = self.ingress.lock().take() else {
            warn!("dispatcher already started");
            return;
        };
        let Some(sender) = self.events.lock().clone() else {
            warn!("dispatcher already shut down");
            return;
        };

        let bus = Arc::clone(&self.bus);
        let observer = tokio::spawn(async move {
            while let Some(event) = ingress.recv().await {
                bus.publish(&event);
            }
            debug!("event ingress drained");
        });

        let mut workers = Vec::with_capacity(self.config.pool_size);
        for i in 0..self.config.pool_size {
            let name = format!("worker-{i}");
            info!(worker.name = %name, "starting worker");

            let worker = Worker {
                id: name.clone(),
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                events: sender.clone(),
                shutdown: self.shutdown.subscribe(),
                visibility_timeout: self.config.visibility_timeout,
                poll_interval: self.config.poll_interval,
                retry: self.config.retry,
            };

            let span = info_span!("worker", worker.name = %name);
            workers.push(tokio::spawn(worker.run().instrument(span)));
        }

        *self.tasks.lock() = Some(Tasks { workers, observer });
    }

    /// Persist a job and announce it. Duplicate idempotency keys are a
    /// no-op reporting the existing job's id.
    #[instrument(name = "relayq.enqueue", skip_all, fields(queue = %request.queue))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, StoreError> {
        let now = Utc::now();
        let new = NewJob {
            id: Uuid::new_v4(),
            queue: if request.queue.is_empty() {
                DEFAULT_QUEUE.to_owned()
            } else {
                request.queue
            },
            payload: request.payload,
            max_retries: request
                .max_retries
                .unwrap_or(self.config.default_max_retries)
                .max(0),
            run_at: request.run_at.unwrap_or(now),
            priority: request.priority.unwrap_or_default(),
            idempotency_key: request.idempotency_key.filter(|key| !key.is_empty()),
        };

        match self.store.create_job(new).await {
            Ok(job) => {
                self.emit(JobEvent::created(&job)).await;
                Ok(Enqueued {
                    job_id: job.id,
                    deduplicated: false,
                })
            }
            Err(StoreError::DuplicateIdempotencyKey { existing }) => {
                debug!(%existing, "duplicate idempotency key, returning existing job");
                Ok(Enqueued {
                    job_id: existing,
                    deduplicated: true,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Admin cancel. Running handlers are not interrupted; their outcome is
    /// discarded by the workers' guarded terminal writes.
    pub async fn cancel(&self, id: JobId) -> Result<AdminAction, StoreError> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(AdminAction::NotFound);
        };
        if self.store.mark_cancelled(id).await? {
            self.emit(JobEvent::cancelled(&job)).await;
            Ok(AdminAction::Applied)
        } else {
            Ok(AdminAction::Rejected)
        }
    }

    /// Admin force-retry of a failed job: back to `pending`, eligible now.
    pub async fn force_retry(&self, id: JobId) -> Result<AdminAction, StoreError> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(AdminAction::NotFound);
        };
        let now = Utc::now();
        if self.store.retry_now(id, now).await? {
            self.emit(JobEvent::retry_scheduled(&job, now)).await;
            Ok(AdminAction::Applied)
        } else {
            Ok(AdminAction::Rejected)
        }
    }

    /// Signal workers, wait for them (bounded by the visibility timeout plus
    /// grace), close the ingress, drain the observer, and detach all bus
    /// subscribers. In-flight attempts finish their terminal store writes;
    /// workers still running past the bound are aborted and their jobs left
    /// to lease-expiry recovery on the next start.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        info!("shutting down dispatcher");
        let _ = self.shutdown.send(true);

        let abort_handles: Vec<_> = tasks.workers.iter().map(JoinHandle::abort_handle).collect();
        let deadline = self.config.visibility_timeout + self.config.shutdown_grace;
        match tokio::time::timeout(deadline, join_all(tasks.workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        warn!(%error, "worker task panicked");
                    }
                }
            }
            Err(_) => {
                warn!("workers still running past the visibility timeout, aborting");
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }

        // Dropping the last sender closes the ingress; the observer drains
        // whatever is buffered and exits.
        self.events.lock().take();
        if let Err(error) = tasks.observer.await {
            warn!(%error, "event observer task panicked");
        }

        self.bus.close();
        info!("dispatcher shutdown complete");
    }

    async fn emit(&self, event: JobEvent) {
        let sender = self.events.lock().clone();
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!("event ingress closed, dropping event");
                }
            }
            None => debug!("dispatcher shut down, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::memory::MemoryStore;
    use claims::assert_some;
    use serde_json::json;

    fn dispatcher(store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(HandlerRegistry::new()),
            Arc::new(EventBus::default()),
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store));

        let enqueued = dispatcher
            .enqueue(EnqueueRequest {
                payload: json!({"x": 1}),
                ..EnqueueRequest::default()
            })
            .await
            .unwrap();
        assert!(!enqueued.deduplicated);

        let job = assert_some!(store.get_job(enqueued.job_id).await.unwrap());
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn enqueue_with_duplicate_key_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store));

        let request = EnqueueRequest {
            queue: "emails".to_owned(),
            idempotency_key: Some("once".to_owned()),
            ..EnqueueRequest::default()
        };
        let first = dispatcher.enqueue(request.clone()).await.unwrap();
        let second = dispatcher.enqueue(request).await.unwrap();

        assert_eq!(second.job_id, first.job_id);
        assert!(second.deduplicated);
        assert_eq!(store.list_jobs(Default::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn force_retry_applies_only_to_failed_jobs() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store));

        assert_eq!(
            dispatcher.force_retry(Uuid::new_v4()).await.unwrap(),
            AdminAction::NotFound
        );

        let enqueued = dispatcher.enqueue(EnqueueRequest::default()).await.unwrap();
        // Still pending: there is no failure to retry.
        assert_eq!(
            dispatcher.force_retry(enqueued.job_id).await.unwrap(),
            AdminAction::Rejected
        );

        store.claim_one("w", Utc::now()).await.unwrap();
        assert_eq!(
            dispatcher.force_retry(enqueued.job_id).await.unwrap(),
            AdminAction::Rejected
        );

        store.mark_failed(enqueued.job_id).await.unwrap();
        assert_eq!(
            dispatcher.force_retry(enqueued.job_id).await.unwrap(),
            AdminAction::Applied
        );
        let job = assert_some!(store.get_job(enqueued.job_id).await.unwrap());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_distinguishes_missing_and_terminal_jobs() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store));

        assert_eq!(
            dispatcher.cancel(Uuid::new_v4()).await.unwrap(),
            AdminAction::NotFound
        );

        let enqueued = dispatcher.enqueue(EnqueueRequest::default()).await.unwrap();
        assert_eq!(
            dispatcher.cancel(enqueued.job_id).await.unwrap(),
            AdminAction::Applied
        );
        assert_eq!(
            dispatcher.cancel(enqueued.job_id).await.unwrap(),
            AdminAction::Rejected
        );
    }
}
