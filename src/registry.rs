//! Maps queue names to handler functions.
//!
//! Handlers are registered at startup and shared read-only by every worker.
//! A job whose queue has no handler (and no default fallback) fails
//! immediately without consuming its retry budget.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::job::Job;

/// Execution context passed to handlers alongside the job.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    /// The lease expiry. Handlers exceeding it are failed, so side effects
    /// past the deadline may replay under another worker.
    pub deadline: DateTime<Utc>,
}

/// A user-supplied execution function. Handlers should be effectively
/// idempotent: delivery is at-least-once.
pub type JobHandler = Arc<dyn Fn(JobContext, Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registry of handlers keyed by queue name, with an optional default.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
    default: Option<JobHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.handlers.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a queue.
    pub fn with_handler<F, Fut>(mut self, queue: &str, handler: F) -> Self
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(queue.to_owned(), box_handler(handler));
        self
    }

    /// Register the fallback handler for queues without one of their own.
    pub fn with_default_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.default = Some(box_handler(handler));
        self
    }

    /// Look up the handler for a queue, falling back to the default.
    pub fn get(&self, queue: &str) -> Option<JobHandler> {
        self.handlers
            .get(queue)
            .cloned()
            .or_else(|| self.default.clone())
    }

    /// Queue names with a dedicated handler.
    pub fn queues(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

fn box_handler<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, job| handler(ctx, job).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_some;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_job(queue: &str) -> Job {
        Job {
            id: Uuid::new_v4(),
            queue: queue.to_owned(),
            payload: json!(null),
            max_retries: 0,
            run_at: Utc::now(),
            status: crate::job::JobStatus::Processing,
            priority: crate::job::JobPriority::Normal,
            idempotency_key: None,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dedicated_handler_wins_over_default() {
        let registry = HandlerRegistry::new()
            .with_handler("emails", |_ctx, _job| async { Ok(()) })
            .with_default_handler(|_ctx, _job| async { anyhow::bail!("default") });

        let handler = assert_some!(registry.get("emails"));
        let ctx = JobContext { deadline: Utc::now() };
        assert!(handler(ctx, sample_job("emails")).await.is_ok());

        let fallback = assert_some!(registry.get("unknown"));
        assert!(fallback(ctx, sample_job("unknown")).await.is_err());
    }

    #[test]
    fn missing_queue_without_default_is_none() {
        let registry = HandlerRegistry::new().with_handler("emails", |_ctx, _job| async { Ok(()) });
        assert!(registry.get("unknown").is_none());
    }
}
