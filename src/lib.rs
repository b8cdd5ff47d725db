#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bus;
pub mod config;
mod dispatcher;
mod error;
pub mod http;
mod job;
mod memory;
mod postgres;
mod registry;
mod retry;
mod store;
mod worker;

pub use self::bus::{EventBus, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use self::config::Config;
pub use self::dispatcher::{AdminAction, Dispatcher, DispatcherConfig, EnqueueRequest, Enqueued};
pub use self::error::{Error, StoreError};
pub use self::job::{
    EventType, Job, JobAttempt, JobEvent, JobId, JobPriority, JobStatus,
};
pub use self::memory::MemoryStore;
pub use self::postgres::{setup_database, PgStore};
pub use self::registry::{HandlerRegistry, JobContext, JobHandler};
pub use self::retry::{RetryPolicy, RetryStrategy};
pub use self::store::{JobFilter, JobStore, NewAttempt, NewJob};

/// The queue used when a submission does not name one.
pub const DEFAULT_QUEUE: &str = "default";
