//! Event fan-out with lossy per-subscriber backpressure.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a full
//! queue drops the event for that subscriber only, so one stalled consumer
//! cannot slow the pipeline or starve its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::job::JobEvent;

/// Default bound of each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Broadcasts [`JobEvent`]s to live subscribers.
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<JobEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        EventBus {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a new subscriber. Dropping the returned handle detaches it.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Detach a subscriber, ending its stream.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    /// Deliver an event to every subscriber whose queue has room. Never
    /// blocks and never fails.
    pub fn publish(&self, event: &JobEvent) {
        let mut disconnected = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(subscriber = *id, "subscriber queue full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => disconnected.push(*id),
                }
            }
        }
        if !disconnected.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in disconnected {
                subscribers.remove(&id);
            }
        }
    }

    /// Detach every subscriber, ending all streams.
    pub fn close(&self) {
        self.subscribers.write().clear();
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A live subscriber handle. Events arrive in publish order; events dropped
/// for this subscriber leave a gap, never a reordering.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<JobEvent>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Receive the next event; `None` once the bus is closed (buffered
    /// events are still delivered first).
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EventType, Job, JobPriority, JobStatus};
    use chrono::Utc;
    use claims::{assert_none, assert_some};
    use serde_json::json;
    use uuid::Uuid;

    fn event(n: i64) -> JobEvent {
        let job = Job {
            id: Uuid::new_v4(),
            queue: "default".to_owned(),
            payload: json!(n),
            max_retries: 0,
            run_at: Utc::now(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            idempotency_key: None,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        JobEvent::created(&job)
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events_fast_one_does_not() {
        let bus = Arc::new(EventBus::new(1));
        let mut fast = bus.subscribe();
        let mut _slow = bus.subscribe();

        for n in 0..3 {
            bus.publish(&event(n));
            // The fast subscriber drains between publishes.
            let received = assert_some!(fast.recv().await);
            assert_eq!(received.payload, Some(json!(n)));
        }

        // The slow subscriber's queue (capacity 1) kept only the first event.
        let received = assert_some!(_slow.recv().await);
        assert_eq!(received.payload, Some(json!(0)));
        assert!(_slow.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_subscription_detaches_it() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_streams_after_buffered_events() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe();
        bus.publish(&event(7));
        bus.close();

        let received = assert_some!(sub.recv().await);
        assert_eq!(received.event_type, EventType::Created);
        assert_none!(sub.recv().await);
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned_on_publish() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe();
        // Simulate a receiver that went away without unsubscribing.
        sub.rx.close();
        bus.publish(&event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
