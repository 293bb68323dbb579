//! Fan-out of agent events to subscribers
//!
//! A [`Subscription`] is released exactly once: either explicitly through
//! [`Subscription::dispose`], which consumes it, or implicitly on drop.
//! Once released, its sender is gone from the hub and nothing more is
//! delivered to it.

use super::protocol::AgentEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<AgentEvent>>>,
}

impl HubInner {
    fn remove(&self, id: u64) -> bool {
        match self.subscribers.lock() {
            Ok(mut subs) => subs.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }
}

/// Broadcasts agent events to every live subscription
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().insert(id, tx);
        tracing::debug!(subscription = id, "Agent event subscription registered");
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
            rx,
            released: false,
        }
    }

    /// Deliver an event to all live subscriptions. Returns how many received it.
    pub fn publish(&self, event: AgentEvent) -> usize {
        let mut subs = self.lock_subscribers();
        subs.retain(|_, tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subs.values() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<AgentEvent>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receiving end of an [`EventHub`] registration
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Stop delivery and release the registration.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
        tracing::debug!(subscription = self.id, "Agent event subscription disposed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::BatchDoneEvent;
    use crate::batch::BatchId;

    fn done() -> AgentEvent {
        AgentEvent::BatchDone(BatchDoneEvent {
            batch_id: BatchId::new(),
            sent: 1,
            failed: 0,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        let event = done();

        assert_eq!(hub.publish(event.clone()), 1);
        assert_eq!(sub.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_dispose_stops_delivery() {
        let hub = EventHub::new();
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        sub.dispose();
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(done()), 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let hub = EventHub::new();
        {
            let _sub = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_each_subscription_independent() {
        let hub = EventHub::new();
        let first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_ne!(first.id(), second.id());

        first.dispose();
        let event = done();
        assert_eq!(hub.publish(event.clone()), 1);
        assert_eq!(second.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_subscription_outlives_hub() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        drop(hub);
        assert_eq!(sub.recv().await, None);
        sub.dispose();
    }
}
