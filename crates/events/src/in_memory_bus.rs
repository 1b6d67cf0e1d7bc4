//! In-memory event bus.

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Unbounded per-subscriber queues, so `publish` never waits
/// - Closed subscriptions are pruned on the next publish or count
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any released subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        tracing::trace!(subscribers = subs.len(), "published change");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            // The subscription is still handed out; it simply never fires.
            Err(_) => tracing::error!("event bus lock poisoned; subscription will stay silent"),
        }

        Subscription::new(rx)
    }

    fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(mut subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_in_publish_order() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1u32).unwrap();
        bus.publish(2u32).unwrap();

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[test]
    fn unsubscribe_releases_the_listener() {
        let bus = InMemoryEventBus::<u32>::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(7).unwrap();
    }

    #[test]
    fn dropping_a_subscription_also_releases_it() {
        let bus = InMemoryEventBus::<u32>::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn nothing_is_delivered_before_subscribing() {
        let bus = InMemoryEventBus::<u32>::new();
        bus.publish(1).unwrap();
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_err());
    }
}
