//! Event publishing/subscription abstraction (mechanics only).
//!
//! A bus fans every published message out to all live subscriptions, in
//! publish order. A subscription is a scoped resource: it is released by an
//! explicit [`Subscription::unsubscribe`] call or by being dropped, and the
//! bus stops delivering to it from that point on.

use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

/// A subscription to an event stream.
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(change) = subscription.recv().await {
///     apply(change);
/// }
/// ```
///
/// Messages from a single publisher arrive in the order they were published.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus is gone or the
    /// subscription was closed and drained.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Release the subscription. The bus drops it from its fan-out list.
    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Domain-agnostic event bus.
///
/// `publish` can fail (e.g. the bus is poisoned); callers decide whether to
/// log or propagate. Implementations must be shareable across tasks.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Number of subscriptions still receiving messages.
    fn subscriber_count(&self) -> usize;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn subscriber_count(&self) -> usize {
        (**self).subscriber_count()
    }
}
