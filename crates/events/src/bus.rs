//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes **already committed** events to consumers (projections,
//! joins, sagas). It is not storage: the event log is the source of truth and a
//! consumer that missed messages catches up by re-reading the log from its
//! cursor.
//!
//! Delivery is **at-least-once**: a consumer can see an event again after a
//! restart, so every consumer must be idempotent. Within one stream, messages
//! arrive in append order because publishers publish while still holding the
//! stream's lock; across streams no order is promised.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus: every message published after `subscribe()`.
///
/// Subscriptions are meant for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Command → Event Log (append) → Event Bus (publish) → Consumers
///                                                        ├─ Projections
///                                                        ├─ Materialized joins
///                                                        └─ Sagas
/// ```
///
/// `publish()` may fail (closed transport, poisoned lock). Publishers treat that
/// as a delivery delay, never as a failed write: the events are already durable.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
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
}
