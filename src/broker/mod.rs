//! # Work queue / broker.
//!
//! Two primitives over named queues plus one global control channel:
//!
//! - [`Broker::publish`] puts a [`ReconcileSignal`] on a worker queue, optionally after a
//!   delay (deferred re-enqueue of restart resyncs).
//! - [`Broker::subscribe`] yields an infinite stream of [`Delivery`]s. Delivery is
//!   at-least-once: a delivery dropped without [`Delivery::ack`] goes back on the queue.
//! - [`Broker::broadcast`] / [`Broker::subscribe_control`] fan a [`ControlSignal`] out to
//!   every replica. The broker does not deduplicate; replicas race for an advisory lease.
//!
//! Ordering is best-effort FIFO per queue. Consumers must tolerate reordering and
//! duplicates; [`ReconcileSignal::idempotency_key`] identifies duplicates.
//!
//! ```text
//! API / Monitor / Controller ──publish(queue, signal)──► [queue] ──► Controller(s) on queue
//! Monitor ──broadcast(tick)──► control ──► every replica ──► lease race ──► one sweep
//! ```

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;
use crate::model::{ControlSignal, ReconcileSignal};

pub use memory::InMemoryBroker;

/// Publish knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Hold the message back for this long before it becomes visible.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    /// Visible immediately.
    pub fn now() -> Self {
        Self::default()
    }

    /// Visible after `delay`.
    pub fn after(delay: Duration) -> Self {
        Self {
            delay: (!delay.is_zero()).then_some(delay),
        }
    }
}

/// Settlement hook supplied by a broker implementation.
pub trait Acknowledge: Send + 'static {
    /// Processing finished; forget the message.
    fn ack(self: Box<Self>);
    /// Processing did not finish; make the message visible again.
    fn nack(self: Box<Self>);
}

/// One delivered message. Dropping it unsettled counts as a nack.
pub struct Delivery {
    pub queue: String,
    pub signal: ReconcileSignal,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        signal: ReconcileSignal,
        attempt: u32,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            queue: queue.into(),
            signal,
            attempt,
            acker: Some(acker),
        }
    }

    /// Idempotency key of the carried signal.
    pub fn key(&self) -> String {
        self.signal.idempotency_key()
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("signal", &self.signal)
            .field("attempt", &self.attempt)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Infinite stream of deliveries from one queue.
pub type Subscription = BoxStream<'static, Delivery>;

/// Stream of broadcast control signals.
pub type ControlSubscription = BoxStream<'static, ControlSignal>;

/// Durable multi-consumer message channel.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(
        &self,
        queue: &str,
        signal: ReconcileSignal,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Competing consumer on `queue`: each message goes to one subscriber.
    async fn subscribe(&self, queue: &str) -> Result<Subscription, BrokerError>;

    async fn broadcast(&self, signal: ControlSignal) -> Result<(), BrokerError>;

    /// Observes broadcasts sent after this call.
    fn subscribe_control(&self) -> ControlSubscription;

    /// Messages visible and not yet delivered on `queue`.
    async fn depth(&self, queue: &str) -> Result<usize, BrokerError>;
}
