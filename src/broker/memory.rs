//! # In-process broker.
//!
//! [`InMemoryBroker`] keeps one FIFO per queue name and a tokio broadcast channel for
//! control signals. It gives the same delivery contract as a networked broker inside a
//! single process: competing consumers, redelivery of unsettled messages, and delayed
//! visibility.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Notify, broadcast};
use tracing::trace;

use super::{
    Acknowledge, Broker, ControlSubscription, Delivery, PublishOptions, Subscription,
};
use crate::error::BrokerError;
use crate::model::{ControlSignal, ReconcileSignal};

const CONTROL_CAPACITY: usize = 256;

struct Envelope {
    signal: ReconcileSignal,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    items: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl QueueState {
    fn items(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, env: Envelope) {
        self.items().push_back(env);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        let mut items = self.items();
        let env = items.pop_front();
        if env.is_some() && !items.is_empty() {
            // Hand the remainder to another waiting consumer.
            self.notify.notify_one();
        }
        env
    }
}

struct MemoryAck {
    queue: Arc<QueueState>,
    signal: ReconcileSignal,
    attempt: u32,
}

impl Acknowledge for MemoryAck {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>) {
        let MemoryAck {
            queue,
            signal,
            attempt,
        } = *self;
        queue.push(Envelope {
            signal,
            attempt: attempt + 1,
        });
    }
}

/// Single-process broker. Cheap to clone; clones share queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<QueueState>>>>,
    control: broadcast::Sender<ControlSignal>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (control, _) = broadcast::channel(CONTROL_CAPACITY);
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            control,
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Drains visible messages without settling semantics. Test inspection helper.
    pub fn drain(&self, queue: &str) -> Vec<ReconcileSignal> {
        self.queue(queue)
            .items()
            .drain(..)
            .map(|env| env.signal)
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        signal: ReconcileSignal,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let state = self.queue(queue);
        let env = Envelope { signal, attempt: 1 };
        match options.delay {
            None => state.push(env),
            Some(delay) => {
                trace!(queue, ?delay, key = %env.signal.idempotency_key(), "delayed publish");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.push(env);
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let state = self.queue(queue);
        let name = queue.to_string();
        let deliveries = stream::unfold((state, name), |(state, name)| async move {
            loop {
                let notified = state.notify.notified();
                if let Some(env) = state.pop() {
                    drop(notified);
                    let ack = MemoryAck {
                        queue: Arc::clone(&state),
                        signal: env.signal.clone(),
                        attempt: env.attempt,
                    };
                    let delivery = Delivery::new(name.clone(), env.signal, env.attempt, Box::new(ack));
                    return Some((delivery, (state, name)));
                }
                notified.await;
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn broadcast(&self, signal: ControlSignal) -> Result<(), BrokerError> {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.control.send(signal);
        Ok(())
    }

    fn subscribe_control(&self) -> ControlSubscription {
        let rx = self.control.subscribe();
        let signals = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(sig) => return Some((sig, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Box::pin(signals)
    }

    async fn depth(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.queue(queue).items().len())
    }
}
