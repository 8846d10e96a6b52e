use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::Admission;
use super::lifecycle::Lifecycle;
use super::slot::SlotState;
use crate::broker::{Broker, Delivery, PublishOptions};
use crate::error::{BrokerError, OrchestratorError};
use crate::events::{Bus, Event, EventKind};
use crate::model::DefinitionId;
use crate::policies::BackoffPolicy;

/// Consumer of one worker queue.
///
/// Signals are routed to per-definition slots: serial within a definition, parallel
/// across definitions, with at most `worker_concurrency` reconciles in flight. A
/// delivery is acked once its reconcile is settled; a retryable failure goes back to the
/// queue with a growing delay instead of being nacked into a hot loop.
pub struct Controller {
    queue: String,
    lifecycle: Arc<Lifecycle>,
    broker: Arc<dyn Broker>,
    bus: Bus,
    backoff: BackoffPolicy,
    permits: Option<Arc<Semaphore>>,

    slots: Mutex<HashMap<DefinitionId, SlotState>>,
    // Consecutive retryable failures per idempotency key.
    failures: Mutex<HashMap<String, u32>>,
    workers: Mutex<JoinSet<()>>,
}

impl Controller {
    pub fn new(
        queue: impl Into<String>,
        lifecycle: Arc<Lifecycle>,
        broker: Arc<dyn Broker>,
        bus: Bus,
    ) -> Arc<Self> {
        let cfg = lifecycle.config();
        let permits = cfg
            .concurrency_limit()
            .map(|n| Arc::new(Semaphore::new(n)));
        let backoff = cfg.runtime_retry.backoff;
        Arc::new(Self {
            queue: queue.into(),
            lifecycle,
            broker,
            bus,
            backoff,
            permits,
            slots: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            workers: Mutex::new(JoinSet::new()),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Definitions with a signal in flight.
    pub async fn busy_definitions(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Consumes the queue until `token` is cancelled, then waits for in-flight work.
    ///
    /// Deliveries still waiting in slots are dropped unsettled, so the broker
    /// redelivers them.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), BrokerError> {
        let mut deliveries = self.broker.subscribe(&self.queue).await?;
        info!(queue = %self.queue, "controller started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = deliveries.next() => match next {
                    Some(delivery) => self.admit(delivery, &token).await,
                    None => {
                        warn!(queue = %self.queue, "subscription ended");
                        break;
                    }
                },
            }
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        while workers.join_next().await.is_some() {}
        self.slots.lock().await.clear();
        info!(queue = %self.queue, "controller stopped");
        Ok(())
    }

    async fn admit(self: &Arc<Self>, delivery: Delivery, token: &CancellationToken) {
        let definition = delivery.signal.definition_id.clone();
        let admission = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(definition.clone())
                .or_insert_with(SlotState::new)
                .admit(delivery)
        };

        match admission {
            Admission::Run(delivery) => {
                let mut workers = self.workers.lock().await;
                while workers.try_join_next().is_some() {}
                workers.spawn(Arc::clone(self).work(definition, delivery, token.clone()));
            }
            Admission::Queued => {}
            Admission::Coalesced(duplicate) => {
                debug!(key = %duplicate.key(), "duplicate signal coalesced");
                duplicate.ack();
            }
            Admission::Superseded(dropped) => {
                for delivery in dropped {
                    debug!(key = %delivery.key(), "signal superseded by delete");
                    delivery.ack();
                }
            }
        }
    }

    /// Drains one definition's slot.
    async fn work(
        self: Arc<Self>,
        definition: DefinitionId,
        first: Delivery,
        token: CancellationToken,
    ) {
        let mut next = Some(first);
        while let Some(delivery) = next {
            if token.is_cancelled() {
                return self.abandon(&definition).await;
            }
            let _permit = match &self.permits {
                Some(permits) => tokio::select! {
                    _ = token.cancelled() => return self.abandon(&definition).await,
                    permit = Arc::clone(permits).acquire_owned() => permit.ok(),
                },
                None => None,
            };
            self.process(delivery).await;

            let mut slots = self.slots.lock().await;
            next = slots.get_mut(&definition).and_then(SlotState::next);
            if next.is_none() {
                slots.remove(&definition);
            }
        }
    }

    /// Drops the slot unsettled; the broker redelivers what was waiting.
    async fn abandon(&self, definition: &DefinitionId) {
        if let Some(slot) = self.slots.lock().await.remove(definition) {
            debug!(definition = %definition, waiting = slot.queue.len(), "slot abandoned");
        }
    }

    async fn process(&self, delivery: Delivery) {
        let key = delivery.key();
        match self.lifecycle.reconcile(&delivery.signal).await {
            Ok(outcome) => {
                debug!(%key, ?outcome, "signal reconciled");
                self.failures.lock().await.remove(&key);
                delivery.ack();
            }
            Err(err) => self.settle_failure(delivery, key, err).await,
        }
    }

    async fn settle_failure(&self, delivery: Delivery, key: String, err: OrchestratorError) {
        if !err.is_retryable() {
            self.failures.lock().await.remove(&key);
            match err {
                OrchestratorError::Configuration(_) => {
                    info!(%key, error = %err, "signal rejected");
                }
                _ => warn!(%key, label = err.as_label(), error = %err, "signal dropped"),
            }
            delivery.ack();
            return;
        }

        let attempt = {
            let mut failures = self.failures.lock().await;
            let n = failures.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let delay = self.backoff.next(attempt - 1);
        warn!(
            %key,
            attempt,
            ?delay,
            label = err.as_label(),
            error = %err,
            "reconcile will be retried"
        );

        let signal = delivery.signal.clone();
        let mut event = Event::new(EventKind::RuntimeRetry)
            .with_definition(signal.definition_id.as_str())
            .with_reason(err.to_string())
            .with_delay(delay)
            .with_attempt(u64::from(attempt));
        if let Some(instance) = &signal.instance_id {
            event = event.with_instance(instance.as_str());
        }
        self.bus.publish(event);

        match self
            .broker
            .publish(&self.queue, signal, PublishOptions::after(delay))
            .await
        {
            Ok(()) => delivery.ack(),
            Err(publish_err) => {
                warn!(%key, error = %publish_err, "retry not queued, releasing delivery");
                delivery.nack();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::clock::Clock;
    use crate::config::Config;
    use crate::controller::Collaborators;
    use crate::credentials::StaticCredentials;
    use crate::logs::TracingSink;
    use crate::model::{ActivationDefinition, InstanceStatus, ReconcileSignal};
    use crate::policies::{JitterPolicy, RetryPolicy};
    use crate::runtime::{Behavior, InMemoryRuntime};
    use crate::store::{InMemoryStateStore, StateStore};
    use std::time::Duration;

    struct Fixture {
        controller: Arc<Controller>,
        runtime: InMemoryRuntime,
        store: Arc<InMemoryStateStore>,
        broker: Arc<InMemoryBroker>,
        bus: Bus,
        token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let clock = Clock::new();
        let runtime = InMemoryRuntime::with_default(Behavior::run_forever());
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new());
        let bus = Bus::new(256);
        let token = CancellationToken::new();
        let mut cfg = Config::default();
        cfg.runtime_retry = RetryPolicy {
            backoff: BackoffPolicy {
                first: Duration::from_millis(50),
                max: Duration::from_secs(1),
                factor: 2.0,
                jitter: JitterPolicy::None,
            },
            max_attempts: 2,
        };
        let lifecycle = Arc::new(Lifecycle::new(
            Collaborators {
                store: store.clone(),
                runtime: Arc::new(runtime.clone()),
                broker: broker.clone(),
                credentials: Arc::new(StaticCredentials::new()),
                sink: Arc::new(TracingSink),
                bus: bus.clone(),
                clock,
            },
            cfg,
            token.child_token(),
        ));
        let controller = Controller::new("activation", lifecycle, broker.clone(), bus.clone());
        Fixture {
            controller,
            runtime,
            store,
            broker,
            bus,
            token,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_creates_produce_one_instance() {
        let f = fixture();
        let def = f
            .store
            .put_definition(ActivationDefinition::new("d1", "rb.yml", "img"))
            .await
            .unwrap();
        for _ in 0..3 {
            f.broker
                .publish("activation", ReconcileSignal::create(def.id.clone(), 1), PublishOptions::now())
                .await
                .unwrap();
        }

        let run = tokio::spawn(Arc::clone(&f.controller).run(f.token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.store.instance_count(), 1);
        assert_eq!(f.runtime.launch_count(), 1);
        let inst = f.store.latest_for_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);

        f.token.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(f.controller.busy_definitions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitions_are_reconciled_independently() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            let def = f
                .store
                .put_definition(ActivationDefinition::new(id, "rb.yml", "img"))
                .await
                .unwrap();
            f.broker
                .publish("activation", ReconcileSignal::create(def.id, 1), PublishOptions::now())
                .await
                .unwrap();
        }

        let run = tokio::spawn(Arc::clone(&f.controller).run(f.token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let running = f.store.list_by_status(&[InstanceStatus::Running]).await.unwrap();
        assert_eq!(running.len(), 3);
        f.token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_failure_is_redelivered() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        let def = f
            .store
            .put_definition(ActivationDefinition::new("d1", "rb.yml", "img"))
            .await
            .unwrap();
        f.broker
            .publish("activation", ReconcileSignal::create(def.id.clone(), 1), PublishOptions::now())
            .await
            .unwrap();
        let run = tokio::spawn(Arc::clone(&f.controller).run(f.token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let inst = f.store.latest_for_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);

        f.runtime.fail_next("status", 2);
        f.broker
            .publish(
                "activation",
                ReconcileSignal::resync(def.id.clone(), inst.id.clone()),
                PublishOptions::now(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let retried: Vec<Event> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|ev| ev.kind == EventKind::RuntimeRetry)
            .collect();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].instance.as_deref(), Some(inst.id.as_str()));
        let after = f.store.get(&inst.id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Running);
        assert_eq!(after.version, inst.version);

        f.token.cancel();
        run.await.unwrap().unwrap();
    }
}
