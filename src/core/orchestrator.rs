//! # Orchestrator: background loops, event fan-out and graceful shutdown.
//!
//! ```text
//! run():
//!   Bus.subscribe() ─► pump ─► SubscriberSet::emit(&Event)         (fire-and-forget)
//!   for queue in cfg.queues:  Controller::run(runtime_token.child_token())
//!   Monitor::run(runtime_token.child_token())
//!
//! Definition / instance operations (operational surface):
//!   put_definition / set_enabled / remove_definition ─► notify_definition
//!        └─► publish create (enabled) or delete (disabled, removed) on the definition's queue
//!   request_stop ─► Lifecycle::request_stop (stopping, then resync)
//!   request_resync / request_restart ─► publish on the instance's queue
//!
//! Shutdown path (OS signal or shutdown()):
//!   Bus.publish(ShutdownRequested) ─► runtime_token.cancel()
//!   wait for loops up to cfg.grace:
//!     ├─ all joined ─► Bus.publish(AllStoppedWithin)
//!     └─ timeout    ─► Bus.publish(GraceExceeded) + ShutdownError::GraceExceeded{stuck}
//!   stop log tails, flush subscribers
//! ```
//!
//! Containers are left running on shutdown; whoever consumes the queues next adopts them.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::alive::AliveTracker;
use super::shutdown;
use crate::broker::{Broker, PublishOptions};
use crate::config::Config;
use crate::controller::{Controller, Lifecycle};
use crate::error::{OrchestratorError, ShutdownError, StoreError};
use crate::events::{Bus, Event, EventKind};
use crate::logs::{LogEntry, RingBuffer};
use crate::model::{
    ActivationDefinition, ActivationInstance, DefinitionEvent, DefinitionId, InstanceId,
    InstanceStatus, ReconcileSignal,
};
use crate::monitor::Monitor;
use crate::store::StateStore;
use crate::subscribers::SubscriberSet;

/// Per-queue view for [`Health`].
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct QueueHealth {
    pub name: String,
    /// Signals waiting on the broker.
    pub depth: usize,
    /// Definitions with a signal in flight on this node.
    pub busy: usize,
}

/// Node summary served by `GET /health`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Health {
    pub node_id: String,
    pub shutting_down: bool,
    pub queues: Vec<QueueHealth>,
    /// `starting` + `running` instances across the store.
    pub active_instances: usize,
    /// Log tails followed by this node.
    pub tails: usize,
}

/// Coordinates controllers, the monitor, event delivery and graceful shutdown.
pub struct Orchestrator {
    cfg: Config,
    bus: Bus,
    subs: Mutex<Option<SubscriberSet>>,
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    lifecycle: Arc<Lifecycle>,
    controllers: Vec<Arc<Controller>>,
    monitor: Arc<Monitor>,
    logs: Arc<RingBuffer>,
    alive: AliveTracker,
    runtime_token: CancellationToken,
    os_signals: bool,
    stopping: AtomicBool,
}

/// Everything [`OrchestratorBuilder`](super::OrchestratorBuilder) hands over.
pub(super) struct Parts {
    pub cfg: Config,
    pub bus: Bus,
    pub subs: SubscriberSet,
    pub store: Arc<dyn StateStore>,
    pub broker: Arc<dyn Broker>,
    pub lifecycle: Arc<Lifecycle>,
    pub controllers: Vec<Arc<Controller>>,
    pub monitor: Arc<Monitor>,
    pub logs: Arc<RingBuffer>,
    pub runtime_token: CancellationToken,
    pub os_signals: bool,
}

impl Orchestrator {
    pub(super) fn new_internal(parts: Parts) -> Self {
        Self {
            cfg: parts.cfg,
            bus: parts.bus,
            subs: Mutex::new(Some(parts.subs)),
            store: parts.store,
            broker: parts.broker,
            lifecycle: parts.lifecycle,
            controllers: parts.controllers,
            monitor: parts.monitor,
            logs: parts.logs,
            alive: AliveTracker::new(),
            runtime_token: parts.runtime_token,
            os_signals: parts.os_signals,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Bus carrying every orchestration event.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Runs the controllers and the monitor until a termination signal or [`shutdown`].
    ///
    /// Returns once every loop stopped, or with [`ShutdownError::GraceExceeded`] when some
    /// did not stop within `grace`. A second call returns immediately.
    ///
    /// [`shutdown`]: Orchestrator::shutdown
    pub async fn run(&self) -> Result<(), ShutdownError> {
        let subs = self.subs.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(subs) = subs else {
            warn!("orchestrator already ran");
            return Ok(());
        };

        let pump_token = CancellationToken::new();
        let pump = tokio::spawn(pump_events(self.bus.subscribe(), subs, pump_token.clone()));

        let mut set = JoinSet::new();
        self.spawn_loops(&mut set);
        info!(
            node = %self.cfg.node_id,
            queues = ?self.cfg.queues,
            "orchestrator running"
        );

        tokio::select! {
            _ = self.termination_signal() => {
                info!("termination signal received");
                self.shutdown();
            }
            _ = self.runtime_token.cancelled() => {}
        }

        let result = self.wait_all_with_grace(&mut set).await;
        self.lifecycle.tailer().shutdown().await;
        pump_token.cancel();
        let _ = pump.await;
        result
    }

    /// Requests a graceful shutdown of [`run`](Orchestrator::run). Idempotent.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();
    }

    /// Completes once shutdown was requested.
    pub async fn wait_shutdown(&self) {
        self.runtime_token.cancelled().await;
    }

    fn spawn_loops(&self, set: &mut JoinSet<()>) {
        for controller in &self.controllers {
            let name = format!("controller:{}", controller.queue());
            let token = self.runtime_token.child_token();
            let controller = Arc::clone(controller);
            set.spawn(self.alive.track(name, async move {
                let queue = controller.queue().to_string();
                if let Err(err) = controller.run(token).await {
                    error!(%queue, error = %err, "controller stopped on broker error");
                }
            }));
        }
        let monitor = Arc::clone(&self.monitor);
        let token = self.runtime_token.child_token();
        set.spawn(self.alive.track("monitor".to_string(), monitor.run(token)));
    }

    async fn termination_signal(&self) {
        if !self.os_signals {
            return std::future::pending().await;
        }
        if let Err(err) = shutdown::wait_for_shutdown_signal().await {
            warn!(error = %err, "termination signals unavailable");
            std::future::pending::<()>().await;
        }
    }

    /// Waits for every loop, bounded by the configured grace period.
    async fn wait_all_with_grace(&self, set: &mut JoinSet<()>) -> Result<(), ShutdownError> {
        let grace = self.cfg.grace;
        let done = async { while set.join_next().await.is_some() {} };

        match tokio::time::timeout(grace, done).await {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                info!("orchestrator stopped");
                Ok(())
            }
            Err(_) => {
                let stuck = self.alive.snapshot();
                warn!(?grace, ?stuck, "grace period exceeded");
                self.bus
                    .publish(Event::new(EventKind::GraceExceeded).with_reason(stuck.join(", ")));
                set.abort_all();
                Err(ShutdownError::GraceExceeded { grace, stuck })
            }
        }
    }

    // === Definitions ===

    /// Validates and stores `def`, then signals its queue.
    pub async fn put_definition(
        &self,
        def: ActivationDefinition,
    ) -> Result<ActivationDefinition, OrchestratorError> {
        def.validate()?;
        let stored = self.store.put_definition(def).await?;
        info!(definition = %stored.id, version = stored.version, enabled = stored.enabled, "definition stored");
        self.notify_definition(DefinitionEvent::Updated(stored.id.clone()))
            .await?;
        Ok(stored)
    }

    /// Enables or disables a definition. Always bumps its version.
    pub async fn set_enabled(
        &self,
        id: &DefinitionId,
        enabled: bool,
    ) -> Result<ActivationDefinition, OrchestratorError> {
        let mut def = self.store.get_definition(id).await?;
        def.enabled = enabled;
        let stored = self.store.put_definition(def).await?;
        info!(definition = %id, version = stored.version, enabled, "definition toggled");
        let event = if enabled {
            DefinitionEvent::Enabled(id.clone())
        } else {
            DefinitionEvent::Disabled(id.clone())
        };
        self.notify_definition(event).await?;
        Ok(stored)
    }

    /// Removes a definition; its instances are stopped by the resulting `delete`.
    pub async fn remove_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<ActivationDefinition, OrchestratorError> {
        let queue = self.queue_of(id).await?;
        let removed = self
            .store
            .remove_definition(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "definition",
                id: id.to_string(),
            })?;
        self.publish(&queue, ReconcileSignal::delete(id.clone()))
            .await?;
        Ok(removed)
    }

    /// Turns a definition change into a reconcile signal.
    ///
    /// An enabled definition gets `create` for its current version; a disabled, deleted
    /// or unknown one gets `delete`.
    pub async fn notify_definition(&self, event: DefinitionEvent) -> Result<(), OrchestratorError> {
        let id = event.definition_id().clone();
        let wanted = match event {
            DefinitionEvent::Created(_) | DefinitionEvent::Updated(_) | DefinitionEvent::Enabled(_) => {
                match self.store.get_definition(&id).await {
                    Ok(def) if def.enabled => Some(def),
                    Ok(_) | Err(StoreError::NotFound { .. }) => None,
                    Err(err) => return Err(err.into()),
                }
            }
            DefinitionEvent::Disabled(_) | DefinitionEvent::Deleted(_) => None,
        };

        match wanted {
            Some(def) => {
                let queue = self.lifecycle.queue_for(&def).await?;
                self.publish(&queue, ReconcileSignal::create(def.id, def.version))
                    .await
            }
            None => {
                let queue = self.queue_of(&id).await?;
                self.publish(&queue, ReconcileSignal::delete(id)).await
            }
        }
    }

    /// Queue of a definition: its own, else its latest instance's, else the default.
    async fn queue_of(&self, id: &DefinitionId) -> Result<String, OrchestratorError> {
        match self.store.get_definition(id).await {
            Ok(def) => {
                if let Some(queue) = def.queue_name {
                    return Ok(queue);
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self
            .store
            .latest_for_definition(id)
            .await?
            .map_or_else(|| self.cfg.default_queue().to_string(), |inst| inst.queue_name))
    }

    async fn publish(&self, queue: &str, signal: ReconcileSignal) -> Result<(), OrchestratorError> {
        self.broker
            .publish(queue, signal, PublishOptions::now())
            .await?;
        Ok(())
    }

    // === Instances ===

    pub async fn instance(&self, id: &InstanceId) -> Result<ActivationInstance, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    /// Instances of a definition, oldest first.
    pub async fn instances(
        &self,
        definition: &DefinitionId,
    ) -> Result<Vec<ActivationInstance>, OrchestratorError> {
        Ok(self.store.list_for_definition(definition).await?)
    }

    /// Force-stop. Returns the row as written; teardown finishes asynchronously.
    pub async fn request_stop(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        self.lifecycle.request_stop(id).await
    }

    /// Queues a `resync` for the instance.
    pub async fn request_resync(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        let instance = self.store.get(id).await?;
        let signal = ReconcileSignal::resync(instance.definition_id.clone(), instance.id.clone());
        self.publish(&instance.queue_name, signal).await?;
        Ok(instance)
    }

    /// Queues a `restart`: the instance is replaced by a fresh one.
    pub async fn request_restart(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        let instance = self.store.get(id).await?;
        let signal = ReconcileSignal::restart(instance.definition_id.clone(), instance.id.clone());
        self.publish(&instance.queue_name, signal).await?;
        Ok(instance)
    }

    /// Buffered log entries of an instance, oldest first; the last `tail` when given.
    pub async fn instance_logs(
        &self,
        id: &InstanceId,
        tail: Option<usize>,
    ) -> Result<Vec<LogEntry>, OrchestratorError> {
        self.store.get(id).await?;
        Ok(match tail {
            Some(n) => self.logs.tail(id, n),
            None => self.logs.snapshot(id),
        })
    }

    pub async fn record_heartbeat(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        self.lifecycle.record_heartbeat(id).await
    }

    pub async fn health(&self) -> Result<Health, OrchestratorError> {
        let mut queues = Vec::with_capacity(self.controllers.len());
        for controller in &self.controllers {
            queues.push(QueueHealth {
                name: controller.queue().to_string(),
                depth: self.broker.depth(controller.queue()).await?,
                busy: controller.busy_definitions().await,
            });
        }
        let active_instances = self
            .store
            .list_by_status(&[InstanceStatus::Starting, InstanceStatus::Running])
            .await?
            .len();
        Ok(Health {
            node_id: self.cfg.node_id.clone(),
            shutting_down: self.runtime_token.is_cancelled(),
            queues,
            active_instances,
            tails: self.lifecycle.tailer().len().await,
        })
    }
}

/// Forwards bus events to the subscriber set until `token` is cancelled, then drains
/// what is already buffered and flushes the subscribers.
async fn pump_events(
    mut rx: broadcast::Receiver<Event>,
    subs: SubscriberSet,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Ok(ev) => subs.emit(&ev),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = token.cancelled() => break,
        }
    }
    while let Ok(ev) = rx.try_recv() {
        subs.emit(&ev);
    }
    subs.shutdown().await;
}
