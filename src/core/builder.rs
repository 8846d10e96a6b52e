use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::orchestrator::{Orchestrator, Parts};
use crate::broker::{Broker, InMemoryBroker};
use crate::clock::Clock;
use crate::config::Config;
use crate::controller::{Collaborators, Controller, Lifecycle};
use crate::credentials::{CredentialResolver, StaticCredentials};
use crate::error::ConfigError;
use crate::events::Bus;
use crate::logs::{FanoutSink, LogSink, RingBuffer, TracingSink};
use crate::monitor::Monitor;
use crate::runtime::ContainerRuntime;
use crate::store::{InMemoryStateStore, LeaseStore, StateStore};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Builder for an [`Orchestrator`].
///
/// Only the container runtime is mandatory. Store and broker default to the in-memory
/// implementations (single node), credentials to an empty resolver.
pub struct OrchestratorBuilder {
    cfg: Config,
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<(Arc<dyn StateStore>, Arc<dyn LeaseStore>)>,
    broker: Option<Arc<dyn Broker>>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    sinks: Vec<Arc<dyn LogSink>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    clock: Option<Clock>,
    os_signals: bool,
}

impl OrchestratorBuilder {
    pub fn new(cfg: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            cfg,
            runtime,
            store: None,
            broker: None,
            credentials: None,
            sinks: Vec::new(),
            subscribers: Vec::new(),
            clock: None,
            os_signals: true,
        }
    }

    /// State store; the same backend serves the monitor's leases.
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: StateStore + LeaseStore,
    {
        let leases: Arc<dyn LeaseStore> = store.clone();
        let state: Arc<dyn StateStore> = store;
        self.store = Some((state, leases));
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Extra destination for container output and lifecycle notes. The ring buffer behind
    /// [`Orchestrator::instance_logs`] and the tracing sink are always installed.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Event subscribers. Each gets its own worker and bounded queue.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Clock shared by the store and the engine. Tests pass one anchored at a known time.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Whether [`Orchestrator::run`] listens for OS termination signals (default: yes).
    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    /// Validates the configuration and wires everything together.
    ///
    /// Must be called inside a tokio runtime: subscriber workers are spawned here.
    pub fn build(self) -> Result<Arc<Orchestrator>, ConfigError> {
        self.cfg.validate()?;
        let clock = self.clock.unwrap_or_default();
        let (store, leases) = self.store.unwrap_or_else(|| {
            let store = Arc::new(InMemoryStateStore::new(clock.clone()));
            let leases: Arc<dyn LeaseStore> = store.clone();
            let state: Arc<dyn StateStore> = store;
            (state, leases)
        });
        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(InMemoryBroker::new()),
        };
        let credentials: Arc<dyn CredentialResolver> = match self.credentials {
            Some(credentials) => credentials,
            None => Arc::new(StaticCredentials::new()),
        };

        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        let runtime_token = CancellationToken::new();

        let logs = Arc::new(RingBuffer::new(self.cfg.log_ring_capacity));
        let mut sinks: Vec<Arc<dyn LogSink>> = vec![logs.clone(), Arc::new(TracingSink)];
        sinks.extend(self.sinks);

        let lifecycle = Arc::new(Lifecycle::new(
            Collaborators {
                store: Arc::clone(&store),
                runtime: self.runtime,
                broker: Arc::clone(&broker),
                credentials,
                sink: Arc::new(FanoutSink::new(sinks)),
                bus: bus.clone(),
                clock: clock.clone(),
            },
            self.cfg.clone(),
            runtime_token.child_token(),
        ));
        let controllers = self
            .cfg
            .queues
            .iter()
            .map(|queue| {
                Controller::new(
                    queue.clone(),
                    Arc::clone(&lifecycle),
                    Arc::clone(&broker),
                    bus.clone(),
                )
            })
            .collect();
        let monitor = Monitor::new(
            Arc::clone(&lifecycle),
            leases,
            Arc::clone(&broker),
            bus.clone(),
            clock,
        );

        Ok(Arc::new(Orchestrator::new_internal(Parts {
            cfg: self.cfg,
            bus,
            subs,
            store,
            broker,
            lifecycle,
            controllers,
            monitor,
            logs,
            runtime_token,
            os_signals: self.os_signals,
        })))
    }
}
