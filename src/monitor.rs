//! # Monitor: the polling backstop behind event-driven reconciliation.
//!
//! Status changes normally reach the controller through signals (launch results, tail
//! end-of-stream, delayed restart resyncs). Any of those can be lost: a replica crashes
//! mid-transition, a callback never fires, a delayed publish dies with its process. The
//! monitor periodically re-drives every instance that may still need work.
//!
//! ```text
//! every monitor_interval:
//!   Monitor::run ──broadcast(MonitorTick{tick})──► control channel ──► every replica
//!                                                                          │
//!                            try_acquire("monitor-tick:{tick}", node_id, lease_ttl)
//!                                     ├─ Held     → another replica sweeps
//!                                     └─ Acquired → Monitor::sweep()
//!                                                     ├─ unresponsive running → fail_instance
//!                                                     ├─ non-terminal / restart due → publish resync
//!                                                     └─ active > ceiling → stop the excess
//! ```
//!
//! The lease is never released early: late copies of the same tick from other replicas
//! find it held and skip the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, PublishOptions};
use crate::clock::Clock;
use crate::config::Config;
use crate::controller::Lifecycle;
use crate::error::OrchestratorError;
use crate::events::{Bus, Event, EventKind};
use crate::model::{ActivationInstance, ControlSignal, InstanceStatus, ReconcileSignal};
use crate::store::{LeaseResult, LeaseStore, StateStore};

const CEILING_EXCEEDED: &str = "running ceiling exceeded";

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances looked at.
    pub checked: usize,
    /// Resync signals published.
    pub resynced: usize,
    /// Running instances failed for missing heartbeats.
    pub unresponsive: usize,
    /// Instances stopped to get back under the running ceiling.
    pub ceiling_stopped: usize,
    /// Per-instance actions that failed; the next sweep tries again.
    pub errors: usize,
}

impl SweepReport {
    /// Instances the sweep acted on.
    pub fn corrected(&self) -> usize {
        self.resynced + self.unresponsive + self.ceiling_stopped
    }
}

/// Periodic tick broadcaster and lease-gated sweeper.
pub struct Monitor {
    lifecycle: Arc<Lifecycle>,
    leases: Arc<dyn LeaseStore>,
    broker: Arc<dyn Broker>,
    bus: Bus,
    clock: Clock,
    cfg: Config,
}

impl Monitor {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        leases: Arc<dyn LeaseStore>,
        broker: Arc<dyn Broker>,
        bus: Bus,
        clock: Clock,
    ) -> Arc<Self> {
        let cfg = lifecycle.config().clone();
        Arc::new(Self {
            lifecycle,
            leases,
            broker,
            bus,
            clock,
            cfg,
        })
    }

    /// Broadcasts a tick every `monitor_interval` and handles the ticks of every replica
    /// until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut control = self.broker.subscribe_control();
        let period = self.cfg.monitor_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?period, node = %self.cfg.node_id, "monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let tick = self.tick_number();
                    if let Err(err) = self.broker.broadcast(ControlSignal::MonitorTick { tick }).await {
                        warn!(tick, error = %err, "monitor tick not broadcast");
                    }
                }
                signal = control.next() => match signal {
                    Some(signal) => {
                        if let Err(err) = self.handle_control(signal).await {
                            warn!(label = err.as_label(), error = %err, "monitor sweep failed");
                        }
                    }
                    None => {
                        warn!("control channel closed");
                        break;
                    }
                },
            }
        }
        info!("monitor stopped");
    }

    /// Races for the signal's lease; the winner sweeps. `None` when another holder has it.
    pub async fn handle_control(
        &self,
        signal: ControlSignal,
    ) -> Result<Option<SweepReport>, OrchestratorError> {
        let key = signal.lease_key();
        let lease = self
            .leases
            .try_acquire(&key, &self.cfg.node_id, self.cfg.lease_ttl)
            .await?;
        if let LeaseResult::Held { holder } = lease {
            debug!(%key, %holder, "tick handled elsewhere");
            return Ok(None);
        }

        match signal {
            ControlSignal::MonitorTick { tick } => {
                let report = self.sweep().await?;
                info!(
                    tick,
                    checked = report.checked,
                    corrected = report.corrected(),
                    errors = report.errors,
                    "monitor sweep finished"
                );
                self.bus.publish(
                    Event::new(EventKind::MonitorSweep)
                        .with_attempt(tick)
                        .with_reason(format!(
                            "checked={} corrected={}",
                            report.checked,
                            report.corrected()
                        )),
                );
                Ok(Some(report))
            }
        }
    }

    /// Re-drives every instance that may need work, then enforces the running ceiling.
    pub async fn sweep(&self) -> Result<SweepReport, OrchestratorError> {
        let mut report = SweepReport::default();
        let now = self.clock.now();
        let store = self.lifecycle.store();

        let candidates = store
            .list_by_status(&[
                InstanceStatus::Pending,
                InstanceStatus::Starting,
                InstanceStatus::Running,
                InstanceStatus::Stopping,
                InstanceStatus::Completed,
                InstanceStatus::Failed,
            ])
            .await?;

        for instance in candidates {
            if instance.status.is_terminal() && instance.restart_at.is_none() {
                continue;
            }
            report.checked += 1;

            if let Some(limit) = self.unresponsive(&instance, now) {
                let reason = format!("unresponsive: no heartbeat within {limit:?}");
                match self.lifecycle.fail_instance(&instance.id, &reason).await {
                    Ok(_) => report.unresponsive += 1,
                    Err(err) => {
                        warn!(instance = %instance.id, error = %err, "unresponsive instance not failed");
                        report.errors += 1;
                    }
                }
                continue;
            }

            if instance.status.is_terminal() && !instance.restart_due(now) {
                continue;
            }
            let signal = ReconcileSignal::resync(instance.definition_id.clone(), instance.id.clone());
            match self
                .broker
                .publish(&instance.queue_name, signal, PublishOptions::now())
                .await
            {
                Ok(()) => report.resynced += 1,
                Err(err) => {
                    warn!(instance = %instance.id, error = %err, "resync not published");
                    report.errors += 1;
                }
            }
        }

        self.enforce_ceiling(store.as_ref(), &mut report).await?;
        Ok(report)
    }

    /// Liveness limit the instance missed, if any.
    fn unresponsive(&self, instance: &ActivationInstance, now: DateTime<Utc>) -> Option<Duration> {
        let limit = self.cfg.liveness_timeout()?;
        if instance.status != InstanceStatus::Running {
            return None;
        }
        let silent = (now - instance.last_seen()?).to_std().ok()?;
        (silent > limit).then_some(limit)
    }

    async fn enforce_ceiling(
        &self,
        store: &dyn StateStore,
        report: &mut SweepReport,
    ) -> Result<(), OrchestratorError> {
        let Some(ceiling) = self.cfg.running_ceiling() else {
            return Ok(());
        };
        let mut active = store
            .list_by_status(&[InstanceStatus::Starting, InstanceStatus::Running])
            .await?;
        if active.len() <= ceiling {
            return Ok(());
        }

        let priorities: HashMap<_, _> = store
            .list_definitions()
            .await?
            .into_iter()
            .map(|def| (def.id, def.priority))
            .collect();
        // Lowest priority first; within a priority, newest start first. Definitions that
        // are gone rank below everything.
        active.sort_by_key(|inst| {
            let priority = priorities
                .get(&inst.definition_id)
                .copied()
                .unwrap_or(i32::MIN);
            (priority, std::cmp::Reverse(inst.started_at.unwrap_or(inst.updated_at)))
        });

        let excess = active.len() - ceiling;
        warn!(active = active.len(), ceiling, excess, "running ceiling exceeded");
        for instance in active.into_iter().take(excess) {
            match self
                .lifecycle
                .stop_instance(&instance.id, CEILING_EXCEEDED)
                .await
            {
                Ok(_) => {
                    report.ceiling_stopped += 1;
                    self.bus.publish(
                        Event::new(EventKind::CeilingEnforced)
                            .with_instance(instance.id.as_str())
                            .with_definition(instance.definition_id.as_str()),
                    );
                }
                Err(err) => {
                    warn!(instance = %instance.id, error = %err, "excess instance not stopped");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Interval number of the current time; identical on every replica.
    fn tick_number(&self) -> u64 {
        let secs = u64::try_from(self.clock.now().timestamp()).unwrap_or_default();
        secs / self.cfg.monitor_interval.as_secs().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::controller::Collaborators;
    use crate::credentials::StaticCredentials;
    use crate::logs::TracingSink;
    use crate::model::ActivationDefinition;
    use crate::runtime::{Behavior, InMemoryRuntime};
    use crate::store::InMemoryStateStore;

    struct Fixture {
        monitor: Arc<Monitor>,
        lifecycle: Arc<Lifecycle>,
        runtime: InMemoryRuntime,
        store: Arc<InMemoryStateStore>,
        broker: Arc<InMemoryBroker>,
        bus: Bus,
    }

    fn fixture(cfg: Config) -> Fixture {
        let clock = Clock::new();
        let runtime = InMemoryRuntime::with_default(Behavior::run_forever());
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new());
        let bus = Bus::new(256);
        let lifecycle = Arc::new(Lifecycle::new(
            Collaborators {
                store: store.clone(),
                runtime: Arc::new(runtime.clone()),
                broker: broker.clone(),
                credentials: Arc::new(StaticCredentials::new()),
                sink: Arc::new(TracingSink),
                bus: bus.clone(),
                clock: clock.clone(),
            },
            cfg,
            CancellationToken::new(),
        ));
        let monitor = Monitor::new(
            Arc::clone(&lifecycle),
            store.clone(),
            broker.clone(),
            bus.clone(),
            clock,
        );
        Fixture {
            monitor,
            lifecycle,
            runtime,
            store,
            broker,
            bus,
        }
    }

    async fn running(f: &Fixture, def: ActivationDefinition) -> ActivationInstance {
        let def = f.store.put_definition(def).await.unwrap();
        f.lifecycle
            .reconcile(&ReconcileSignal::create(def.id.clone(), def.version))
            .await
            .unwrap();
        let inst = f.store.latest_for_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        inst
    }

    fn definition(id: &str) -> ActivationDefinition {
        ActivationDefinition::new(id, "rb.yml", "img")
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resyncs_live_instances_only() {
        let f = fixture(Config::default());
        let live = running(&f, definition("live")).await;
        let gone = running(&f, definition("gone")).await;
        f.lifecycle.stop_instance(&gone.id, "test").await.unwrap();
        f.broker.drain("activation");

        let report = f.monitor.sweep().await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.resynced, 1);
        let published = f.broker.drain("activation");
        assert_eq!(published, vec![ReconcileSignal::resync(live.definition_id, live.id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_container_is_caught_by_resync() {
        let f = fixture(Config::default());
        let inst = running(&f, definition("d1")).await;
        f.broker.drain("activation");
        assert!(f.runtime.remove_externally(inst.container_handle.as_deref().unwrap()));

        f.monitor.sweep().await.unwrap();
        for signal in f.broker.drain("activation") {
            f.lifecycle.reconcile(&signal).await.unwrap();
        }

        let after = f.store.get(&inst.id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Failed);
        assert_eq!(after.last_failure_reason.as_deref(), Some("container missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_instance_is_failed_as_unresponsive() {
        let cfg = Config {
            liveness_timeout: Duration::from_secs(60),
            heartbeat_url: Some("http://node-1:8080".into()),
            ..Config::default()
        };
        let f = fixture(cfg);
        let quiet = running(&f, definition("quiet")).await;
        let chatty = running(&f, definition("chatty")).await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        f.lifecycle.record_heartbeat(&chatty.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;

        let report = f.monitor.sweep().await.unwrap();
        assert_eq!(report.unresponsive, 1);

        let quiet = f.store.get(&quiet.id).await.unwrap();
        assert_eq!(quiet.status, InstanceStatus::Failed);
        assert!(
            quiet
                .last_failure_reason
                .as_deref()
                .unwrap()
                .starts_with("unresponsive: no heartbeat within")
        );
        assert_eq!(f.store.get(&chatty.id).await.unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_stops_lowest_priority_newest_first() {
        let unlimited = Config {
            max_running: 0,
            ..Config::default()
        };
        let f = fixture(unlimited);
        let old = running(&f, definition("old").with_priority(1)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let new = running(&f, definition("new").with_priority(1)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let important = running(&f, definition("important").with_priority(9)).await;

        let capped = Config {
            max_running: 2,
            ..Config::default()
        };
        let monitor = Monitor::new(
            Arc::new(Lifecycle::new(
                Collaborators {
                    store: f.store.clone(),
                    runtime: Arc::new(f.runtime.clone()),
                    broker: f.broker.clone(),
                    credentials: Arc::new(StaticCredentials::new()),
                    sink: Arc::new(TracingSink),
                    bus: f.bus.clone(),
                    clock: Clock::new(),
                },
                capped,
                CancellationToken::new(),
            )),
            f.store.clone(),
            f.broker.clone(),
            f.bus.clone(),
            Clock::new(),
        );
        let mut events = f.bus.subscribe();

        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.ceiling_stopped, 1);
        assert_eq!(f.store.get(&new.id).await.unwrap().status, InstanceStatus::Stopped);
        assert_eq!(f.store.get(&old.id).await.unwrap().status, InstanceStatus::Running);
        assert_eq!(
            f.store.get(&important.id).await.unwrap().status,
            InstanceStatus::Running
        );
        let enforced: Vec<Event> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|ev| ev.kind == EventKind::CeilingEnforced)
            .collect();
        assert_eq!(enforced.len(), 1);
        assert_eq!(enforced[0].instance.as_deref(), Some(new.id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_replica_sweeps_per_tick() {
        let f = fixture(Config::default());
        let other = Monitor::new(
            Arc::clone(&f.lifecycle),
            f.store.clone(),
            f.broker.clone(),
            f.bus.clone(),
            Clock::new(),
        );
        let tick = ControlSignal::MonitorTick { tick: 7 };

        let first = f.monitor.handle_control(tick.clone()).await.unwrap();
        let second = other.handle_control(tick.clone()).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let next = other
            .handle_control(ControlSignal::MonitorTick { tick: 8 })
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_every_interval() {
        let f = fixture(Config::default());
        let mut events = f.bus.subscribe();
        let token = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&f.monitor).run(token.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        token.cancel();
        run.await.unwrap();

        let sweeps = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|ev| ev.kind == EventKind::MonitorSweep)
            .count();
        assert_eq!(sweeps, 2);
    }
}
