//! # Lifecycle engine.
//!
//! [`Lifecycle`] turns one [`ReconcileSignal`] into the runtime calls and store writes that
//! bring an instance closer to what its definition asks for.
//!
//! ```text
//! pending ──claim──► starting ──runtime running──► running
//!    │                  │                             │
//!    │                  ├─ permanent launch error ─► failed (no automatic relaunch)
//!    │                  └─ start timeout ──────────► failed ─┐
//!    │                                                       ├─ policy: restart_at, resync later
//!    │                  running ─ exited / missing ─► failed ┘   then failed ──► pending
//!    │                  running ─ exit 0 ──────────► completed ─ policy ──────► pending
//!    └─ stop ─► stopped   starting|running ─ stop ─► stopping ─► stopped
//! ```
//!
//! ## Transitions
//! Every transition is one compare-and-swap write, then an instance-log note on the
//! [`LogSink`], then exactly one [`EventKind::StatusChanged`] on the bus. A lost CAS
//! ([`OrchestratorError::ConcurrencyConflict`]) abandons the decision; [`Lifecycle::reconcile`]
//! re-reads and decides again, up to `max_reconcile_attempts` times.
//!
//! ## Idempotence
//! Creates carry a launch key (`v{definition_version}`, or `restart:{old id}` for a restart
//! request) that the store keeps unique per definition, and container names are derived
//! from the instance id and attempt. Handling the same signal twice converges on the same
//! rows and containers.
//!
//! ## Delays
//! Relaunch delays are never slept on: the instance records `restart_at` and a `resync`
//! is published with that delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, PublishOptions};
use crate::clock::Clock;
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::error::{OrchestratorError, RuntimeError, StoreError};
use crate::events::{Bus, Event, EventKind};
use crate::logs::{LogSink, LogTailer, TailContext};
use crate::model::{
    ActivationDefinition, ActivationInstance, DefinitionId, InstanceId, InstancePatch,
    InstanceStatus, ReconcileSignal, SignalReason,
};
use crate::placement::QueueAssignment;
use crate::policies::{ExitKind, RestartDecision, RestartPolicy};
use crate::runtime::{
    ContainerRuntime, ContainerStatus, LaunchSpec, RuntimeHandle, call_with_retry,
};
use crate::store::StateStore;

const WAITING_FOR_CAPACITY: &str = "waiting for capacity";
const DEFINITION_GONE: &str = "definition disabled or deleted";
const ENTRYPOINT: &str = "ansible-rulebook";

/// What one reconcile did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// State already matched the definition; nothing was written.
    Unchanged,

    /// The instance moved; `status` is where this reconcile left it.
    Converged {
        instance: InstanceId,
        status: InstanceStatus,
    },

    /// The running ceiling is reached; the instance stays `pending`.
    Deferred { instance: InstanceId },
}

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub broker: Arc<dyn Broker>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub sink: Arc<dyn LogSink>,
    pub bus: Bus,
    pub clock: Clock,
}

/// State machine plus side effects for activation instances.
pub struct Lifecycle {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    broker: Arc<dyn Broker>,
    credentials: Arc<dyn CredentialResolver>,
    sink: Arc<dyn LogSink>,
    bus: Bus,
    clock: Clock,
    tailer: Arc<LogTailer>,
    placement: QueueAssignment,
    cfg: Config,
}

impl Lifecycle {
    /// Builds the engine and its log tailer. Tails are children of `runtime_token`.
    pub fn new(parts: Collaborators, cfg: Config, runtime_token: CancellationToken) -> Self {
        let tailer = LogTailer::new(
            TailContext {
                runtime: Arc::clone(&parts.runtime),
                store: Arc::clone(&parts.store),
                broker: Arc::clone(&parts.broker),
                sink: Arc::clone(&parts.sink),
                clock: parts.clock.clone(),
                idle_resync_delay: cfg.status_poll_interval,
            },
            runtime_token,
        );
        Self {
            store: parts.store,
            runtime: parts.runtime,
            broker: parts.broker,
            credentials: parts.credentials,
            sink: parts.sink,
            bus: parts.bus,
            clock: parts.clock,
            tailer,
            placement: QueueAssignment::new(cfg.queues.iter().cloned()),
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn tailer(&self) -> &Arc<LogTailer> {
        &self.tailer
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Queue serving `def`, assigning the least-loaded one on first use.
    pub async fn queue_for(&self, def: &ActivationDefinition) -> Result<String, OrchestratorError> {
        Ok(self.placement.resolve(self.store.as_ref(), def).await?)
    }

    /// Reconciles one signal, re-reading state after every lost compare-and-swap.
    #[instrument(
        skip(self, signal),
        fields(definition = %signal.definition_id, reason = %signal.reason)
    )]
    pub async fn reconcile(
        &self,
        signal: &ReconcileSignal,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        self.rereading(signal.definition_id.as_str(), move || {
            self.reconcile_once(signal)
        })
        .await
    }

    /// Drives one instance towards its definition (the `resync` path).
    pub async fn resync_instance(
        &self,
        id: &InstanceId,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        self.rereading(id.as_str(), move || async move {
            let instance = self.store.get(id).await?;
            self.converge(instance).await
        })
        .await
    }

    /// Fails an instance that is still active, applying its restart policy.
    ///
    /// Used by the monitor for start timeouts and missing heartbeats.
    pub async fn fail_instance(
        &self,
        id: &InstanceId,
        reason: &str,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        self.rereading(id.as_str(), move || async move {
            let instance = self.store.get(id).await?;
            if !instance.status.is_active() {
                return Ok(ReconcileOutcome::Unchanged);
            }
            self.finish(instance, ExitKind::Failed, Some(reason.to_string()))
                .await
        })
        .await
    }

    /// Stops an instance and waits for the container to go away.
    pub async fn stop_instance(
        &self,
        id: &InstanceId,
        reason: &str,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        self.rereading(id.as_str(), move || async move {
            let instance = self.store.get(id).await?;
            self.stop(instance, reason).await
        })
        .await
    }

    /// Records the stop request and leaves the container teardown to the instance's
    /// controller.
    ///
    /// `pending` and relaunch-scheduled instances stop right away; active ones move to
    /// `stopping` and a `resync` finishes the job. Returns the row as written.
    pub async fn request_stop(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        let mut last = None;
        for _ in 0..self.cfg.max_reconcile_attempts.max(1) {
            let instance = self.store.get(id).await?;
            let patch = InstancePatch::default().message("stop requested");
            let written = match instance.status {
                InstanceStatus::Starting | InstanceStatus::Running => {
                    self.transition(&instance, InstanceStatus::Stopping, patch)
                        .await
                        .map(Some)
                }
                InstanceStatus::Pending => self
                    .transition(&instance, InstanceStatus::Stopped, patch.ended(self.clock.now()))
                    .await
                    .map(Some),
                InstanceStatus::Completed | InstanceStatus::Failed
                    if instance.restart_at.is_some() =>
                {
                    self.transition(&instance, InstanceStatus::Stopped, patch.clear_restart_at())
                        .await
                        .map(Some)
                }
                _ => Ok(None),
            };
            match written {
                Ok(Some(row)) => {
                    if row.status == InstanceStatus::Stopping {
                        self.schedule_resync(&row, Duration::ZERO).await?;
                    }
                    return Ok(row);
                }
                Ok(None) => return Ok(instance),
                Err(err) if err.is_conflict() => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| OrchestratorError::ConcurrencyConflict { id: id.to_string() }))
    }

    /// Stamps a liveness heartbeat on an active instance.
    pub async fn record_heartbeat(
        &self,
        id: &InstanceId,
    ) -> Result<ActivationInstance, OrchestratorError> {
        let mut last = None;
        for _ in 0..self.cfg.max_reconcile_attempts.max(1) {
            let instance = self.store.get(id).await?;
            if !instance.status.is_active() {
                return Ok(instance);
            }
            let patch = InstancePatch::default().heartbeat(self.clock.now());
            match self.store.update_if_version(id, instance.version, patch).await {
                Ok(row) => return Ok(row),
                Err(err @ StoreError::Conflict { .. }) => last = Some(err),
                Err(err) => return Err(err.into()),
            }
        }
        Err(last.map_or_else(
            || OrchestratorError::ConcurrencyConflict { id: id.to_string() },
            Into::into,
        ))
    }

    async fn rereading<F, Fut>(
        &self,
        target: &str,
        mut attempt: F,
    ) -> Result<ReconcileOutcome, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ReconcileOutcome, OrchestratorError>>,
    {
        let attempts = self.cfg.max_reconcile_attempts.max(1);
        let mut last = None;
        for n in 1..=attempts {
            match attempt().await {
                Err(err) if err.is_conflict() => {
                    debug!(target, attempt = n, error = %err, "state moved, deciding again");
                    last = Some(err);
                }
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| OrchestratorError::ConcurrencyConflict {
            id: target.to_string(),
        }))
    }

    async fn reconcile_once(
        &self,
        signal: &ReconcileSignal,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        match signal.reason {
            SignalReason::Create => self.on_create(&signal.definition_id).await,
            SignalReason::Delete => self.on_delete(&signal.definition_id).await,
            SignalReason::Restart => {
                self.on_restart(&signal.definition_id, signal.instance_id.as_ref())
                    .await
            }
            SignalReason::Resync => {
                let target = match &signal.instance_id {
                    Some(id) => match self.store.get(id).await {
                        Ok(instance) => Some(instance),
                        Err(StoreError::NotFound { .. }) => None,
                        Err(err) => return Err(err.into()),
                    },
                    None => {
                        self.store
                            .latest_for_definition(&signal.definition_id)
                            .await?
                    }
                };
                match target {
                    Some(instance) => self.converge(instance).await,
                    None => Ok(ReconcileOutcome::Unchanged),
                }
            }
        }
    }

    async fn on_create(
        &self,
        definition_id: &DefinitionId,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let Some(def) = self.wanted_definition(definition_id).await? else {
            debug!("definition gone or disabled, nothing to create");
            return Ok(ReconcileOutcome::Unchanged);
        };

        if let Some(latest) = self.store.latest_for_definition(&def.id).await? {
            if !latest.status.is_terminal() || latest.restart_at.is_some() {
                return self.converge(latest).await;
            }
        }

        let key = format!("v{}", def.version);
        match self.create_instance(&def, key, None).await? {
            Some(instance) => self.launch(instance, &def).await,
            None => Ok(ReconcileOutcome::Unchanged),
        }
    }

    async fn on_delete(
        &self,
        definition_id: &DefinitionId,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        if self.wanted_definition(definition_id).await?.is_some() {
            debug!("definition enabled again, delete is stale");
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.stop_all(definition_id, DEFINITION_GONE).await
    }

    async fn on_restart(
        &self,
        definition_id: &DefinitionId,
        replaced: Option<&InstanceId>,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let Some(def) = self.wanted_definition(definition_id).await? else {
            return Ok(ReconcileOutcome::Unchanged);
        };
        let replaced = match replaced {
            Some(id) => self.store.get(id).await?,
            None => match self.store.latest_for_definition(definition_id).await? {
                Some(latest) => latest,
                None => return self.on_create(definition_id).await,
            },
        };

        let key = format!("restart:{}", replaced.id);
        if let Some(latest) = self.store.latest_for_definition(definition_id).await? {
            if latest.launch_key == key {
                return self.converge(latest).await;
            }
        }

        self.stop_all(definition_id, "restart requested").await?;
        match self
            .create_instance(&def, key, Some(replaced.id.clone()))
            .await?
        {
            Some(instance) => self.launch(instance, &def).await,
            None => Ok(ReconcileOutcome::Unchanged),
        }
    }

    /// Brings an existing instance one step closer to its definition.
    async fn converge(
        &self,
        instance: ActivationInstance,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let Some(def) = self.wanted_definition(&instance.definition_id).await? else {
            return self.stop(instance, DEFINITION_GONE).await;
        };

        match instance.status {
            InstanceStatus::Pending => self.launch(instance, &def).await,
            InstanceStatus::Starting => match instance.container_handle.clone() {
                Some(handle) => self.observe_starting(instance, RuntimeHandle::new(handle)).await,
                None if self.start_deadline_passed(&instance) => {
                    let reason = "start timeout: no container was recorded".to_string();
                    self.finish(instance, ExitKind::Failed, Some(reason)).await
                }
                None => self.start_container(instance, &def).await,
            },
            InstanceStatus::Running => self.observe_running(instance).await,
            InstanceStatus::Stopping => self.finish_stop(instance).await,
            InstanceStatus::Completed | InstanceStatus::Failed => {
                if instance.restart_due(self.clock.now()) {
                    self.relaunch(instance, &def).await
                } else {
                    Ok(ReconcileOutcome::Unchanged)
                }
            }
            InstanceStatus::Stopped => Ok(ReconcileOutcome::Unchanged),
        }
    }

    /// Enabled, valid definition, or `None` when nothing should run for it.
    async fn wanted_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<ActivationDefinition>, OrchestratorError> {
        let def = match self.store.get_definition(id).await {
            Ok(def) => def,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !def.enabled {
            return Ok(None);
        }
        if let Err(err) = def.validate() {
            warn!(definition = %def.id, error = %err, "definition rejected");
            self.bus.publish(
                Event::new(EventKind::ConfigurationRejected)
                    .with_definition(def.id.as_str())
                    .with_reason(err.to_string()),
            );
            return Err(err.into());
        }
        Ok(Some(def))
    }

    /// Persists a fresh `pending` instance; `None` when another consumer won the race.
    async fn create_instance(
        &self,
        def: &ActivationDefinition,
        launch_key: String,
        replaces: Option<InstanceId>,
    ) -> Result<Option<ActivationInstance>, OrchestratorError> {
        let queue = self.placement.resolve(self.store.as_ref(), def).await?;
        let candidate =
            ActivationInstance::pending(def, queue, launch_key, replaces, self.clock.now());
        let instance = match self.store.create(candidate).await {
            Ok(instance) => instance,
            Err(StoreError::AlreadyExists { existing, .. }) => {
                debug!(%existing, "instance already created elsewhere");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        info!(instance = %instance.id, queue = %instance.queue_name, key = %instance.launch_key, "instance created");
        self.sink
            .append_instance_log(
                &instance.id,
                self.clock.now(),
                &format!("created for {} ({})", def.id, instance.launch_key),
            )
            .await;
        self.bus.publish(
            Event::new(EventKind::InstanceCreated)
                .with_instance(instance.id.as_str())
                .with_definition(def.id.as_str())
                .with_reason(instance.launch_key.clone()),
        );
        Ok(Some(instance))
    }

    /// `pending` → `starting` under the running ceiling, then starts the container.
    async fn launch(
        &self,
        instance: ActivationInstance,
        def: &ActivationDefinition,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let claim = self
            .store
            .claim_launch(&instance.id, instance.version, self.cfg.running_ceiling())
            .await;
        let claimed = match claim {
            Ok(claimed) => claimed,
            Err(StoreError::CapacityExhausted { ceiling, active }) => {
                debug!(instance = %instance.id, ceiling, active, "launch deferred");
                if instance.status_message.as_deref() != Some(WAITING_FOR_CAPACITY) {
                    let patch = InstancePatch::default().message(WAITING_FOR_CAPACITY);
                    self.store
                        .update_if_version(&instance.id, instance.version, patch)
                        .await?;
                }
                return Ok(ReconcileOutcome::Deferred {
                    instance: instance.id,
                });
            }
            Err(err) => return Err(err.into()),
        };
        self.announce(instance.status, &claimed).await;
        self.start_container(claimed, def).await
    }

    async fn start_container(
        &self,
        instance: ActivationInstance,
        def: &ActivationDefinition,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let spec = match self.launch_spec(&instance, def).await {
            Ok(spec) => spec,
            Err(err) => return self.launch_failed(instance, def, err.to_string()).await,
        };

        let runtime = &self.runtime;
        let spec_ref = &spec;
        let launched = call_with_retry(
            &self.cfg.runtime_retry,
            "launch",
            Some(self.cfg.launch_timeout),
            move || runtime.launch(spec_ref),
        )
        .await;

        let handle = match launched {
            Ok(handle) => handle,
            Err(RuntimeError::AlreadyExists { handle, name }) => {
                debug!(instance = %instance.id, %name, %handle, "adopting existing container");
                RuntimeHandle::new(handle)
            }
            Err(err) => return self.launch_failed(instance, def, err.to_string()).await,
        };

        info!(instance = %instance.id, %handle, runtime = self.runtime.kind(), "container launched");
        let Some(instance) = self.record_handle(instance, &handle).await? else {
            return Ok(ReconcileOutcome::Unchanged);
        };
        if instance.status == InstanceStatus::Stopping {
            return self.finish_stop(instance).await;
        }
        self.observe_starting(instance, handle).await
    }

    /// Writes the launched container's handle onto its row.
    ///
    /// The row may have moved while the launch was in flight (stop request, monitor
    /// failure, heartbeat). A `stopping` row still takes the handle so the stop can reach
    /// the container. Any other move means nothing will ever reference the container, so
    /// it is removed here and `None` is returned.
    async fn record_handle(
        &self,
        launched_for: ActivationInstance,
        handle: &RuntimeHandle,
    ) -> Result<Option<ActivationInstance>, OrchestratorError> {
        let attempt = launched_for.restart_count;
        let mut current = launched_for;
        for _ in 0..self.cfg.max_reconcile_attempts.max(1) {
            let ours = current.restart_count == attempt
                && matches!(
                    current.status,
                    InstanceStatus::Starting | InstanceStatus::Stopping
                )
                && current
                    .container_handle
                    .as_deref()
                    .is_none_or(|h| h == handle.as_str());
            if !ours {
                warn!(instance = %current.id, %handle, status = %current.status, "instance moved on during launch, removing container");
                match self.stop_container(handle).await {
                    Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
                    Err(err) => {
                        warn!(instance = %current.id, %handle, error = %err, "container not removed");
                    }
                }
                return Ok(None);
            }
            if current.container_handle.is_some() {
                return Ok(Some(current));
            }
            let patch = InstancePatch::default().with_handle(handle.as_str());
            match self
                .store
                .update_if_version(&current.id, current.version, patch)
                .await
            {
                Ok(row) => return Ok(Some(row)),
                Err(StoreError::Conflict { .. }) => {
                    debug!(instance = %current.id, "row changed during launch, re-reading");
                    current = self.store.get(&current.id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(OrchestratorError::ConcurrencyConflict {
            id: current.id.to_string(),
        })
    }

    async fn launch_failed(
        &self,
        instance: ActivationInstance,
        def: &ActivationDefinition,
        reason: String,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        warn!(instance = %instance.id, %reason, "launch failed");
        let restarts = def
            .restart_policy
            .charge_permanent_failure(instance.restart_count);
        let patch = InstancePatch::default()
            .failure(reason.clone())
            .ended(self.clock.now())
            .with_restart_count(restarts);
        let failed = self
            .transition(&instance, InstanceStatus::Failed, patch)
            .await?;
        self.bus.publish(
            Event::new(EventKind::LaunchFailed)
                .with_instance(failed.id.as_str())
                .with_definition(failed.definition_id.as_str())
                .with_reason(reason),
        );
        Ok(converged(&failed))
    }

    async fn observe_starting(
        &self,
        instance: ActivationInstance,
        handle: RuntimeHandle,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        match self.poll_status(&handle).await? {
            ContainerStatus::Running => {
                let patch = InstancePatch::default()
                    .started(self.clock.now())
                    .clear_message();
                let running = self
                    .transition(&instance, InstanceStatus::Running, patch)
                    .await?;
                self.tailer.start(&running).await;
                Ok(converged(&running))
            }
            ContainerStatus::Starting if self.start_deadline_passed(&instance) => {
                let reason = format!(
                    "start timeout: still starting after {:?}",
                    self.cfg.start_timeout
                );
                self.finish(instance, ExitKind::Failed, Some(reason)).await
            }
            ContainerStatus::Starting => {
                self.schedule_resync(&instance, self.cfg.status_poll_interval)
                    .await?;
                Ok(ReconcileOutcome::Unchanged)
            }
            ContainerStatus::Exited { code } => self.exited(instance, code).await,
            ContainerStatus::Missing => {
                let reason = "container disappeared while starting".to_string();
                self.finish(instance, ExitKind::Failed, Some(reason)).await
            }
        }
    }

    async fn observe_running(
        &self,
        instance: ActivationInstance,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let Some(handle) = instance.container_handle.clone().map(RuntimeHandle::new) else {
            let reason = "running without a container handle".to_string();
            return self.finish(instance, ExitKind::Failed, Some(reason)).await;
        };
        match self.poll_status(&handle).await? {
            ContainerStatus::Running | ContainerStatus::Starting => {
                self.tailer.start(&instance).await;
                Ok(ReconcileOutcome::Unchanged)
            }
            ContainerStatus::Exited { code } => self.exited(instance, code).await,
            ContainerStatus::Missing => {
                let reason = "container missing".to_string();
                self.finish(instance, ExitKind::Failed, Some(reason)).await
            }
        }
    }

    async fn exited(
        &self,
        instance: ActivationInstance,
        code: i32,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        if code == 0 {
            self.finish(instance, ExitKind::Completed, None).await
        } else {
            let reason = format!("exit code {code}");
            self.finish(instance, ExitKind::Failed, Some(reason)).await
        }
    }

    /// Records the end of a run and applies the restart policy.
    async fn finish(
        &self,
        instance: ActivationInstance,
        exit: ExitKind,
        reason: Option<String>,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let policy = match self.wanted_definition(&instance.definition_id).await {
            Ok(Some(def)) => def.restart_policy,
            Ok(None) | Err(OrchestratorError::Configuration(_)) => RestartPolicy::never(),
            Err(err) => return Err(err),
        };
        let now = self.clock.now();
        let decision = policy.decide(exit, instance.restart_count);

        let (to, mut patch) = match (exit, reason) {
            (ExitKind::Completed, _) => (
                InstanceStatus::Completed,
                InstancePatch::default().clear_failure(),
            ),
            (ExitKind::Failed, reason) => (
                InstanceStatus::Failed,
                InstancePatch::default()
                    .failure(reason.unwrap_or_else(|| "failed".to_string())),
            ),
        };
        patch = patch.ended(now);
        if let RestartDecision::Restart { delay } = decision {
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            patch = patch.restart_at(now + delay);
        }

        let ended = self.transition(&instance, to, patch).await?;
        self.tailer.stop(&ended.id).await;
        self.discard_container(&ended).await;

        match decision {
            RestartDecision::Restart { delay } => {
                self.bus.publish(
                    Event::new(EventKind::RestartScheduled)
                        .with_instance(ended.id.as_str())
                        .with_definition(ended.definition_id.as_str())
                        .with_attempt(u64::from(ended.restart_count) + 1)
                        .with_delay(delay),
                );
                self.schedule_resync(&ended, delay).await?;
            }
            RestartDecision::Exhausted { restarts } => {
                warn!(instance = %ended.id, restarts, "restart policy exhausted");
                self.bus.publish(
                    Event::new(EventKind::PolicyExhausted)
                        .with_instance(ended.id.as_str())
                        .with_definition(ended.definition_id.as_str())
                        .with_attempt(u64::from(restarts)),
                );
            }
            RestartDecision::Stay => {}
        }
        Ok(converged(&ended))
    }

    /// `completed`/`failed` → `pending` with one more restart, then launch.
    async fn relaunch(
        &self,
        instance: ActivationInstance,
        def: &ActivationDefinition,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let patch = InstancePatch::default()
            .with_restart_count(instance.restart_count + 1)
            .clear_handle()
            .clear_restart_at()
            .clear_message()
            .reset_log_offset();
        let pending = self
            .transition(&instance, InstanceStatus::Pending, patch)
            .await?;
        self.launch(pending, def).await
    }

    async fn stop_all(
        &self,
        definition_id: &DefinitionId,
        reason: &str,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let mut outcome = ReconcileOutcome::Unchanged;
        for instance in self.store.list_for_definition(definition_id).await? {
            if instance.status.is_terminal() && instance.restart_at.is_none() {
                continue;
            }
            outcome = self.stop(instance, reason).await?;
        }
        Ok(outcome)
    }

    async fn stop(
        &self,
        instance: ActivationInstance,
        reason: &str,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let patch = InstancePatch::default().message(reason);
        match instance.status {
            InstanceStatus::Pending => {
                let stopped = self
                    .transition(&instance, InstanceStatus::Stopped, patch.ended(self.clock.now()))
                    .await?;
                Ok(converged(&stopped))
            }
            InstanceStatus::Starting | InstanceStatus::Running => {
                let stopping = self
                    .transition(&instance, InstanceStatus::Stopping, patch)
                    .await?;
                self.finish_stop(stopping).await
            }
            InstanceStatus::Stopping => self.finish_stop(instance).await,
            InstanceStatus::Completed | InstanceStatus::Failed
                if instance.restart_at.is_some() =>
            {
                let stopped = self
                    .transition(&instance, InstanceStatus::Stopped, patch.clear_restart_at())
                    .await?;
                Ok(converged(&stopped))
            }
            _ => Ok(ReconcileOutcome::Unchanged),
        }
    }

    /// `stopping` → container gone → `stopped`.
    async fn finish_stop(
        &self,
        instance: ActivationInstance,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        self.tailer.stop(&instance.id).await;
        if let Some(handle) = instance.container_handle.clone().map(RuntimeHandle::new) {
            match self.stop_container(&handle).await {
                Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
                Err(err @ RuntimeError::RetriesExhausted { .. }) => {
                    return Err(OrchestratorError::TransientRuntime(err));
                }
                Err(err) => {
                    let patch = InstancePatch::default()
                        .failure(format!("stop failed: {err}"))
                        .ended(self.clock.now());
                    let failed = self
                        .transition(&instance, InstanceStatus::Failed, patch)
                        .await?;
                    return Ok(converged(&failed));
                }
            }
        }
        let patch = InstancePatch::default().ended(self.clock.now());
        let stopped = self
            .transition(&instance, InstanceStatus::Stopped, patch)
            .await?;
        Ok(converged(&stopped))
    }

    /// Compare-and-swap write, instance-log note, status-change event. In that order.
    async fn transition(
        &self,
        current: &ActivationInstance,
        to: InstanceStatus,
        mut patch: InstancePatch,
    ) -> Result<ActivationInstance, OrchestratorError> {
        if !current.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                instance: current.id.to_string(),
                from: current.status,
                to,
            });
        }
        patch.status = Some(to);
        let updated = self
            .store
            .update_if_version(&current.id, current.version, patch)
            .await?;
        self.announce(current.status, &updated).await;
        Ok(updated)
    }

    async fn announce(&self, from: InstanceStatus, updated: &ActivationInstance) {
        let to = updated.status;
        let detail = match to {
            InstanceStatus::Failed => updated.last_failure_reason.clone(),
            _ => updated.status_message.clone(),
        };
        let note = match &detail {
            Some(detail) => format!("{from} -> {to}: {detail}"),
            None => format!("{from} -> {to}"),
        };
        self.sink
            .append_instance_log(&updated.id, self.clock.now(), &note)
            .await;

        let mut event = Event::new(EventKind::StatusChanged)
            .with_instance(updated.id.as_str())
            .with_definition(updated.definition_id.as_str())
            .with_transition(from, to);
        if let Some(detail) = detail {
            event = event.with_reason(detail);
        }
        self.bus.publish(event);
    }

    async fn launch_spec(
        &self,
        instance: &ActivationInstance,
        def: &ActivationDefinition,
    ) -> Result<LaunchSpec, crate::error::CredentialError> {
        let mut env = def.env.clone();
        env.extend(self.credentials.resolve_all(&def.credential_refs).await?);
        if !def.extra_vars.is_empty() {
            let vars: serde_json::Map<String, serde_json::Value> = def
                .extra_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            env.insert(
                "ACTIVATION_EXTRA_VARS".to_string(),
                serde_json::Value::Object(vars).to_string(),
            );
        }
        env.insert("ACTIVATION_INSTANCE_ID".to_string(), instance.id.to_string());
        env.insert("ACTIVATION_ID".to_string(), def.id.to_string());
        if let Some(base) = &self.cfg.heartbeat_url {
            env.insert(
                "ACTIVATION_HEARTBEAT_URL".to_string(),
                format!("{}/instances/{}/heartbeat", base.trim_end_matches('/'), instance.id),
            );
            if let Some(limit) = self.cfg.liveness_timeout() {
                let every = (limit.as_secs() / 3).max(1);
                env.insert("ACTIVATION_HEARTBEAT_INTERVAL".to_string(), every.to_string());
            }
        }

        let labels = [
            ("rulevisor.instance", instance.id.to_string()),
            ("rulevisor.definition", def.id.to_string()),
            ("rulevisor.attempt", instance.restart_count.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(LaunchSpec {
            name: instance.container_name(),
            image: def.image.clone(),
            command: vec![
                ENTRYPOINT.to_string(),
                "--rulebook".to_string(),
                def.rulebook.clone(),
                "--id".to_string(),
                instance.id.to_string(),
            ],
            env,
            working_dir: def.working_dir.clone(),
            memory: def.resources.memory.clone(),
            cpus: def.resources.cpus.clone(),
            pull_policy: def.pull_policy,
            labels,
        })
    }

    /// Status poll; a poll that keeps failing is transient for the instance.
    async fn poll_status(
        &self,
        handle: &RuntimeHandle,
    ) -> Result<ContainerStatus, OrchestratorError> {
        let runtime = &self.runtime;
        call_with_retry(
            &self.cfg.runtime_retry,
            "status",
            Some(self.cfg.status_timeout),
            move || runtime.status(handle),
        )
        .await
        .map_err(|err| match err {
            err @ RuntimeError::RetriesExhausted { .. } => OrchestratorError::TransientRuntime(err),
            other => other.into(),
        })
    }

    async fn stop_container(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let runtime = &self.runtime;
        let grace = self.cfg.stop_grace;
        call_with_retry(
            &self.cfg.runtime_retry,
            "stop",
            Some(self.cfg.stop_timeout + grace),
            move || runtime.stop(handle, grace),
        )
        .await
    }

    /// Best-effort removal of a container whose run is over.
    async fn discard_container(&self, instance: &ActivationInstance) {
        let Some(handle) = instance.container_handle.clone().map(RuntimeHandle::new) else {
            return;
        };
        match self.stop_container(&handle).await {
            Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
            Err(err) => {
                warn!(instance = %instance.id, %handle, error = %err, "container not removed");
            }
        }
    }

    async fn schedule_resync(
        &self,
        instance: &ActivationInstance,
        delay: Duration,
    ) -> Result<(), OrchestratorError> {
        let signal = ReconcileSignal::resync(instance.definition_id.clone(), instance.id.clone());
        self.broker
            .publish(&instance.queue_name, signal, PublishOptions::after(delay))
            .await?;
        Ok(())
    }

    fn start_deadline_passed(&self, instance: &ActivationInstance) -> bool {
        let Some(limit) = self.cfg.start_timeout() else {
            return false;
        };
        let since = instance.launch_claimed_at.unwrap_or(instance.updated_at);
        (self.clock.now() - since)
            .to_std()
            .is_ok_and(|age| age > limit)
    }
}

fn converged(instance: &ActivationInstance) -> ReconcileOutcome {
    ReconcileOutcome::Converged {
        instance: instance.id.clone(),
        status: instance.status,
    }
}
