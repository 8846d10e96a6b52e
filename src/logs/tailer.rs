//! # Log tail registry.
//!
//! One cancellable task per running instance follows the container output, writes it to
//! the [`LogSink`] and records the delivered offset on the instance row, so a restarted
//! tail resumes where the previous one stopped.
//!
//! ```text
//! start(instance) ──► spawn tail(handle, from = instance.log_offset)
//!                         ├─ chunk of lines ─► sink.write_lines ─► store: log_offset, heartbeat
//!                         ├─ cancelled      ─► exit quietly
//!                         └─ stream ended   ─► broker: resync(instance)
//! ```
//!
//! End of stream is the callback that tells the controller the process is gone; the
//! resulting resync reads the exit status and applies the restart policy. The monitor
//! sweep covers tails that never report.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LogSink;
use crate::broker::{Broker, PublishOptions};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{ActivationInstance, InstanceId, InstancePatch, ReconcileSignal};
use crate::runtime::{ContainerRuntime, RuntimeHandle};
use crate::store::StateStore;

const CHUNK: usize = 64;
const OFFSET_WRITE_ATTEMPTS: u32 = 3;

struct Tail {
    handle: String,
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Shared collaborators of every tail task.
#[derive(Clone)]
pub struct TailContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn StateStore>,
    pub broker: Arc<dyn Broker>,
    pub sink: Arc<dyn LogSink>,
    pub clock: Clock,
    /// Delay before the resync that follows a tail which produced nothing.
    pub idle_resync_delay: Duration,
}

/// Registry of running tail tasks, keyed by instance.
pub struct LogTailer {
    tails: RwLock<HashMap<InstanceId, Tail>>,
    ctx: TailContext,
    runtime_token: CancellationToken,
    next_generation: std::sync::atomic::AtomicU64,
}

impl LogTailer {
    pub fn new(ctx: TailContext, runtime_token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            tails: RwLock::new(HashMap::new()),
            ctx,
            runtime_token,
            next_generation: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Starts following `instance` unless its current container is already followed.
    ///
    /// A tail for an older container of the same instance is cancelled first.
    pub async fn start(self: &Arc<Self>, instance: &ActivationInstance) {
        let Some(handle) = instance.container_handle.clone() else {
            return;
        };

        let previous = {
            let mut tails = self.tails.write().await;
            match tails.get(&instance.id) {
                Some(t) if t.handle == handle && !t.join.is_finished() => return,
                _ => {}
            }
            let generation = self
                .next_generation
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let cancel = self.runtime_token.child_token();
            let join = tokio::spawn(Arc::clone(self).follow(
                instance.clone(),
                handle.clone(),
                generation,
                cancel.clone(),
            ));
            tails.insert(
                instance.id.clone(),
                Tail {
                    handle,
                    generation,
                    cancel,
                    join,
                },
            )
        };

        if let Some(old) = previous {
            old.cancel.cancel();
            let _ = old.join.await;
        }
    }

    /// Cancels the tail of `instance` and waits for it to exit.
    pub async fn stop(&self, instance: &InstanceId) {
        let tail = self.tails.write().await.remove(instance);
        if let Some(tail) = tail {
            tail.cancel.cancel();
            let _ = tail.join.await;
        }
    }

    pub async fn is_tailing(&self, instance: &InstanceId) -> bool {
        self.tails
            .read()
            .await
            .get(instance)
            .is_some_and(|t| !t.join.is_finished())
    }

    /// Number of live tails.
    pub async fn len(&self) -> usize {
        self.tails
            .read()
            .await
            .values()
            .filter(|t| !t.join.is_finished())
            .count()
    }

    /// Cancels every tail and waits for all of them.
    pub async fn shutdown(&self) {
        let tails: Vec<Tail> = self.tails.write().await.drain().map(|(_, t)| t).collect();
        for t in &tails {
            t.cancel.cancel();
        }
        for t in tails {
            let _ = t.join.await;
        }
    }

    async fn follow(
        self: Arc<Self>,
        instance: ActivationInstance,
        handle: String,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let id = instance.id.clone();
        let handle = RuntimeHandle::new(handle);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            res = self.ctx.runtime.tail_logs(&handle, instance.log_offset) => res,
        };

        let mut delivered = 0usize;
        match opened {
            Ok(stream) => {
                let mut chunks = stream.ready_chunks(CHUNK);
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = chunks.next() => next,
                    };
                    let Some(lines) = chunk else { break };
                    let Some(last) = lines.last().map(|l| l.offset) else {
                        continue;
                    };
                    delivered += lines.len();
                    self.ctx.sink.write_lines(&id, &lines).await;
                    if let Err(err) = self.record_offset(&id, last + 1).await {
                        warn!(instance = %id, error = %err, "log offset not recorded");
                    }
                }
                debug!(instance = %id, %handle, delivered, "log stream ended");
            }
            Err(err) => {
                debug!(instance = %id, %handle, error = %err, "log stream unavailable");
            }
        }

        self.forget(&id, generation).await;
        if cancel.is_cancelled() {
            return;
        }
        let options = if delivered == 0 {
            PublishOptions::after(self.ctx.idle_resync_delay)
        } else {
            PublishOptions::now()
        };
        let signal = ReconcileSignal::resync(instance.definition_id.clone(), id.clone());
        if let Err(err) = self
            .ctx
            .broker
            .publish(&instance.queue_name, signal, options)
            .await
        {
            warn!(instance = %id, error = %err, "resync after log end not published");
        }
    }

    async fn record_offset(&self, id: &InstanceId, offset: u64) -> Result<(), StoreError> {
        let mut last = None;
        for _ in 0..OFFSET_WRITE_ATTEMPTS {
            let current = self.ctx.store.get(id).await?;
            if current.log_offset >= offset {
                return Ok(());
            }
            let patch = InstancePatch::default()
                .log_offset(offset)
                .heartbeat(self.ctx.clock.now());
            match self.ctx.store.update_if_version(id, current.version, patch).await {
                Ok(_) => return Ok(()),
                Err(err @ StoreError::Conflict { .. }) => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| StoreError::backend("offset write not attempted")))
    }

    /// Drops the registry entry if it still belongs to this generation.
    async fn forget(&self, id: &InstanceId, generation: u64) {
        let mut tails = self.tails.write().await;
        if tails.get(id).is_some_and(|t| t.generation == generation) {
            tails.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::logs::RingBuffer;
    use crate::model::{ActivationDefinition, InstanceStatus};
    use crate::runtime::{Behavior, InMemoryRuntime, LaunchSpec};
    use crate::store::InMemoryStateStore;

    struct Fixture {
        tailer: Arc<LogTailer>,
        runtime: InMemoryRuntime,
        store: Arc<InMemoryStateStore>,
        broker: Arc<InMemoryBroker>,
        ring: Arc<RingBuffer>,
    }

    fn fixture(behavior: Behavior) -> Fixture {
        let clock = Clock::new();
        let runtime = InMemoryRuntime::with_default(behavior);
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new());
        let ring = Arc::new(RingBuffer::new(100));
        let ctx = TailContext {
            runtime: Arc::new(runtime.clone()),
            store: store.clone(),
            broker: broker.clone(),
            sink: ring.clone(),
            clock,
            idle_resync_delay: Duration::from_secs(1),
        };
        Fixture {
            tailer: LogTailer::new(ctx, CancellationToken::new()),
            runtime,
            store,
            broker,
            ring,
        }
    }

    async fn running_instance(f: &Fixture) -> ActivationInstance {
        let def = f
            .store
            .put_definition(ActivationDefinition::new("d1", "r.yml", "img"))
            .await
            .unwrap();
        let inst = ActivationInstance::pending(&def, "activation", "v1", None, chrono::Utc::now());
        let inst = f.store.create(inst).await.unwrap();
        let handle = f
            .runtime
            .launch(&LaunchSpec {
                name: inst.container_name(),
                image: "img".into(),
                command: vec![],
                env: Default::default(),
                working_dir: None,
                memory: None,
                cpus: None,
                pull_policy: Default::default(),
                labels: Default::default(),
            })
            .await
            .unwrap();
        f.store
            .update_if_version(
                &inst.id,
                inst.version,
                InstancePatch::status(InstanceStatus::Running).with_handle(handle.into_string()),
            )
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_records_offset_and_requests_resync() {
        let f = fixture(
            Behavior::exit_after(Duration::from_secs(2), 0).with_output(["one", "two", "three"]),
        );
        let inst = running_instance(&f).await;
        f.tailer.start(&inst).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        let lines: Vec<String> = f.ring.snapshot(&inst.id).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, ["one", "two", "three"]);
        let stored = f.store.get(&inst.id).await.unwrap();
        assert_eq!(stored.log_offset, 3);
        assert!(stored.last_heartbeat_at.is_some());
        assert_eq!(
            f.broker.drain("activation"),
            vec![ReconcileSignal::resync(inst.definition_id.clone(), inst.id.clone())]
        );
        assert!(!f.tailer.is_tailing(&inst.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_tail_resumes_from_offset() {
        let f = fixture(Behavior::run_forever().with_output(["a", "b", "c"]));
        let mut inst = running_instance(&f).await;
        inst.log_offset = 2;
        f.tailer.start(&inst).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let lines: Vec<String> = f.ring.snapshot(&inst.id).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, ["c"]);
        assert!(f.tailer.is_tailing(&inst.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_without_resync() {
        let f = fixture(Behavior::run_forever());
        let inst = running_instance(&f).await;
        f.tailer.start(&inst).await;
        f.tailer.start(&inst).await;
        assert_eq!(f.tailer.len().await, 1);

        f.tailer.stop(&inst.id).await;
        assert!(!f.tailer.is_tailing(&inst.id).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.broker.drain("activation").is_empty());
    }
}
