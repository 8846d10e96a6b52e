//! End-to-end scenarios: real controllers, monitor and subscriber pump over the in-memory
//! store, broker and runtime, driven on paused time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use rulevisor::broker::{InMemoryBroker, PublishOptions};
use rulevisor::clock::Clock;
use rulevisor::error::RuntimeError;
use rulevisor::model::{DefinitionEvent, DefinitionId};
use rulevisor::runtime::{
    Behavior, ContainerStatus, InMemoryRuntime, LaunchSpec, LogStream, RuntimeHandle,
};
use rulevisor::store::InMemoryStateStore;
use rulevisor::{
    ActivationDefinition, Broker, Config, ContainerRuntime, Event, EventKind, InstanceStatus,
    Orchestrator, OrchestratorBuilder, ReconcileSignal, RestartMode, RestartPolicy,
    ShutdownError, StatusHistory, Subscribe,
};

use InstanceStatus::{Completed, Failed, Pending, Running, Starting, Stopped};

struct Node {
    orch: Arc<Orchestrator>,
    history: Arc<StatusHistory>,
    run: JoinHandle<Result<(), ShutdownError>>,
}

/// `RUST_LOG=rulevisor=debug cargo test` shows the reconcile trace of a failing scenario.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl Node {
    fn start(builder: OrchestratorBuilder) -> Self {
        init_logging();
        let history = Arc::new(StatusHistory::new());
        let subscribers: Vec<Arc<dyn Subscribe>> = vec![history.clone()];
        let orch = builder
            .with_subscribers(subscribers)
            .with_os_signals(false)
            .build()
            .unwrap();
        let run = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.run().await }
        });
        Self { orch, history, run }
    }

    async fn stop(self) -> Result<(), ShutdownError> {
        self.orch.shutdown();
        self.run.await.unwrap()
    }
}

fn definition(id: &str, policy: RestartPolicy) -> ActivationDefinition {
    ActivationDefinition::new(id, "rulebooks/alerts.yml", "quay.io/eda/runner:1")
        .with_restart_policy(policy)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<EventKind> {
    use tokio::sync::broadcast::error::TryRecvError;
    let mut kinds = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => kinds.push(ev.kind),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return kinds,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn on_failure_relaunches_until_budget_is_spent() {
    let runtime = InMemoryRuntime::with_default(Behavior::exit_after(Duration::from_secs(10), 1));
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));

    let def = definition(
        "alerts",
        RestartPolicy {
            mode: RestartMode::OnFailure,
            delay_on_failure: Duration::from_secs(5),
            delay_on_complete: Duration::ZERO,
            max_restarts: Some(2),
        },
    );
    node.orch.put_definition(def).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let instances = node.orch.instances(&DefinitionId::new("alerts")).await.unwrap();
    assert_eq!(instances.len(), 1, "relaunches reuse the instance");
    let inst = &instances[0];
    assert_eq!(inst.status, Failed);
    assert_eq!(inst.restart_count, 2);
    assert_eq!(inst.restart_at, None);
    assert_eq!(runtime.launch_count(), 3);
    assert_eq!(
        node.history.transitions(inst.id.as_str()),
        vec![
            Starting, Running, Failed, Pending, Starting, Running, Failed, Pending, Starting,
            Running, Failed,
        ]
    );

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn monitor_catches_a_vanished_container() {
    let runtime = InMemoryRuntime::with_default(Behavior::run_forever());
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));

    let policy = RestartPolicy {
        mode: RestartMode::Always,
        delay_on_failure: Duration::from_secs(1),
        delay_on_complete: Duration::ZERO,
        max_restarts: None,
    };
    node.orch.put_definition(definition("watch", policy)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let inst = node.orch.instances(&DefinitionId::new("watch")).await.unwrap()[0].clone();
    assert_eq!(inst.status, Running);
    let handle = inst.container_handle.clone().unwrap();
    assert!(runtime.remove_externally(&handle));

    // Next monitor tick is at most one interval away.
    tokio::time::sleep(Duration::from_secs(40)).await;

    let relaunched = node.orch.instance(&inst.id).await.unwrap();
    assert_eq!(relaunched.status, Running);
    assert_eq!(relaunched.restart_count, 1);
    assert_eq!(runtime.launch_count(), 2);
    assert_eq!(
        node.history.transitions(inst.id.as_str()),
        vec![Starting, Running, Failed, Pending, Starting, Running]
    );

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_nodes_racing_on_one_definition_launch_once() {
    let clock = Clock::new();
    let store = Arc::new(InMemoryStateStore::new(clock.clone()));
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = InMemoryRuntime::new();

    let node = |id: &str| {
        let cfg = Config {
            node_id: id.to_string(),
            ..Config::default()
        };
        Node::start(
            OrchestratorBuilder::new(cfg, Arc::new(runtime.clone()))
                .with_store(Arc::clone(&store))
                .with_broker(broker.clone())
                .with_clock(clock.clone()),
        )
    };
    let a = node("node-a");
    let b = node("node-b");

    let stored = a
        .orch
        .put_definition(definition("shared", RestartPolicy::default()))
        .await
        .unwrap();
    b.orch
        .notify_definition(DefinitionEvent::Updated(stored.id.clone()))
        .await
        .unwrap();
    for _ in 0..3 {
        broker
            .publish(
                "activation",
                ReconcileSignal::create(stored.id.clone(), stored.version),
                PublishOptions::now(),
            )
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let instances = b.orch.instances(&stored.id).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, Running);
    assert_eq!(runtime.live_count(), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn running_ceiling_holds_under_a_burst() {
    let runtime = InMemoryRuntime::new();
    let cfg = Config {
        max_running: 2,
        ..Config::default()
    };
    let node = Node::start(OrchestratorBuilder::new(cfg, Arc::new(runtime.clone())));

    let ids: Vec<DefinitionId> = (0..5).map(|n| DefinitionId::new(format!("burst-{n}"))).collect();
    for id in &ids {
        let def = ActivationDefinition::new(id.clone(), "rb.yml", "quay.io/eda/runner:1");
        node.orch.put_definition(def).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let statuses = |orch: Arc<Orchestrator>, ids: Vec<DefinitionId>| async move {
        let mut all = Vec::new();
        for id in &ids {
            all.extend(orch.instances(id).await.unwrap());
        }
        all
    };
    let all = statuses(Arc::clone(&node.orch), ids.clone()).await;
    assert_eq!(all.iter().filter(|i| i.status == Running).count(), 2);
    let waiting: Vec<_> = all.iter().filter(|i| i.status == Pending).collect();
    assert_eq!(waiting.len(), 3);
    assert!(
        waiting
            .iter()
            .all(|i| i.status_message.as_deref() == Some("waiting for capacity"))
    );
    assert_eq!(runtime.live_count(), 2);

    let victim = all.iter().find(|i| i.status == Running).unwrap().id.clone();
    node.orch.request_stop(&victim).await.unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;

    let all = statuses(Arc::clone(&node.orch), ids).await;
    assert_eq!(all.iter().filter(|i| i.status == Running).count(), 2);
    assert_eq!(all.iter().filter(|i| i.status == Stopped).count(), 1);
    assert_eq!(all.iter().filter(|i| i.status == Pending).count(), 2);
    assert_eq!(runtime.live_count(), 2);

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn default_config_keeps_a_quiet_instance_running() {
    let runtime = InMemoryRuntime::with_default(Behavior::run_forever());
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));

    node.orch
        .put_definition(definition("quiet", RestartPolicy::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(900)).await;

    let inst = node.orch.instances(&DefinitionId::new("quiet")).await.unwrap()[0].clone();
    assert_eq!(inst.status, Running);
    assert_eq!(inst.restart_count, 0);
    assert_eq!(inst.last_heartbeat_at, None);
    assert_eq!(runtime.launch_count(), 1);
    assert_eq!(node.history.transitions(inst.id.as_str()), vec![Starting, Running]);

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_requested_during_slow_launch_leaves_nothing_running() {
    let runtime = InMemoryRuntime::with_default(Behavior::run_forever());
    runtime.delay_launches(Duration::from_secs(10));
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));

    node.orch
        .put_definition(definition("pull", RestartPolicy::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let inst = node.orch.instances(&DefinitionId::new("pull")).await.unwrap()[0].clone();
    assert_eq!(inst.status, Starting);
    assert_eq!(inst.container_handle, None);

    node.orch.request_stop(&inst.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let inst = node.orch.instances(&DefinitionId::new("pull")).await.unwrap()[0].clone();
    assert_eq!(inst.status, Stopped);
    assert_eq!(runtime.launch_count(), 1);
    assert_eq!(runtime.live_count(), 0);

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn never_mode_completes_once() {
    let runtime = InMemoryRuntime::with_default(Behavior::exit_after(Duration::from_secs(1), 0));
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));

    node.orch
        .put_definition(definition("oneshot", RestartPolicy::never()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;

    let inst = node.orch.instances(&DefinitionId::new("oneshot")).await.unwrap()[0].clone();
    assert_eq!(inst.status, Completed);
    assert_eq!(inst.restart_at, None);
    assert_eq!(runtime.launch_count(), 1);
    assert_eq!(
        node.history.transitions(inst.id.as_str()),
        vec![Starting, Running, Completed]
    );

    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_containers_running() -> anyhow::Result<()> {
    let runtime = InMemoryRuntime::new();
    let node = Node::start(OrchestratorBuilder::new(Config::default(), Arc::new(runtime.clone())));
    let mut events = node.orch.bus().subscribe();

    node.orch
        .put_definition(definition("alerts", RestartPolicy::default()))
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    node.stop().await?;

    let kinds = drain(&mut events);
    assert!(kinds.contains(&EventKind::ShutdownRequested));
    assert!(kinds.contains(&EventKind::AllStoppedWithin));
    assert!(!kinds.contains(&EventKind::GraceExceeded));
    assert_eq!(runtime.live_count(), 1);
    Ok(())
}

/// Launch never returns; everything else is the in-memory backend.
struct HangingLaunch(InMemoryRuntime);

#[async_trait]
impl ContainerRuntime for HangingLaunch {
    fn kind(&self) -> &'static str {
        "hanging"
    }

    async fn launch(&self, _spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        std::future::pending().await
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus, RuntimeError> {
        self.0.status(handle).await
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError> {
        self.0.stop(handle, grace).await
    }

    async fn tail_logs(
        &self,
        handle: &RuntimeHandle,
        from_offset: u64,
    ) -> Result<LogStream, RuntimeError> {
        self.0.tail_logs(handle, from_offset).await
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_reconcile_exceeds_grace() {
    let cfg = Config {
        launch_timeout: Duration::from_secs(3600),
        grace: Duration::from_secs(2),
        ..Config::default()
    };
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(HangingLaunch(InMemoryRuntime::new()));
    let node = Node::start(OrchestratorBuilder::new(cfg, runtime));
    let mut events = node.orch.bus().subscribe();

    node.orch
        .put_definition(definition("slow", RestartPolicy::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = node.stop().await.unwrap_err();
    let ShutdownError::GraceExceeded { grace, stuck } = err else {
        panic!("unexpected shutdown error");
    };
    assert_eq!(grace, Duration::from_secs(2));
    assert_eq!(stuck, vec!["controller:activation".to_string()]);
    assert!(drain(&mut events).contains(&EventKind::GraceExceeded));
}
