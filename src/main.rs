//! `rulevisor` node: orchestrator plus the operational HTTP surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rulevisor::runtime::{RuntimeKind, RuntimeSettings, build_runtime};
use rulevisor::{ActivationDefinition, Config, LogWriter, OrchestratorBuilder, Subscribe};

/// Reconciles rulebook activations against a container runtime.
#[derive(Debug, Parser)]
#[command(name = "rulevisor", version, about)]
struct Cli {
    /// Address of the operational HTTP surface.
    #[arg(long, env = "RULEVISOR_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Container backend.
    #[arg(long, value_enum, env = "RULEVISOR_RUNTIME", default_value = "podman")]
    runtime: RuntimeKind,

    /// Remote engine socket (`podman --url`, `docker -H`).
    #[arg(long, env = "RULEVISOR_RUNTIME_ENDPOINT")]
    endpoint: Option<String>,

    /// Kubernetes namespace for the `kubernetes` backend.
    #[arg(long, env = "RULEVISOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Kubernetes context for the `kubernetes` backend.
    #[arg(long, env = "RULEVISOR_KUBE_CONTEXT")]
    context: Option<String>,

    /// Overrides the runtime CLI binary.
    #[arg(long, env = "RULEVISOR_RUNTIME_PROGRAM")]
    program: Option<String>,

    /// Node id; also the monitor lease holder name.
    #[arg(long)]
    node_id: Option<String>,

    /// Worker queue to consume (repeatable). Overrides `RULEVISOR_QUEUES`.
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// Base URL containers use to reach this node's heartbeat route.
    /// Overrides `RULEVISOR_HEARTBEAT_URL`.
    #[arg(long)]
    heartbeat_url: Option<String>,

    /// JSON array of definitions to load at startup.
    #[arg(long)]
    definitions: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut cfg = Config::from_env().context("reading RULEVISOR_* configuration")?;
        if let Some(node) = &self.node_id {
            cfg.node_id = node.clone();
        }
        if let Some(url) = &self.heartbeat_url {
            cfg.heartbeat_url = Some(url.clone());
        }
        if !self.queues.is_empty() {
            cfg.queues = self.queues.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            kind: self.runtime,
            endpoint: self.endpoint.clone(),
            namespace: self.namespace.clone(),
            context: self.context.clone(),
            program: self.program.clone(),
        }
    }
}

fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rulevisor=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn load_definitions(path: &PathBuf) -> Result<Vec<ActivationDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading definitions from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let cfg = cli.config()?;
    let runtime = build_runtime(&cli.runtime_settings());
    info!(node = %cfg.node_id, runtime = runtime.kind(), queues = ?cfg.queues, "starting node");

    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter)];
    let orchestrator = OrchestratorBuilder::new(cfg, runtime)
        .with_subscribers(subscribers)
        .build()?;

    if let Some(path) = &cli.definitions {
        for def in load_definitions(path)? {
            let stored = orchestrator.put_definition(def).await?;
            info!(definition = %stored.id, version = stored.version, "definition loaded");
        }
    }

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(addr = %cli.listen, "operational surface listening");
    let app = rulevisor::api::router(Arc::clone(&orchestrator));
    let server = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { orchestrator.wait_shutdown().await })
                .await
        }
    });

    let outcome = orchestrator.run().await;
    server.await.context("http server task")??;
    outcome?;
    Ok(())
}
