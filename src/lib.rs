//! # rulevisor
//!
//! **Rulevisor** keeps long-running rulebook activations alive. Each activation is a
//! containerized rule engine described by an [`ActivationDefinition`]; the orchestrator
//! reconciles the definitions against a container runtime, restarts what dies according
//! to a [`RestartPolicy`], and keeps a durable per-instance state machine.
//!
//! ## Architecture
//! ```text
//!   definition API / operational surface
//!                │ create | delete | restart | resync
//!                ▼
//!   ┌──────────────────────────┐  publish(queue)  ┌───────────────────────────────┐
//!   │ Orchestrator             │ ───────────────► │ Broker (at-least-once queues, │
//!   │  - Controller per queue  │ ◄─────────────── │  control broadcast channel)   │
//!   │  - Monitor               │    subscribe     └───────────────────────────────┘
//!   │  - Bus ─► SubscriberSet  │
//!   └────────────┬─────────────┘
//!                │ Lifecycle::reconcile(signal)
//!                ▼
//!   ┌──────────────────────────┐   CAS writes   ┌──────────────────────────────────┐
//!   │ Lifecycle (state machine)│ ─────────────► │ StateStore (+ LeaseStore)        │
//!   │                          │ ─────────────► │ ContainerRuntime (podman, docker,│
//!   │                          │ launch/status/ │  kubectl, in-memory)             │
//!   └────────────┬─────────────┘ stop/tail_logs └──────────────────────────────────┘
//!                │ StatusChanged, RestartScheduled, PolicyExhausted, …
//!                ▼
//!               Bus ──► LogWriter, StatusHistory, custom subscribers
//! ```
//!
//! ### Instance lifecycle
//! ```text
//! pending ─► starting ─► running ─► completed | failed ─(policy, after delay)─► pending
//!    │           │           │
//!    └───────────┴───────────┴─► stopping ─► stopped
//! ```
//!
//! ## Guarantees
//! - Every instance write is a compare-and-swap; a lost race re-reads and decides again.
//! - Every signal handler is idempotent: duplicates and redeliveries converge on the same
//!   rows and containers.
//! - Relaunch delays are deferred re-enqueues, never sleeps in a worker.
//! - The monitor re-drives every live instance periodically, so a lost notification is
//!   corrected within one interval.
//!
//! ## Features
//! | Area | Description | Key types |
//! |---|---|---|
//! | **Orchestration** | controllers, monitor, shutdown | [`Orchestrator`], [`OrchestratorBuilder`] |
//! | **Policies** | restart decisions, transient-retry backoff | [`RestartPolicy`], [`BackoffPolicy`], [`RetryPolicy`] |
//! | **Backends** | runtime, broker, store seams | [`ContainerRuntime`], [`Broker`], [`StateStore`] |
//! | **Events** | status-change notifications | [`Event`], [`EventKind`], [`Subscribe`] |
//! | **Errors** | typed errors per layer | [`OrchestratorError`], [`RuntimeError`], [`StoreError`] |
//! | **Configuration** | flat node settings | [`Config`] |
//!
//! ## Optional features
//! - `api` (default): axum router for the operational surface, and the `rulevisor` binary.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use rulevisor::{ActivationDefinition, Config, OrchestratorBuilder};
//! use rulevisor::runtime::{Behavior, InMemoryRuntime};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Arc::new(InMemoryRuntime::with_default(Behavior::run_forever()));
//!     let orchestrator = OrchestratorBuilder::new(Config::default(), runtime)
//!         .with_os_signals(false)
//!         .build()?;
//!
//!     let alerts =
//!         ActivationDefinition::new("alerts", "rulebooks/alerts.yml", "quay.io/eda/runner:1");
//!     orchestrator.put_definition(alerts).await?;
//!
//!     let run = tokio::spawn({
//!         let orchestrator = Arc::clone(&orchestrator);
//!         async move { orchestrator.run().await }
//!     });
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     orchestrator.shutdown();
//!     run.await??;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod controller;
mod core;
pub mod credentials;
pub mod error;
pub mod events;
pub mod logs;
pub mod model;
pub mod monitor;
pub mod placement;
pub mod policies;
pub mod runtime;
pub mod store;
pub mod subscribers;

#[cfg(feature = "api")]
pub mod api;

// ---- Public re-exports ----

pub use crate::core::{Health, Orchestrator, OrchestratorBuilder, QueueHealth};
pub use broker::Broker;
pub use config::Config;
pub use error::{
    BrokerError, ConfigError, CredentialError, OrchestratorError, RuntimeError, ShutdownError,
    StoreError, ValidationError,
};
pub use events::{Event, EventKind};
pub use model::{ActivationDefinition, ActivationInstance, InstanceStatus, ReconcileSignal};
pub use policies::{BackoffPolicy, JitterPolicy, RestartMode, RestartPolicy, RetryPolicy};
pub use runtime::ContainerRuntime;
pub use store::StateStore;
pub use subscribers::{LogWriter, StatusHistory, Subscribe};
