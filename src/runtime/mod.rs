//! # Container runtime adapters.
//!
//! [`ContainerRuntime`] is the capability contract every backend satisfies. It knows
//! nothing about activations: it launches named containers from a [`LaunchSpec`],
//! polls them, stops them and streams their output.
//!
//! ## Backends
//! - [`InMemoryRuntime`]: scriptable simulation for tests and dry runs.
//! - [`EngineRuntime`]: `podman`/`docker` CLI, local or against a remote socket.
//! - [`ClusterRuntime`]: `kubectl`, one pod per activation attempt.
//!
//! ## Idempotent launch
//! Launch specs carry a deterministic name derived from the instance id and attempt. A
//! relaunch with the same name never creates a duplicate: the backend reports
//! [`RuntimeError::AlreadyExists`] carrying the existing handle, and the caller adopts it.
//!
//! ## Errors
//! Transient errors (timeouts, refused connections) are retried by the caller through
//! [`call_with_retry`]; permanent errors surface immediately.

mod cluster;
mod engine;
mod factory;
mod memory;
mod process;
mod retry;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::model::PullPolicy;

pub use cluster::ClusterRuntime;
pub use engine::{EngineFlavor, EngineRuntime};
pub use factory::{RuntimeKind, RuntimeSettings, build_runtime};
pub use memory::{Behavior, InMemoryRuntime};
pub use retry::call_with_retry;

/// Opaque, backend-specific container id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the backend says about a container right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created or pulling, not yet running.
    Starting,
    Running,
    Exited { code: i32 },
    /// The backend has no such container.
    Missing,
}

/// Everything a backend needs to start one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Deterministic name; the idempotency key of `launch`.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    /// Memory limit with `b|k|m|g` suffix.
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub pull_policy: PullPolicy,
    pub labels: BTreeMap<String, String>,
}

/// One line of container output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Position in the container's output, starting at 0.
    pub offset: u64,
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Lazy container output; ends when the process ends.
pub type LogStream = BoxStream<'static, LogLine>;

/// Capability contract of a container backend.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Backend name for logs.
    fn kind(&self) -> &'static str;

    /// Creates and starts a container.
    ///
    /// Fails with [`RuntimeError::AlreadyExists`] when `spec.name` is taken.
    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError>;

    /// Non-blocking poll. A vanished container is `Ok(Missing)`, not an error.
    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus, RuntimeError>;

    /// Terminates, waits up to `grace`, then force-kills and removes the container.
    ///
    /// Fails with [`RuntimeError::NotFound`] when the container is already gone.
    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Streams output starting at line `from_offset`.
    async fn tail_logs(
        &self,
        handle: &RuntimeHandle,
        from_offset: u64,
    ) -> Result<LogStream, RuntimeError>;
}
