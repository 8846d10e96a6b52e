use std::sync::Arc;

use clap::ValueEnum;

use super::{ClusterRuntime, ContainerRuntime, EngineFlavor, EngineRuntime, InMemoryRuntime};

/// Backend selected for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    /// In-process simulation.
    Memory,
    Podman,
    Docker,
    Kubernetes,
}

/// Backend selection plus connection details.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub kind: RuntimeKind,
    /// Remote engine socket (`podman --url`, `docker -H`).
    pub endpoint: Option<String>,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Kubernetes context.
    pub context: Option<String>,
    /// Overrides the CLI binary.
    pub program: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Podman,
            endpoint: None,
            namespace: "default".to_string(),
            context: None,
            program: None,
        }
    }
}

/// Builds the backend described by `settings`.
pub fn build_runtime(settings: &RuntimeSettings) -> Arc<dyn ContainerRuntime> {
    match settings.kind {
        RuntimeKind::Memory => Arc::new(InMemoryRuntime::new()),
        RuntimeKind::Podman | RuntimeKind::Docker => {
            let flavor = if settings.kind == RuntimeKind::Podman {
                EngineFlavor::Podman
            } else {
                EngineFlavor::Docker
            };
            let mut rt = match &settings.endpoint {
                Some(ep) => EngineRuntime::remote(flavor, ep.clone()),
                None => EngineRuntime::new(flavor),
            };
            if let Some(program) = &settings.program {
                rt = rt.with_program(program.clone());
            }
            Arc::new(rt)
        }
        RuntimeKind::Kubernetes => {
            let mut rt = ClusterRuntime::new(settings.namespace.clone());
            if let Some(ctx) = &settings.context {
                rt = rt.with_context(ctx.clone());
            }
            if let Some(program) = &settings.program {
                rt = rt.with_program(program.clone());
            }
            Arc::new(rt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_requested_backend() {
        for (kind, name) in [
            (RuntimeKind::Memory, "memory"),
            (RuntimeKind::Podman, "podman"),
            (RuntimeKind::Docker, "docker"),
            (RuntimeKind::Kubernetes, "kubernetes"),
        ] {
            let rt = build_runtime(&RuntimeSettings {
                kind,
                ..RuntimeSettings::default()
            });
            assert_eq!(rt.kind(), name);
        }
    }
}
