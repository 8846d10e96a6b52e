//! # Single-host container engine backend.
//!
//! [`EngineRuntime`] drives the `podman` or `docker` CLI. With an endpoint it talks to
//! a remote daemon socket (`podman --url …`, `docker -H …`); without one it uses the
//! local engine.
//!
//! Mapping:
//! - launch: `run --detach --name <name> …`; a name clash is resolved with `inspect`
//! - status: `inspect --format '{{.State.Status}} {{.State.ExitCode}}'`
//! - stop:   `stop --time <grace>` followed by `rm --force`
//! - logs:   `logs --follow`

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::process::{self, CliOutput, mentions};
use super::{ContainerRuntime, ContainerStatus, LaunchSpec, LogStream, RuntimeHandle};
use crate::error::RuntimeError;

/// Which CLI dialect to speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineFlavor {
    Podman,
    Docker,
}

impl EngineFlavor {
    fn program(&self) -> &'static str {
        match self {
            EngineFlavor::Podman => "podman",
            EngineFlavor::Docker => "docker",
        }
    }

    fn endpoint_flag(&self) -> &'static str {
        match self {
            EngineFlavor::Podman => "--url",
            EngineFlavor::Docker => "-H",
        }
    }
}

/// `podman`/`docker` CLI backend.
#[derive(Clone, Debug)]
pub struct EngineRuntime {
    flavor: EngineFlavor,
    program: String,
    endpoint: Option<String>,
}

const NO_SUCH: &[&str] = &["no such container", "no such object", "not found"];

impl EngineRuntime {
    /// Local engine.
    pub fn new(flavor: EngineFlavor) -> Self {
        Self {
            flavor,
            program: flavor.program().to_string(),
            endpoint: None,
        }
    }

    /// Remote engine reachable at `endpoint` (e.g. `unix:///run/podman/podman.sock`,
    /// `tcp://10.0.0.5:2375`).
    pub fn remote(flavor: EngineFlavor, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::new(flavor)
        }
    }

    /// Overrides the CLI binary path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = Vec::new();
        if let Some(ep) = &self.endpoint {
            args.push(self.flavor.endpoint_flag().to_string());
            args.push(ep.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    /// Arguments for `run`, without the endpoint prefix.
    pub(crate) fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--pull".into(),
            spec.pull_policy.as_str().into(),
        ];
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(dir) = &spec.working_dir {
            args.push("--workdir".into());
            args.push(dir.clone());
        }
        if let Some(mem) = &spec.memory {
            args.push("--memory".into());
            args.push(mem.clone());
        }
        if let Some(cpus) = &spec.cpus {
            args.push("--cpus".into());
            args.push(cpus.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn cli(&self, op: &'static str, rest: Vec<String>) -> Result<CliOutput, RuntimeError> {
        process::run(&self.program, &self.args(rest), op).await
    }

    async fn resolve_existing(&self, name: &str) -> Result<String, RuntimeError> {
        let out = self
            .cli(
                "launch",
                vec!["inspect".into(), "--format".into(), "{{.Id}}".into(), name.into()],
            )
            .await?;
        if out.success && !out.stdout.is_empty() {
            Ok(out.stdout)
        } else {
            Err(classify("launch", "", &out.stderr))
        }
    }
}

/// Maps a failed CLI call to the runtime error taxonomy.
pub(crate) fn classify(op: &'static str, image: &str, stderr: &str) -> RuntimeError {
    let error = stderr.to_string();
    if mentions(stderr, &["unauthorized", "authentication required", "access denied"]) {
        RuntimeError::Auth { error }
    } else if mentions(
        stderr,
        &["manifest unknown", "pull access denied", "image not known", "error pulling", "unable to pull"],
    ) {
        RuntimeError::ImagePull {
            image: image.to_string(),
            error,
        }
    } else if mentions(stderr, &["quota", "no space left", "cannot allocate memory"]) {
        RuntimeError::Quota { error }
    } else if mentions(stderr, &["invalid reference format", "invalid argument", "unknown flag", "invalid value"]) {
        RuntimeError::InvalidSpec { error }
    } else {
        RuntimeError::Transient { op, error }
    }
}

/// Parses `"<status> <exit code>"` from `inspect`.
pub(crate) fn parse_state(raw: &str) -> Option<ContainerStatus> {
    let mut parts = raw.split_whitespace();
    let state = parts.next()?;
    let code = parts.next().and_then(|c| c.parse::<i32>().ok()).unwrap_or(0);
    Some(match state {
        "created" | "configured" | "initialized" | "restarting" => ContainerStatus::Starting,
        "running" | "paused" => ContainerStatus::Running,
        "exited" | "stopped" | "dead" => ContainerStatus::Exited { code },
        "removing" => ContainerStatus::Missing,
        _ => return None,
    })
}

#[async_trait]
impl ContainerRuntime for EngineRuntime {
    fn kind(&self) -> &'static str {
        self.flavor.program()
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        let out = self.cli("launch", Self::run_args(spec)).await?;
        if out.success {
            let id = out.stdout.lines().last().unwrap_or_default().trim().to_string();
            debug!(name = %spec.name, handle = %id, "container started");
            return Ok(RuntimeHandle::new(id));
        }
        if mentions(&out.stderr, &["already in use", "already exists"]) {
            let handle = self.resolve_existing(&spec.name).await?;
            return Err(RuntimeError::AlreadyExists {
                name: spec.name.clone(),
                handle,
            });
        }
        Err(classify("launch", &spec.image, &out.stderr))
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus, RuntimeError> {
        let out = self
            .cli(
                "status",
                vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Status}} {{.State.ExitCode}}".into(),
                    handle.to_string(),
                ],
            )
            .await?;
        if !out.success {
            if mentions(&out.stderr, NO_SUCH) {
                return Ok(ContainerStatus::Missing);
            }
            return Err(classify("status", "", &out.stderr));
        }
        parse_state(&out.stdout).ok_or_else(|| RuntimeError::Transient {
            op: "status",
            error: format!("unrecognized state '{}'", out.stdout),
        })
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError> {
        let out = self
            .cli(
                "stop",
                vec![
                    "stop".into(),
                    "--time".into(),
                    grace.as_secs().to_string(),
                    handle.to_string(),
                ],
            )
            .await?;
        if !out.success {
            if mentions(&out.stderr, NO_SUCH) {
                return Err(RuntimeError::NotFound {
                    handle: handle.to_string(),
                });
            }
            return Err(classify("stop", "", &out.stderr));
        }

        let rm = self
            .cli("stop", vec!["rm".into(), "--force".into(), handle.to_string()])
            .await?;
        if !rm.success && !mentions(&rm.stderr, NO_SUCH) {
            warn!(%handle, stderr = %rm.stderr, "container stopped but not removed");
        }
        Ok(())
    }

    async fn tail_logs(
        &self,
        handle: &RuntimeHandle,
        from_offset: u64,
    ) -> Result<LogStream, RuntimeError> {
        let args = self.args(["logs", "--follow", handle.as_str()]);
        process::follow_lines(&self.program, &args, from_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PullPolicy;
    use std::collections::BTreeMap;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "activation-01h-0".into(),
            image: "quay.io/eda/runner:1".into(),
            command: vec!["ansible-rulebook".into(), "--worker".into()],
            env: BTreeMap::from([("A".into(), "1".into())]),
            working_dir: Some("/work".into()),
            memory: Some("200m".into()),
            cpus: None,
            pull_policy: PullPolicy::Missing,
            labels: BTreeMap::from([("rulevisor.instance".into(), "01h".into())]),
        }
    }

    #[test]
    fn run_args_put_image_before_command() {
        let args = EngineRuntime::run_args(&spec());
        let image_at = args.iter().position(|a| a == "quay.io/eda/runner:1").unwrap();
        assert_eq!(&args[image_at + 1..], ["ansible-rulebook", "--worker"]);
        assert!(args.windows(2).any(|w| w == ["--pull", "missing"]));
        assert!(args.windows(2).any(|w| w == ["--env", "A=1"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "200m"]));
        assert!(!args.contains(&"--cpus".to_string()));
    }

    #[test]
    fn remote_prefixes_endpoint_flag() {
        let podman = EngineRuntime::remote(EngineFlavor::Podman, "unix:///run/podman.sock");
        assert_eq!(podman.args(["ps"])[..2], ["--url", "unix:///run/podman.sock"]);
        let docker = EngineRuntime::remote(EngineFlavor::Docker, "tcp://h:2375");
        assert_eq!(docker.args(["ps"])[..2], ["-H", "tcp://h:2375"]);
        assert_eq!(EngineRuntime::new(EngineFlavor::Docker).args(["ps"]), ["ps"]);
    }

    #[test]
    fn parse_state_maps_engine_states() {
        assert_eq!(parse_state("running 0"), Some(ContainerStatus::Running));
        assert_eq!(parse_state("created 0"), Some(ContainerStatus::Starting));
        assert_eq!(
            parse_state("exited 137"),
            Some(ContainerStatus::Exited { code: 137 })
        );
        assert_eq!(parse_state("weird"), None);
    }

    #[test]
    fn classify_separates_permanent_from_transient() {
        assert!(matches!(
            classify("launch", "img", "Error: initializing source: manifest unknown"),
            RuntimeError::ImagePull { .. }
        ));
        assert!(matches!(
            classify("launch", "img", "unauthorized: authentication required"),
            RuntimeError::Auth { .. }
        ));
        assert!(matches!(
            classify("launch", "img", "invalid reference format"),
            RuntimeError::InvalidSpec { .. }
        ));
        assert!(classify("status", "", "Cannot connect to the Podman socket").is_transient());
    }
}
