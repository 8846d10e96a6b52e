//! # Cluster scheduler backend.
//!
//! [`ClusterRuntime`] runs each activation attempt as a bare pod through `kubectl`. The
//! pod name is the deterministic launch name, so the handle is the name itself.
//!
//! The container definition is passed whole through `--overrides` (resources, env,
//! working directory and pull policy have no stable `kubectl run` flags).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::process::{self, mentions};
use super::{ContainerRuntime, ContainerStatus, LaunchSpec, LogStream, RuntimeHandle};
use crate::error::RuntimeError;
use crate::model::PullPolicy;

/// `kubectl` backend.
#[derive(Clone, Debug)]
pub struct ClusterRuntime {
    program: String,
    namespace: String,
    context: Option<String>,
}

const NO_SUCH: &[&str] = &["notfound", "not found"];

impl ClusterRuntime {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            program: "kubectl".to_string(),
            namespace: namespace.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec!["--namespace".to_string(), self.namespace.clone()];
        if let Some(ctx) = &self.context {
            args.push("--context".into());
            args.push(ctx.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    /// Pod override carrying the full container definition.
    pub(crate) fn overrides(spec: &LaunchSpec) -> Value {
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let mut limits = serde_json::Map::new();
        if let Some(mem) = spec.memory.as_deref().and_then(pod_memory) {
            limits.insert("memory".into(), Value::String(mem));
        }
        if let Some(cpus) = &spec.cpus {
            limits.insert("cpu".into(), Value::String(cpus.clone()));
        }

        let mut container = json!({
            "name": "activation",
            "image": spec.image,
            "imagePullPolicy": pull_policy(spec.pull_policy),
            "env": env,
            "resources": { "limits": limits },
        });
        if let Some((cmd, args)) = spec.command.split_first() {
            container["command"] = json!([cmd]);
            container["args"] = json!(args);
        }
        if let Some(dir) = &spec.working_dir {
            container["workingDir"] = json!(dir);
        }

        json!({
            "apiVersion": "v1",
            "metadata": { "labels": spec.labels },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
            },
        })
    }

    pub(crate) fn run_args(spec: &LaunchSpec) -> Vec<String> {
        vec![
            "run".into(),
            spec.name.clone(),
            "--image".into(),
            spec.image.clone(),
            "--restart=Never".into(),
            "--overrides".into(),
            Self::overrides(spec).to_string(),
        ]
    }
}

fn pull_policy(policy: PullPolicy) -> &'static str {
    match policy {
        PullPolicy::Always => "Always",
        PullPolicy::Missing => "IfNotPresent",
        PullPolicy::Never => "Never",
    }
}

/// Engine-style size (`200m`) to a pod quantity (`200Mi`).
pub(crate) fn pod_memory(value: &str) -> Option<String> {
    let (digits, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], Some(c.to_ascii_lowercase())),
        _ => (value, None),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let suffix = match unit {
        None | Some('b') => "",
        Some('k') => "Ki",
        Some('m') => "Mi",
        Some('g') => "Gi",
        Some(_) => return None,
    };
    Some(format!("{digits}{suffix}"))
}

/// Maps `kubectl get pod -o json` to a container status.
///
/// Image pull back-offs surface as a permanent error: the pod would wait forever.
pub(crate) fn parse_pod(pod: &Value) -> Result<ContainerStatus, RuntimeError> {
    let state = &pod["status"]["containerStatuses"][0]["state"];
    if state["running"].is_object() {
        return Ok(ContainerStatus::Running);
    }
    if let Some(code) = state["terminated"]["exitCode"].as_i64() {
        return Ok(ContainerStatus::Exited { code: code as i32 });
    }
    if let Some(reason) = state["waiting"]["reason"].as_str() {
        if matches!(reason, "ErrImagePull" | "ImagePullBackOff" | "InvalidImageName") {
            let image = pod["spec"]["containers"][0]["image"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let error = state["waiting"]["message"]
                .as_str()
                .unwrap_or(reason)
                .to_string();
            return Err(RuntimeError::ImagePull { image, error });
        }
        return Ok(ContainerStatus::Starting);
    }
    Ok(match pod["status"]["phase"].as_str() {
        Some("Running") => ContainerStatus::Running,
        Some("Succeeded") => ContainerStatus::Exited { code: 0 },
        Some("Failed") => ContainerStatus::Exited { code: 1 },
        Some("Unknown") => ContainerStatus::Missing,
        _ => ContainerStatus::Starting,
    })
}

#[async_trait]
impl ContainerRuntime for ClusterRuntime {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        let out = process::run(&self.program, &self.args(Self::run_args(spec)), "launch").await?;
        if out.success {
            return Ok(RuntimeHandle::new(spec.name.clone()));
        }
        if mentions(&out.stderr, &["alreadyexists", "already exists"]) {
            return Err(RuntimeError::AlreadyExists {
                name: spec.name.clone(),
                handle: spec.name.clone(),
            });
        }
        if mentions(&out.stderr, &["forbidden", "unauthorized"]) {
            return Err(if mentions(&out.stderr, &["quota"]) {
                RuntimeError::Quota { error: out.stderr }
            } else {
                RuntimeError::Auth { error: out.stderr }
            });
        }
        if mentions(&out.stderr, &["invalid", "unknown flag"]) {
            return Err(RuntimeError::InvalidSpec { error: out.stderr });
        }
        Err(RuntimeError::Transient {
            op: "launch",
            error: out.stderr,
        })
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus, RuntimeError> {
        let out = process::run(
            &self.program,
            &self.args(["get", "pod", handle.as_str(), "-o", "json"]),
            "status",
        )
        .await?;
        if !out.success {
            if mentions(&out.stderr, NO_SUCH) {
                return Ok(ContainerStatus::Missing);
            }
            return Err(RuntimeError::Transient {
                op: "status",
                error: out.stderr,
            });
        }
        let pod: Value = serde_json::from_str(&out.stdout).map_err(|e| RuntimeError::Transient {
            op: "status",
            error: format!("unreadable pod json: {e}"),
        })?;
        parse_pod(&pod)
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<(), RuntimeError> {
        let grace = format!("--grace-period={}", grace.as_secs());
        let out = process::run(
            &self.program,
            &self.args(["delete", "pod", handle.as_str(), grace.as_str(), "--wait=true"]),
            "stop",
        )
        .await?;
        if out.success {
            Ok(())
        } else if mentions(&out.stderr, NO_SUCH) {
            Err(RuntimeError::NotFound {
                handle: handle.to_string(),
            })
        } else {
            Err(RuntimeError::Transient {
                op: "stop",
                error: out.stderr,
            })
        }
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
    use std::collections::BTreeMap;

    #[test]
    fn pod_memory_converts_units() {
        assert_eq!(pod_memory("200m").as_deref(), Some("200Mi"));
        assert_eq!(pod_memory("2G").as_deref(), Some("2Gi"));
        assert_eq!(pod_memory("1024").as_deref(), Some("1024"));
        assert_eq!(pod_memory("m"), None);
        assert_eq!(pod_memory("12x"), None);
    }

    #[test]
    fn overrides_carry_container_definition() {
        let spec = LaunchSpec {
            name: "activation-abc-1".into(),
            image: "runner:2".into(),
            command: vec!["ansible-rulebook".into(), "--worker".into()],
            env: BTreeMap::from([("K".into(), "v".into())]),
            working_dir: Some("/w".into()),
            memory: Some("200m".into()),
            cpus: Some("0.5".into()),
            pull_policy: PullPolicy::Missing,
            labels: BTreeMap::from([("app".into(), "rulevisor".into())]),
        };
        let o = ClusterRuntime::overrides(&spec);
        let c = &o["spec"]["containers"][0];
        assert_eq!(c["image"], "runner:2");
        assert_eq!(c["imagePullPolicy"], "IfNotPresent");
        assert_eq!(c["command"], json!(["ansible-rulebook"]));
        assert_eq!(c["args"], json!(["--worker"]));
        assert_eq!(c["resources"]["limits"]["memory"], "200Mi");
        assert_eq!(c["resources"]["limits"]["cpu"], "0.5");
        assert_eq!(c["env"][0]["name"], "K");
        assert_eq!(o["metadata"]["labels"]["app"], "rulevisor");
        assert_eq!(o["spec"]["restartPolicy"], "Never");
    }

    #[test]
    fn parse_pod_reads_container_state() {
        let running = json!({"status": {"containerStatuses": [{"state": {"running": {}}}]}});
        assert_eq!(parse_pod(&running).unwrap(), ContainerStatus::Running);

        let exited = json!({"status": {"containerStatuses": [{"state": {"terminated": {"exitCode": 2}}}]}});
        assert_eq!(
            parse_pod(&exited).unwrap(),
            ContainerStatus::Exited { code: 2 }
        );

        let pending = json!({"status": {"phase": "Pending"}});
        assert_eq!(parse_pod(&pending).unwrap(), ContainerStatus::Starting);

        let creating = json!({"status": {"containerStatuses": [{"state": {"waiting": {"reason": "ContainerCreating"}}}]}});
        assert_eq!(parse_pod(&creating).unwrap(), ContainerStatus::Starting);
    }

    #[test]
    fn parse_pod_flags_image_pull_backoff() {
        let pod = json!({
            "spec": {"containers": [{"image": "nope:1"}]},
            "status": {"containerStatuses": [{"state": {"waiting": {"reason": "ImagePullBackOff", "message": "back-off pulling"}}}]}
        });
        match parse_pod(&pod) {
            Err(RuntimeError::ImagePull { image, error }) => {
                assert_eq!(image, "nope:1");
                assert_eq!(error, "back-off pulling");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn args_prefix_namespace_and_context() {
        let rt = ClusterRuntime::new("eda").with_context("prod");
        assert_eq!(
            rt.args(["get", "pods"]),
            ["--namespace", "eda", "--context", "prod", "get", "pods"]
        );
    }
}
