//! # Activation definitions.
//!
//! Owned by the definition API; the orchestrator only reads them. The one field the
//! orchestrator writes is the queue assignment, and only when it is unset
//! (see [`StateStore::assign_queue`](crate::store::StateStore::assign_queue)).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DefinitionId;
use crate::error::ValidationError;
use crate::policies::RestartPolicy;

/// Image pull behavior passed to the runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    #[default]
    Always,
    Missing,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "always",
            PullPolicy::Missing => "missing",
            PullPolicy::Never => "never",
        }
    }
}

/// Resource limits for the activation container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit with an optional `b|k|m|g` suffix, e.g. `"200m"`.
    pub memory: Option<String>,
    /// CPU limit as a decimal, e.g. `"0.5"`.
    pub cpus: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: Some("200m".to_string()),
            cpus: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// How an activation should be launched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationDefinition {
    pub id: DefinitionId,
    pub name: String,
    /// Rulebook reference handed to the rule engine inside the container.
    pub rulebook: String,
    /// Execution image.
    pub image: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Extra variables, injected as JSON.
    #[serde(default)]
    pub extra_vars: BTreeMap<String, serde_json::Value>,
    /// Plain environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// References resolved by the credential resolver at launch.
    #[serde(default)]
    pub credential_refs: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Worker queue; assigned by placement when absent.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Bumped by the definition API on every update, including enable/disable.
    #[serde(default)]
    pub version: u64,
    /// Source revision of the rulebook project, if known.
    #[serde(default)]
    pub git_hash: Option<String>,
    /// Higher survives longer when the running ceiling is enforced.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl ActivationDefinition {
    /// Minimal enabled definition with defaults for everything else.
    pub fn new(
        id: impl Into<DefinitionId>,
        rulebook: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            rulebook: rulebook.into(),
            image: image.into(),
            working_dir: None,
            extra_vars: BTreeMap::new(),
            env: BTreeMap::new(),
            credential_refs: Vec::new(),
            restart_policy: RestartPolicy::default(),
            enabled: true,
            queue_name: None,
            version: 1,
            git_hash: None,
            priority: 0,
            resources: ResourceLimits::default(),
            pull_policy: PullPolicy::default(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_credentials(mut self, refs: Vec<String>) -> Self {
        self.credential_refs = refs;
        self
    }

    /// Version fingerprint recorded on every instance launched from this definition.
    pub fn fingerprint(&self) -> String {
        match &self.git_hash {
            Some(hash) => format!("{hash}@v{}", self.version),
            None => format!("v{}", self.version),
        }
    }

    /// Checks the definition can be turned into a launch spec.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |field: &'static str, reason: String| ValidationError {
            definition: self.id.to_string(),
            field,
            reason,
        };

        if self.id.as_str().trim().is_empty() {
            return Err(fail("id", "must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(fail("name", "must not be empty".into()));
        }
        if self.rulebook.trim().is_empty() {
            return Err(fail("rulebook", "must not be empty".into()));
        }
        if self.image.trim().is_empty() || self.image.chars().any(char::is_whitespace) {
            return Err(fail(
                "image",
                format!("'{}' is not an image reference", self.image),
            ));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.starts_with('/') {
                return Err(fail("working_dir", format!("'{dir}' must be absolute")));
            }
        }
        if let Some(key) = self.env.keys().find(|k| !is_env_key(k)) {
            return Err(fail("env", format!("'{key}' is not a valid variable name")));
        }
        if self.credential_refs.iter().any(|r| r.trim().is_empty()) {
            return Err(fail("credential_refs", "empty reference".into()));
        }
        if let Some(queue) = &self.queue_name {
            if queue.trim().is_empty() {
                return Err(fail("queue_name", "must not be empty when set".into()));
            }
        }
        if let Some(memory) = &self.resources.memory {
            if !is_memory_quantity(memory) {
                return Err(fail("resources.memory", format!("'{memory}' is not a size")));
            }
        }
        if let Some(cpus) = &self.resources.cpus {
            if !cpus.parse::<f64>().is_ok_and(|c| c.is_finite() && c > 0.0) {
                return Err(fail("resources.cpus", format!("'{cpus}' is not a cpu count")));
            }
        }
        self.restart_policy
            .check()
            .map_err(|reason| fail("restart_policy", reason))
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_memory_quantity(value: &str) -> bool {
    let digits = value.trim_end_matches(|c: char| "bkmgBKMG".contains(c));
    let suffix_len = value.len() - digits.len();
    suffix_len <= 1 && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
