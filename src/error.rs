//! Error types used by the orchestrator and its collaborators.
//!
//! Every layer has its own enum:
//!
//! - [`RuntimeError`] for container runtime adapters (transient vs permanent).
//! - [`StoreError`] for the activation state store (CAS conflicts, uniqueness).
//! - [`BrokerError`] for the work queue.
//! - [`CredentialError`] for the credential resolver.
//! - [`ValidationError`] for rejected activation definitions.
//! - [`OrchestratorError`] for the reconcile loop; collapses the others into the
//!   taxonomy the controller acts on.
//! - [`ShutdownError`] for the orchestrator's own shutdown sequence.
//! - [`ConfigError`] for node configuration.
//!
//! All enums provide `as_label` (stable snake_case for logs/metrics).

use std::time::Duration;

use thiserror::Error;

use crate::model::InstanceStatus;

/// # Errors produced by container runtime adapters.
///
/// Split in two classes:
/// - **transient** ([`Transient`](RuntimeError::Transient), [`Timeout`](RuntimeError::Timeout)):
///   retried by the caller with backoff, never change the instance's logical state;
/// - **permanent** (everything else that is not a lookup result): surfaced immediately and
///   recorded as the instance's failure reason.
///
/// [`NotFound`](RuntimeError::NotFound) and [`AlreadyExists`](RuntimeError::AlreadyExists)
/// are lookup outcomes that callers interpret (stop of a vanished container is fine,
/// a relaunch adopts the existing handle).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Connection refused, daemon hiccup, API 5xx.
    #[error("transient failure during {op}: {error}")]
    Transient {
        /// Runtime operation (`launch`, `status`, `stop`, `logs`).
        op: &'static str,
        /// Backend message.
        error: String,
    },

    /// The call did not finish within its deadline.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// Runtime operation.
        op: &'static str,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Resource quota rejected the container.
    #[error("quota exceeded: {error}")]
    Quota { error: String },

    /// Registry or daemon refused our credentials.
    #[error("authentication failed: {error}")]
    Auth { error: String },

    /// Image could not be pulled.
    #[error("image pull failed for '{image}': {error}")]
    ImagePull { image: String, error: String },

    /// The launch spec was rejected by the backend.
    #[error("invalid launch spec: {error}")]
    InvalidSpec { error: String },

    /// The handle does not refer to an existing container.
    #[error("container '{handle}' not found")]
    NotFound { handle: String },

    /// A container with the deterministic name already exists.
    #[error("container '{name}' already exists as '{handle}'")]
    AlreadyExists {
        /// Deterministic name requested.
        name: String,
        /// Opaque handle of the existing container.
        handle: String,
    },

    /// Transient errors kept coming until the attempt cap; escalated to permanent.
    #[error("{op} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: String,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use rulevisor::RuntimeError;
    ///
    /// let err = RuntimeError::Auth { error: "denied".into() };
    /// assert_eq!(err.as_label(), "runtime_auth");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Transient { .. } => "runtime_transient",
            RuntimeError::Timeout { .. } => "runtime_timeout",
            RuntimeError::Quota { .. } => "runtime_quota",
            RuntimeError::Auth { .. } => "runtime_auth",
            RuntimeError::ImagePull { .. } => "runtime_image_pull",
            RuntimeError::InvalidSpec { .. } => "runtime_invalid_spec",
            RuntimeError::NotFound { .. } => "runtime_not_found",
            RuntimeError::AlreadyExists { .. } => "runtime_already_exists",
            RuntimeError::RetriesExhausted { .. } => "runtime_retries_exhausted",
        }
    }

    /// Indicates whether the caller should retry with backoff.
    ///
    /// # Example
    /// ```
    /// use rulevisor::RuntimeError;
    ///
    /// let err = RuntimeError::Transient { op: "status", error: "connection refused".into() };
    /// assert!(err.is_transient());
    /// assert!(!err.is_permanent());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Transient { .. } | RuntimeError::Timeout { .. }
        )
    }

    /// Indicates a failure that is terminal for the current launch attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RuntimeError::Quota { .. }
                | RuntimeError::Auth { .. }
                | RuntimeError::ImagePull { .. }
                | RuntimeError::InvalidSpec { .. }
                | RuntimeError::RetriesExhausted { .. }
        )
    }
}

/// # Errors produced by the activation state store.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No row with this id.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Compare-and-swap lost: the row moved on since it was read.
    #[error("version conflict on '{id}': expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Uniqueness violation on instance creation.
    #[error("definition '{definition}' already has instance '{existing}'")]
    AlreadyExists { definition: String, existing: String },

    /// The running-instance ceiling is reached; the launch slot was not claimed.
    #[error("running ceiling reached ({active}/{ceiling})")]
    CapacityExhausted { ceiling: usize, active: usize },

    /// Backend failure (lock poisoned, connection lost).
    #[error("store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Creates a backend error from any message.
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::Conflict { .. } => "store_conflict",
            StoreError::AlreadyExists { .. } => "store_already_exists",
            StoreError::CapacityExhausted { .. } => "store_capacity_exhausted",
            StoreError::Backend { .. } => "store_backend",
        }
    }
}

/// # Errors produced by the work queue.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker is shut down; no more messages will flow.
    #[error("broker closed")]
    Closed,

    /// Backend failure.
    #[error("broker backend error: {message}")]
    Backend { message: String },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Closed => "broker_closed",
            BrokerError::Backend { .. } => "broker_backend",
        }
    }
}

/// # Errors produced while resolving credential references.
///
/// Always treated as permanent for the launch attempt.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The reference does not resolve to anything.
    #[error("credential '{reference}' not found")]
    Missing { reference: String },

    /// Resolver backend failure.
    #[error("credential resolver error: {message}")]
    Backend { message: String },
}

impl CredentialError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CredentialError::Missing { .. } => "credential_missing",
            CredentialError::Backend { .. } => "credential_backend",
        }
    }
}

/// An activation definition that cannot be launched as written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid definition '{definition}': {field}: {reason}")]
pub struct ValidationError {
    /// Offending definition id.
    pub definition: String,
    /// Field that failed validation.
    pub field: &'static str,
    /// Human-readable explanation.
    pub reason: String,
}

/// # Errors surfaced by the reconcile loop.
///
/// Propagation:
/// - `TransientRuntime` is retried locally; reaching the caller means the signal should be
///   redelivered later.
/// - `ConcurrencyConflict` makes the controller re-read state and decide again.
/// - `PermanentRuntime` and `PolicyExhausted` are recorded on the instance.
/// - `Configuration` never produces an instance.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("transient runtime error: {0}")]
    TransientRuntime(RuntimeError),

    #[error("permanent runtime error: {reason}")]
    PermanentRuntime { reason: String },

    #[error("concurrent update on '{id}'")]
    ConcurrencyConflict { id: String },

    #[error("restart policy exhausted for instance '{instance}' after {restarts} restarts")]
    PolicyExhausted { instance: String, restarts: u32 },

    #[error(transparent)]
    Configuration(#[from] ValidationError),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("instance '{instance}' cannot move from {from} to {to}")]
    InvalidTransition {
        instance: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl OrchestratorError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            OrchestratorError::TransientRuntime(_) => "transient_runtime",
            OrchestratorError::PermanentRuntime { .. } => "permanent_runtime",
            OrchestratorError::ConcurrencyConflict { .. } => "concurrency_conflict",
            OrchestratorError::PolicyExhausted { .. } => "policy_exhausted",
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::Broker(_) => "broker",
        }
    }

    /// True when the decision should be re-made from fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::ConcurrencyConflict { .. })
    }

    /// True when the same signal may succeed later: transient runtime errors, store or
    /// broker outages, and conflicts that did not settle within the re-read budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientRuntime(_)
                | OrchestratorError::ConcurrencyConflict { .. }
                | OrchestratorError::Store(_)
                | OrchestratorError::Broker(_)
        )
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id, .. } => OrchestratorError::ConcurrencyConflict { id },
            StoreError::NotFound { entity, id } => OrchestratorError::NotFound { entity, id },
            other => OrchestratorError::Store(other),
        }
    }
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        if err.is_transient() {
            OrchestratorError::TransientRuntime(err)
        } else {
            OrchestratorError::PermanentRuntime {
                reason: err.to_string(),
            }
        }
    }
}

impl From<CredentialError> for OrchestratorError {
    fn from(err: CredentialError) -> Self {
        OrchestratorError::PermanentRuntime {
            reason: err.to_string(),
        }
    }
}

/// # Errors produced by the orchestrator's own shutdown.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// Background loops did not stop within the grace period.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of loops that were still running.
        stuck: Vec<String>,
    },
}

impl ShutdownError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use rulevisor::ShutdownError;
    /// use std::time::Duration;
    ///
    /// let err = ShutdownError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "shutdown_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ShutdownError::GraceExceeded { .. } => "shutdown_grace_exceeded",
        }
    }
}

/// # Errors produced while loading node configuration.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    /// A combination of settings makes no sense.
    #[error("inconsistent configuration: {reason}")]
    Inconsistent { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_classes_are_disjoint() {
        let all = [
            RuntimeError::Transient {
                op: "launch",
                error: "refused".into(),
            },
            RuntimeError::Timeout {
                op: "stop",
                timeout: Duration::from_secs(1),
            },
            RuntimeError::Quota { error: "q".into() },
            RuntimeError::Auth { error: "a".into() },
            RuntimeError::ImagePull {
                image: "img".into(),
                error: "e".into(),
            },
            RuntimeError::InvalidSpec { error: "s".into() },
            RuntimeError::NotFound { handle: "h".into() },
            RuntimeError::AlreadyExists {
                name: "n".into(),
                handle: "h".into(),
            },
            RuntimeError::RetriesExhausted {
                op: "launch",
                attempts: 3,
                last: "x".into(),
            },
        ];
        for err in &all {
            assert!(
                !(err.is_transient() && err.is_permanent()),
                "{} is both transient and permanent",
                err.as_label()
            );
        }
    }

    #[test]
    fn test_store_conflict_maps_to_concurrency_conflict() {
        let err: OrchestratorError = StoreError::Conflict {
            id: "i-1".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.as_label(), "concurrency_conflict");
    }

    #[test]
    fn test_runtime_error_maps_by_class() {
        let transient: OrchestratorError = RuntimeError::Transient {
            op: "status",
            error: "eof".into(),
        }
        .into();
        assert!(matches!(transient, OrchestratorError::TransientRuntime(_)));

        let permanent: OrchestratorError = RuntimeError::ImagePull {
            image: "bad:tag".into(),
            error: "manifest unknown".into(),
        }
        .into();
        match permanent {
            OrchestratorError::PermanentRuntime { reason } => assert!(reason.contains("bad:tag")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_credential_error_is_permanent() {
        let err: OrchestratorError = CredentialError::Missing {
            reference: "vault-token".into(),
        }
        .into();
        assert_eq!(err.as_label(), "permanent_runtime");
    }
}
