//! # Node configuration.
//!
//! [`Config`] holds every knob of one orchestrator node: which queues it consumes, how
//! many activations may run, timeouts for runtime calls, and monitor cadence.
//!
//! Config is used in three places:
//! 1. **Orchestrator creation**: `Orchestrator::builder(config)`
//! 2. **Controller/Monitor**: deadlines, retry budget, ceiling
//! 3. **Binary**: `Config::from_env()` overlays `RULEVISOR_*` variables on the defaults
//!
//! ## Sentinel values
//! - `max_running = 0` → no running ceiling
//! - `worker_concurrency = 0` → unbounded reconcile concurrency (no semaphore)
//! - `liveness_timeout = 0s` → unresponsive detection disabled (the default; turning it on
//!   requires `heartbeat_url`, which containers are told to report to)
//! - `start_timeout = 0s` → instances may stay `starting` indefinitely

use std::time::Duration;

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, JitterPolicy, RetryPolicy};

/// Default worker queue name.
pub const DEFAULT_QUEUE: &str = "activation";

/// Configuration of one orchestrator node.
///
/// All fields are public; prefer the helper accessors over sprinkling sentinel checks.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this node (lease holder name, log field).
    pub node_id: String,

    /// Worker queues this node consumes; one controller per queue.
    pub queues: Vec<String>,

    /// System-wide ceiling on `starting` + `running` instances (`0` = unlimited).
    pub max_running: usize,

    /// Signals reconciled in parallel per node (`0` = unlimited).
    pub worker_concurrency: usize,

    /// Period of the monitor tick.
    pub monitor_interval: Duration,

    /// TTL of the advisory lease that deduplicates monitor ticks.
    pub lease_ttl: Duration,

    /// Deadline for one `launch` call.
    pub launch_timeout: Duration,

    /// Deadline for one `stop` call (on top of the grace period).
    pub stop_timeout: Duration,

    /// Deadline for one `status` call.
    pub status_timeout: Duration,

    /// Grace period given to a container between terminate and kill.
    pub stop_grace: Duration,

    /// Longest an instance may stay `starting` (`0s` = no limit).
    pub start_timeout: Duration,

    /// Re-check cadence while an instance is `starting`.
    pub status_poll_interval: Duration,

    /// Heartbeat age after which a running instance is unresponsive (`0s` = disabled).
    pub liveness_timeout: Duration,

    /// Base URL of this node's operational surface as reachable from containers. Each
    /// container gets `ACTIVATION_HEARTBEAT_URL` derived from it.
    pub heartbeat_url: Option<String>,

    /// Backoff and attempt cap for transient runtime errors.
    pub runtime_retry: RetryPolicy,

    /// Bound on the compare-and-swap re-read loop of one reconcile.
    pub max_reconcile_attempts: u32,

    /// Log lines kept in memory per instance.
    pub log_ring_capacity: usize,

    /// Capacity of the in-process event bus (min 1).
    pub bus_capacity: usize,

    /// How long shutdown waits for background loops.
    pub grace: Duration,
}

impl Config {
    /// Running ceiling as an `Option`.
    #[inline]
    pub fn running_ceiling(&self) -> Option<usize> {
        (self.max_running != 0).then_some(self.max_running)
    }

    /// Reconcile concurrency as an `Option`.
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.worker_concurrency != 0).then_some(self.worker_concurrency)
    }

    #[inline]
    pub fn liveness_timeout(&self) -> Option<Duration> {
        (!self.liveness_timeout.is_zero()).then_some(self.liveness_timeout)
    }

    #[inline]
    pub fn start_timeout(&self) -> Option<Duration> {
        (!self.start_timeout.is_zero()).then_some(self.start_timeout)
    }

    /// Bus capacity clamped to at least 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Queue used for definitions when placement has nothing else to go on.
    pub fn default_queue(&self) -> &str {
        self.queues.first().map_or(DEFAULT_QUEUE, String::as_str)
    }

    /// Defaults overlaid with `RULEVISOR_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with variables from `lookup`.
    ///
    /// Durations are whole seconds unless the key ends in `_MS`. `RULEVISOR_QUEUES` is a
    /// comma-separated list.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env { lookup: &lookup };

        if let Some(node) = env.string("RULEVISOR_NODE_ID") {
            cfg.node_id = node;
        }
        if let Some(queues) = env.string("RULEVISOR_QUEUES") {
            cfg.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
        }
        env.parse("RULEVISOR_MAX_RUNNING", &mut cfg.max_running)?;
        env.parse("RULEVISOR_WORKER_CONCURRENCY", &mut cfg.worker_concurrency)?;
        env.secs("RULEVISOR_MONITOR_INTERVAL_SECS", &mut cfg.monitor_interval)?;
        env.secs("RULEVISOR_LEASE_TTL_SECS", &mut cfg.lease_ttl)?;
        env.secs("RULEVISOR_LAUNCH_TIMEOUT_SECS", &mut cfg.launch_timeout)?;
        env.secs("RULEVISOR_STOP_TIMEOUT_SECS", &mut cfg.stop_timeout)?;
        env.secs("RULEVISOR_STATUS_TIMEOUT_SECS", &mut cfg.status_timeout)?;
        env.secs("RULEVISOR_STOP_GRACE_SECS", &mut cfg.stop_grace)?;
        env.secs("RULEVISOR_START_TIMEOUT_SECS", &mut cfg.start_timeout)?;
        env.millis("RULEVISOR_STATUS_POLL_MS", &mut cfg.status_poll_interval)?;
        env.secs("RULEVISOR_LIVENESS_TIMEOUT_SECS", &mut cfg.liveness_timeout)?;
        if let Some(url) = env.string("RULEVISOR_HEARTBEAT_URL") {
            cfg.heartbeat_url = Some(url);
        }
        env.parse("RULEVISOR_RETRY_MAX_ATTEMPTS", &mut cfg.runtime_retry.max_attempts)?;
        env.millis("RULEVISOR_RETRY_FIRST_MS", &mut cfg.runtime_retry.backoff.first)?;
        env.millis("RULEVISOR_RETRY_MAX_MS", &mut cfg.runtime_retry.backoff.max)?;
        if let Some(raw) = env.string("RULEVISOR_RETRY_JITTER") {
            cfg.runtime_retry.backoff.jitter =
                JitterPolicy::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                    key: "RULEVISOR_RETRY_JITTER".into(),
                    value: raw.clone(),
                    reason: "expected none, full or equal".into(),
                })?;
        }
        env.parse("RULEVISOR_MAX_RECONCILE_ATTEMPTS", &mut cfg.max_reconcile_attempts)?;
        env.parse("RULEVISOR_LOG_RING_CAPACITY", &mut cfg.log_ring_capacity)?;
        env.parse("RULEVISOR_BUS_CAPACITY", &mut cfg.bus_capacity)?;
        env.secs("RULEVISOR_GRACE_SECS", &mut cfg.grace)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects combinations that would stall the orchestrator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inconsistent = |reason: &str| ConfigError::Inconsistent {
            reason: reason.to_string(),
        };
        if self.node_id.trim().is_empty() {
            return Err(inconsistent("node_id must not be empty"));
        }
        if self.queues.is_empty() {
            return Err(inconsistent("at least one queue is required"));
        }
        if self.monitor_interval.is_zero() {
            return Err(inconsistent("monitor_interval must be positive"));
        }
        if self.lease_ttl.is_zero() {
            return Err(inconsistent("lease_ttl must be positive"));
        }
        if self.status_poll_interval.is_zero() {
            return Err(inconsistent("status_poll_interval must be positive"));
        }
        if self.max_reconcile_attempts == 0 {
            return Err(inconsistent("max_reconcile_attempts must be positive"));
        }
        if self.liveness_timeout().is_some() && self.heartbeat_url.is_none() {
            return Err(inconsistent(
                "liveness_timeout requires heartbeat_url: containers would never report",
            ));
        }
        if self.runtime_retry.backoff.factor < 1.0 {
            return Err(inconsistent("retry backoff factor must be >= 1.0"));
        }
        Ok(())
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - one queue `activation`, at most 5 active instances, 16 parallel reconciles
    /// - monitor every 30s, 10s lease
    /// - launch 60s / stop 30s / status 10s deadlines, 10s stop grace
    /// - `starting` for at most 120s, polled every second
    /// - no unresponsive detection (needs `heartbeat_url`)
    /// - transient retries: 200ms doubling to 10s, full jitter, 5 attempts
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            max_running: 5,
            worker_concurrency: 16,
            monitor_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(10),
            start_timeout: Duration::from_secs(120),
            status_poll_interval: Duration::from_secs(1),
            liveness_timeout: Duration::ZERO,
            heartbeat_url: None,
            runtime_retry: RetryPolicy {
                backoff: BackoffPolicy::default(),
                max_attempts: 5,
            },
            max_reconcile_attempts: 8,
            log_ring_capacity: 1000,
            bus_capacity: 1024,
            grace: Duration::from_secs(30),
        }
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *slot = raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn secs(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse(key, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }

    fn millis(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = slot.as_millis() as u64;
        self.parse(key, &mut ms)?;
        *slot = Duration::from_millis(ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.running_ceiling(), Some(5));
        assert_eq!(cfg.default_queue(), "activation");
        assert_eq!(cfg.liveness_timeout(), None);
        assert_eq!(cfg.heartbeat_url, None);
    }

    #[test]
    fn liveness_without_heartbeat_url_is_rejected() {
        let err = Config::from_lookup(lookup(&[("RULEVISOR_LIVENESS_TIMEOUT_SECS", "310")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { .. }));

        let cfg = Config::from_lookup(lookup(&[
            ("RULEVISOR_LIVENESS_TIMEOUT_SECS", "310"),
            ("RULEVISOR_HEARTBEAT_URL", "http://10.0.0.5:8080"),
        ]))
        .unwrap();
        assert_eq!(cfg.liveness_timeout(), Some(Duration::from_secs(310)));
        assert_eq!(cfg.heartbeat_url.as_deref(), Some("http://10.0.0.5:8080"));
    }

    #[test]
    fn zero_sentinels_disable_limits() {
        let cfg = Config {
            max_running: 0,
            worker_concurrency: 0,
            liveness_timeout: Duration::ZERO,
            start_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(cfg.running_ceiling(), None);
        assert_eq!(cfg.concurrency_limit(), None);
        assert_eq!(cfg.liveness_timeout(), None);
        assert_eq!(cfg.start_timeout(), None);
    }

    #[test]
    fn lookup_overlays_defaults() {
        let cfg = Config::from_lookup(lookup(&[
            ("RULEVISOR_NODE_ID", "worker-7"),
            ("RULEVISOR_QUEUES", "activation-node1, activation-node2,"),
            ("RULEVISOR_MAX_RUNNING", "12"),
            ("RULEVISOR_STATUS_POLL_MS", "250"),
            ("RULEVISOR_RETRY_JITTER", "equal"),
        ]))
        .unwrap();
        assert_eq!(cfg.node_id, "worker-7");
        assert_eq!(cfg.queues, vec!["activation-node1", "activation-node2"]);
        assert_eq!(cfg.max_running, 12);
        assert_eq!(cfg.status_poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.runtime_retry.backoff.jitter, JitterPolicy::Equal);
        assert_eq!(cfg.monitor_interval, Duration::from_secs(30));
    }

    #[test]
    fn lookup_reports_bad_numbers() {
        let err = Config::from_lookup(lookup(&[("RULEVISOR_MAX_RUNNING", "many")])).unwrap_err();
        match err {
            ConfigError::Invalid { key, value, .. } => {
                assert_eq!(key, "RULEVISOR_MAX_RUNNING");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_queue_list_is_rejected() {
        let err = Config::from_lookup(lookup(&[("RULEVISOR_QUEUES", " , ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { .. }));
    }
}
