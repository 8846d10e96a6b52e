//! # Tracing subscriber for orchestration events.
//!
//! [`LogWriter`] renders every bus event as one structured `tracing` record under the
//! `rulevisor::events` target:
//!
//! ```text
//! INFO  status changed instance=01hx… definition=d1 from=running to=failed reason="exit code 1"
//! INFO  restart scheduled instance=01hx… definition=d1 delay_ms=60000 attempt=1
//! WARN  restart policy exhausted instance=01hx… definition=d1 attempt=5
//! ```

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::Subscribe;
use crate::events::{Event, EventKind};

/// Logs events through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let instance = e.instance.as_deref().unwrap_or("-");
        let definition = e.definition.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::InstanceCreated => {
                info!(target: "rulevisor::events", instance, definition, launch_key = reason, "instance created");
            }
            EventKind::StatusChanged => {
                let from = e.from.map(|s| s.as_str()).unwrap_or("-");
                let to = e.to.map(|s| s.as_str()).unwrap_or("-");
                info!(target: "rulevisor::events", instance, definition, from, to, reason, "status changed");
            }
            EventKind::RestartScheduled => {
                info!(target: "rulevisor::events", instance, definition, delay_ms = e.delay_ms, attempt = e.attempt, "restart scheduled");
            }
            EventKind::PolicyExhausted => {
                warn!(target: "rulevisor::events", instance, definition, attempt = e.attempt, "restart policy exhausted");
            }
            EventKind::LaunchFailed => {
                warn!(target: "rulevisor::events", instance, definition, reason, "launch failed");
            }
            EventKind::RuntimeRetry => {
                warn!(target: "rulevisor::events", instance, definition, reason, delay_ms = e.delay_ms, "runtime unavailable, retrying");
            }
            EventKind::ConfigurationRejected => {
                warn!(target: "rulevisor::events", definition, reason, "definition rejected");
            }
            EventKind::MonitorSweep => {
                info!(target: "rulevisor::events", tick = e.attempt, summary = reason, "monitor sweep");
            }
            EventKind::CeilingEnforced => {
                warn!(target: "rulevisor::events", instance, definition, "running ceiling enforced");
            }
            EventKind::SubscriberPanicked => {
                error!(target: "rulevisor::events", subscriber = e.subscriber, reason, "subscriber panicked");
            }
            EventKind::SubscriberOverflow => {
                warn!(target: "rulevisor::events", subscriber = e.subscriber, reason, "subscriber dropped event");
            }
            EventKind::ShutdownRequested => {
                info!(target: "rulevisor::events", "shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!(target: "rulevisor::events", "all loops stopped within grace");
            }
            EventKind::GraceExceeded => {
                warn!(target: "rulevisor::events", stuck = reason, "shutdown grace exceeded");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
