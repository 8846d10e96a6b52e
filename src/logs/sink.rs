use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::model::InstanceId;
use crate::runtime::LogLine;

/// Where a log entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Container output.
    Container,
    /// Lifecycle note written by the orchestrator.
    Orchestrator,
}

/// One entry of an instance's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub source: LogSource,
    /// Container line offset; `None` for orchestrator notes.
    pub offset: Option<u64>,
    pub line: String,
}

impl LogEntry {
    pub fn container(line: &LogLine) -> Self {
        Self {
            at: line.at,
            source: LogSource::Container,
            offset: Some(line.offset),
            line: line.line.clone(),
        }
    }

    pub fn note(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            at,
            source: LogSource::Orchestrator,
            offset: None,
            line: message.into(),
        }
    }
}

/// Destination for container output and lifecycle notes.
///
/// Sinks never fail the caller: a sink that cannot write drops the entry.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn write_lines(&self, instance: &InstanceId, lines: &[LogLine]);

    async fn append_instance_log(&self, instance: &InstanceId, at: DateTime<Utc>, message: &str);
}

/// Emits every entry as a `tracing` record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn write_lines(&self, instance: &InstanceId, lines: &[LogLine]) {
        for l in lines {
            info!(target: "rulevisor::container", instance = %instance, offset = l.offset, "{}", l.line);
        }
    }

    async fn append_instance_log(&self, instance: &InstanceId, _at: DateTime<Utc>, message: &str) {
        info!(target: "rulevisor::instance", instance = %instance, "{message}");
    }
}

/// Writes to every inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl LogSink for FanoutSink {
    async fn write_lines(&self, instance: &InstanceId, lines: &[LogLine]) {
        for sink in &self.sinks {
            sink.write_lines(instance, lines).await;
        }
    }

    async fn append_instance_log(&self, instance: &InstanceId, at: DateTime<Utc>, message: &str) {
        for sink in &self.sinks {
            sink.append_instance_log(instance, at, message).await;
        }
    }
}
