use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LogEntry, LogSink};
use crate::model::InstanceId;
use crate::runtime::LogLine;

/// Last `capacity` entries per instance. Backs the operational log endpoint.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    rings: Mutex<HashMap<InstanceId, VecDeque<LogEntry>>>,
}

impl RingBuffer {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    fn push_all<I>(&self, instance: &InstanceId, entries: I)
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut rings = self.rings.lock().unwrap_or_else(|p| p.into_inner());
        let ring = rings.entry(instance.clone()).or_default();
        for entry in entries {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry);
        }
    }

    /// Buffered entries, oldest first.
    pub fn snapshot(&self, instance: &InstanceId) -> Vec<LogEntry> {
        let rings = self.rings.lock().unwrap_or_else(|p| p.into_inner());
        rings
            .get(instance)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `n` entries, oldest first.
    pub fn tail(&self, instance: &InstanceId, n: usize) -> Vec<LogEntry> {
        let mut all = self.snapshot(instance);
        let skip = all.len().saturating_sub(n);
        all.drain(..skip);
        all
    }
}

#[async_trait]
impl LogSink for RingBuffer {
    async fn write_lines(&self, instance: &InstanceId, lines: &[LogLine]) {
        self.push_all(instance, lines.iter().map(LogEntry::container));
    }

    async fn append_instance_log(&self, instance: &InstanceId, at: DateTime<Utc>, message: &str) {
        self.push_all(instance, [LogEntry::note(at, message)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogSource;

    fn line(offset: u64) -> LogLine {
        LogLine {
            offset,
            at: Utc::now(),
            line: format!("line {offset}"),
        }
    }

    #[tokio::test]
    async fn keeps_only_the_newest_entries() {
        let ring = RingBuffer::new(3);
        let id = InstanceId::new("i1");
        ring.write_lines(&id, &[line(0), line(1), line(2), line(3)]).await;
        ring.append_instance_log(&id, Utc::now(), "running -> failed").await;

        let entries = ring.snapshot(&id);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, Some(2));
        assert_eq!(entries[2].source, LogSource::Orchestrator);
        assert_eq!(ring.tail(&id, 1)[0].line, "running -> failed");
    }

    #[tokio::test]
    async fn instances_are_isolated() {
        let ring = RingBuffer::new(10);
        ring.write_lines(&InstanceId::new("a"), &[line(0)]).await;
        assert!(ring.snapshot(&InstanceId::new("b")).is_empty());
    }
}
