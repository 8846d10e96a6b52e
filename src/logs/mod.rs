//! # Instance logs.
//!
//! - [`LogSink`]: where container output and lifecycle notes go. [`TracingSink`] emits
//!   `tracing` records, [`RingBuffer`] keeps the newest entries per instance for the
//!   operational surface, [`FanoutSink`] writes to several sinks.
//! - [`LogTailer`]: one cancellable follower per running instance, resuming from the
//!   offset recorded on the instance row.

mod ring;
mod sink;
mod tailer;

pub use ring::RingBuffer;
pub use sink::{FanoutSink, LogEntry, LogSink, LogSource, TracingSink};
pub use tailer::{LogTailer, TailContext};
