//! ---
//! vdev_section: "03-logging"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Structured logging records and sinks."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Logging collaborators handed to every device component.
//!
//! Components never reach for a process-wide logger directly. They hold a
//! [`SharedSink`] and emit [`LogRecord`]s through it; the default
//! [`TracingSink`] forwards to `tracing`, tests capture with [`MemorySink`],
//! and a console attaches a [`ChannelSink`] through [`FanoutSink`].
#![warn(missing_docs)]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

pub mod sinks;

pub use sinks::{ChannelSink, FanoutSink, MemorySink, TracingSink};

/// Shared handle to a sink, cloned into each component.
pub type SharedSink = Arc<dyn LogSink>;

/// Severity attached to a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics, e.g. serialized payloads.
    Debug,
    /// Normal lifecycle and audit events.
    Info,
    /// Recoverable problems such as dropped messages.
    Warn,
    /// Failures that stop an operation.
    Error,
}

impl LogLevel {
    /// Lower-case label used by text renderers.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Severity of the entry.
    pub level: LogLevel,
    /// Component that produced the entry, e.g. `store` or `engine`.
    pub component: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Ordered key/value context.
    pub fields: Vec<(&'static str, String)>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Build a record at the given level.
    pub fn new(level: LogLevel, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            component,
            message: message.into(),
            fields: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a debug record.
    pub fn debug(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, component, message)
    }

    /// Shorthand for an info record.
    pub fn info(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, component, message)
    }

    /// Shorthand for a warning record.
    pub fn warn(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, component, message)
    }

    /// Shorthand for an error record.
    pub fn error(component: &'static str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, component, message)
    }

    /// Attach a key/value pair.
    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Look up a field value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.timestamp.to_rfc3339(),
            self.component,
            self.level,
            self.message
        )?;
        for (key, value) in &self.fields {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// Destination for [`LogRecord`]s.
pub trait LogSink: Send + Sync {
    /// Consume one record. Implementations must not block for long.
    fn record(&self, record: LogRecord);
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn record(&self, record: LogRecord) {
        (**self).record(record)
    }
}

/// Default sink used when a component is built without an explicit one.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink::default())
}

/// Capture sink plus its shared handle, convenient for tests.
pub fn memory_sink() -> (SharedSink, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    (sink.clone(), sink)
}

/// Sender half used to forward records into a UI or other consumer.
pub fn channel_sink() -> (SharedSink, mpsc::UnboundedReceiver<LogRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink::new(tx)), rx)
}

pub(crate) type RecordBuffer = Mutex<Vec<LogRecord>>;
pub(crate) type SinkList = RwLock<Vec<SharedSink>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_builder_keeps_field_order() {
        let record = LogRecord::info("store", "write")
            .field("attribute", "f_num")
            .field("value", 5);
        assert_eq!(record.get("attribute"), Some("f_num"));
        assert_eq!(record.get("value"), Some("5"));
        assert_eq!(record.fields[0].0, "attribute");
        assert!(record.to_string().ends_with("write attribute=f_num value=5"));
    }

    #[test]
    fn tracing_sink_emits_without_subscriber() {
        let sink = tracing_sink();
        sink.record(LogRecord::warn("codec", "dropped").field("reason", "malformed"));
    }
}
