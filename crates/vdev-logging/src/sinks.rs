//! ---
//! vdev_section: "03-logging"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Structured logging records and sinks."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{LogLevel, LogRecord, LogSink, RecordBuffer, SharedSink, SinkList};

/// Forwards records to the `tracing` dispatcher.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    device: Option<String>,
}

impl TracingSink {
    /// Tag every forwarded event with a device identifier.
    pub fn for_device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
        }
    }
}

impl LogSink for TracingSink {
    fn record(&self, record: LogRecord) {
        let device = self.device.as_deref().unwrap_or("");
        let fields = record
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let component = record.component;
        let message = record.message.as_str();
        match record.level {
            LogLevel::Debug => {
                tracing::debug!(device, component, fields = %fields, "{message}")
            }
            LogLevel::Info => tracing::info!(device, component, fields = %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(device, component, fields = %fields, "{message}"),
            LogLevel::Error => {
                tracing::error!(device, component, fields = %fields, "{message}")
            }
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RecordBuffer,
}

impl MemorySink {
    /// Copy of everything captured so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records at or above `level`.
    pub fn at_least(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level >= level)
            .cloned()
            .collect()
    }

    /// True when any captured message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.message.contains(needle))
    }

    /// Drop captured records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn record(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}

/// Pushes records into an unbounded channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelSink {
    /// Wrap an existing sender.
    pub fn new(tx: mpsc::UnboundedSender<LogRecord>) -> Self {
        Self { tx }
    }
}

impl LogSink for ChannelSink {
    fn record(&self, record: LogRecord) {
        let _ = self.tx.send(record);
    }
}

/// Delivers each record to every attached sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: SinkList,
}

impl FanoutSink {
    /// Start from an initial set of sinks.
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self {
            sinks: SinkList::new(sinks),
        }
    }

    /// Attach an additional sink at runtime.
    pub fn attach(&self, sink: SharedSink) {
        self.sinks.write().push(sink);
    }

    /// Number of attached sinks.
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    /// True when nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into a shared handle.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl LogSink for FanoutSink {
    fn record(&self, record: LogRecord) {
        let sinks = self.sinks.read();
        if let Some((last, rest)) = sinks.split_last() {
            for sink in rest {
                sink.record(record.clone());
            }
            last.record(record);
        }
    }
}
