//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};
use serde::Serialize;

/// Snapshot of message counters for status output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessagingMetrics {
    /// Messages handed to the transport.
    pub sent: u64,
    /// Messages taken from the transport.
    pub received: u64,
    /// Inbound messages rejected or outbound messages that failed.
    pub dropped: u64,
}

/// Prometheus counters behind [`MessagingMetrics`].
#[derive(Debug, Clone)]
pub struct MessageCounters {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
}

impl MessageCounters {
    /// Create the counters and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "vdev_messages_sent_total",
            "Messages handed to the transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "vdev_messages_received_total",
            "Messages taken from the transport",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "vdev_messages_dropped_total",
            "Inbound messages rejected or outbound messages that failed",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
        })
    }

    pub fn record_sent(&self) {
        self.sent.inc();
    }

    pub fn record_received(&self) {
        self.received.inc();
    }

    pub fn record_dropped(&self) {
        self.dropped.inc();
    }

    /// Current values.
    pub fn snapshot(&self) -> MessagingMetrics {
        MessagingMetrics {
            sent: self.sent.get(),
            received: self.received.get(),
            dropped: self.dropped.get(),
        }
    }
}
