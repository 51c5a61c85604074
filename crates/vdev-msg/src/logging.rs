//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use vdev_logging::{LogRecord, LogSink};

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Published by the device.
    Outbound,
    /// Received from the broker.
    Inbound,
}

impl MessageDirection {
    fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Outbound => "outbound",
            MessageDirection::Inbound => "inbound",
        }
    }
}

/// Emit a debug record describing message activity.
///
/// Payloads are logged as (lossy) text; ciphered payloads show up as base64.
pub fn log_message(sink: &dyn LogSink, direction: MessageDirection, topic: &str, payload: &[u8]) {
    sink.record(
        LogRecord::debug("messaging", "messaging activity")
            .field("direction", direction.as_str())
            .field("topic", topic)
            .field("bytes", payload.len())
            .field("payload", String::from_utf8_lossy(payload)),
    );
}
