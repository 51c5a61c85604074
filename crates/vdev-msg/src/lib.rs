//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Everything that sits between device state and the pub/sub wire.
//!
//! [`MessageCodec`] turns `{"DATA": ...}` payloads into validated [`Batch`]es
//! and back, optionally through a [`vdev_security::Cipher`]. The [`Transport`]
//! trait describes the broker client the engine drives; [`InMemoryBroker`]
//! implements it in-process for tests and loop-mode demos.
#![warn(missing_docs)]

pub mod batch;
pub mod codec;
pub mod logging;
pub mod metrics;
pub mod topics;
pub mod transport;

pub use batch::{batch_from_values, Batch, BatchValue};
pub use codec::{DecodeError, EncodeError, MessageCodec, DATA_FIELD};
pub use logging::{log_message, MessageDirection};
pub use metrics::{MessageCounters, MessagingMetrics};
pub use topics::Topics;
pub use transport::{
    DeliveryAck, InMemoryBroker, InMemoryTransport, PublishedMessage, Transport, TransportError,
    TransportEvent, TransportEvents,
};
