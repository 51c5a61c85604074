//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Device state store and protocol engine."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Device state and the protocol engine that keeps it in sync with the platform.

pub mod compose;
pub mod engine;
pub mod store;

pub use compose::{compose_tx_message, ComposeError};
pub use engine::{
    DeliveryBudget, EngineCommand, EngineError, EngineHandle, EngineMode, EngineState,
    ProtocolEngine,
};
pub use store::{DeviceStateStore, ObserverId, ReadRequest, StateSnapshot, StoreError};
