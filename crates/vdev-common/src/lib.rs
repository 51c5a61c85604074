//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Shared configuration and runtime setup."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Shared primitives for the virtual device workspace: device and platform
//! configuration files plus tracing subscriber setup.

pub mod config;
pub mod logging;

pub use config::{
    CipherScheme, DeviceConfig, DeviceSettings, LoggingConfig, MqttConfig, PlatformConfig,
};
pub use logging::{init_tracing, LogFormat};
