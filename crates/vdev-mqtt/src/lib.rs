//! ---
//! vdev_section: "04-transport"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "MQTT 3.1.1 packet codec and client transport."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Minimal MQTT 3.1.1 client for the device transport.
//!
//! Supports exactly what the device needs: a clean session with optional
//! credentials, QoS 0 subscribe and publish, keep-alive pings and an orderly
//! disconnect.

pub mod client;
pub mod packet;

pub use client::{MqttOptions, MqttTransport};
pub use packet::{Connect, Packet, PacketError, Publish};
