//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
/// Inbound and outbound topics for one device.
///
/// The platform publishes on `/{id}/p2d` and listens on `/{id}/d2p`. Loop mode
/// swaps the pair so a second instance can stand in for the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    inbound: String,
    outbound: String,
}

impl Topics {
    /// Topics for `device_id`, swapped when `loop_mode` is set.
    pub fn for_device(device_id: &str, loop_mode: bool) -> Self {
        let p2d = format!("/{device_id}/p2d");
        let d2p = format!("/{device_id}/d2p");
        if loop_mode {
            Self {
                inbound: d2p,
                outbound: p2d,
            }
        } else {
            Self {
                inbound: p2d,
                outbound: d2p,
            }
        }
    }

    /// Topic the device subscribes to.
    pub fn inbound(&self) -> &str {
        &self.inbound
    }

    /// Topic the device publishes on.
    pub fn outbound(&self) -> &str {
        &self.outbound
    }
}
