//! Shared constants between the toolstack and its collaborators
//!
//! Store keys and stream markers must be identical on both sides: the guest,
//! the device model and the restore path all read what these name.

/// Config store layout
pub mod store {
    /// Root of every domain's subtree
    pub const LOCAL_DOMAIN: &str = "/local/domain";

    /// Key under a domain path naming its parent vm path
    pub const VM: &str = "vm";

    /// Control key the guest watches for shutdown/suspend requests
    pub const CONTROL_SHUTDOWN: &str = "control/shutdown";

    /// Key holding the pre-agreed suspend event channel port
    pub const SUSPEND_EVENT_CHANNEL: &str = "device/suspend/event-channel";

    /// Build publication keys
    pub const MEMORY_STATIC_MAX: &str = "memory/static-max";
    pub const MEMORY_TARGET: &str = "memory/target";
    pub const MEMORY_VIDEORAM: &str = "memory/videoram";
    pub const DOMID: &str = "domid";
    pub const STORE_PORT: &str = "store/port";
    pub const STORE_RING_REF: &str = "store/ring-ref";

    /// Per-vcpu availability key
    pub fn cpu_availability(vcpu: u32) -> String {
        format!("cpu/{vcpu}/availability")
    }

    /// Subtree of a domain: /local/domain/{domid}
    pub fn domain_path(domid: u32) -> String {
        format!("{LOCAL_DOMAIN}/{domid}")
    }
}

/// Values written to control keys
pub mod control {
    pub const SUSPEND: &str = "suspend";
    pub const ONLINE: &str = "online";
    pub const OFFLINE: &str = "offline";
}

/// Device model (emulator) protocol
pub mod device_model {
    /// Domain that hosts the device models
    pub const HOST_DOMID: u32 = 0;

    /// Signature preceding device model state in a save stream
    pub const SIGNATURE: &str = "QemuDeviceModelRecord";

    pub const CMD_SAVE: &str = "save";
    pub const STATE_PAUSED: &str = "paused";
    pub const LOGDIRTY_ENABLE: &str = "enable";
    pub const LOGDIRTY_DISABLE: &str = "disable";

    /// Copy chunk for the state file
    pub const CHUNK_SIZE: usize = 1024;

    /// /local/domain/0/device-model/{domid}
    pub fn base_path(domid: u32) -> String {
        format!("/local/domain/{HOST_DOMID}/device-model/{domid}")
    }

    pub fn command_path(domid: u32) -> String {
        format!("{}/command", base_path(domid))
    }

    pub fn state_path(domid: u32) -> String {
        format!("{}/state", base_path(domid))
    }

    pub fn logdirty_cmd_path(domid: u32) -> String {
        format!("{}/logdirty/cmd", base_path(domid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_paths() {
        assert_eq!(store::domain_path(7), "/local/domain/7");
        assert_eq!(store::cpu_availability(3), "cpu/3/availability");
    }

    #[test]
    fn test_device_model_paths() {
        assert_eq!(
            device_model::command_path(12),
            "/local/domain/0/device-model/12/command"
        );
        assert_eq!(
            device_model::logdirty_cmd_path(12),
            "/local/domain/0/device-model/12/logdirty/cmd"
        );
    }
}
