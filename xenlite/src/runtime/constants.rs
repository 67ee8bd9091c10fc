//! Constants for the xenlite toolstack
//!
//! Centralized location for hardcoded values, paths, and tunable defaults.

// Re-export shared constants from xenlite-shared
pub use xenlite_shared::constants::{control, device_model, store};

pub mod envs {
    /// Overrides the state directory (userdata, device model files)
    pub const XENLITE_STATE_DIR: &str = "XENLITE_STATE_DIR";
    /// Overrides the firmware directory used to resolve HVM firmware paths
    pub const XENLITE_FIRMWARE_DIR: &str = "XENLITE_FIRMWARE_DIR";
}

/// Default filesystem locations
pub mod paths {
    /// Durable state: userdata records and device model state files
    pub const STATE_DIR: &str = "/var/lib/xen";

    /// Firmware and HVM loader images
    pub const FIRMWARE_DIR: &str = "/usr/lib/xen/boot";
}

/// Memory accounting
pub mod memory {
    /// Per-domain overhead added on top of target memory for max memory (KiB)
    pub const MAXMEM_CONSTANT_KB: u64 = 1024;
}

/// Suspend handshake defaults
pub mod suspend {
    /// Poll iterations before the fallback path gives up
    pub const WATCHDOG_ATTEMPTS: u32 = 60;

    /// Sleep between polls
    pub const POLL_INTERVAL_MS: u64 = 100;
}

/// Device model defaults
pub mod device_model_defaults {
    /// How long to wait for the emulator to reach a requested state
    pub const WAIT_SECS: u64 = 10;
}

/// Userdata role tags
pub mod userdata_roles {
    /// Durable record
    pub const DURABLE: &str = "d";
    /// Staging file for in-flight writes
    pub const STAGING: &str = "n";
    /// Matches every role
    pub const ANY: &str = "?";
    /// Matches every user id
    pub const ANY_USER: &str = "*";
}
