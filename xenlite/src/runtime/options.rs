//! Configuration for xenlite.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::retry::RetryPolicy;
use crate::runtime::constants::{device_model_defaults, envs, paths, suspend};
use serde::{Deserialize, Serialize};
use xenlite_shared::errors::{XenliteError, XenliteResult};

// ============================================================================
// Suspend Options
// ============================================================================

/// Bounds of the fallback suspend poll loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendOptions {
    /// Poll iterations before the watchdog expires.
    #[serde(default = "default_watchdog_attempts")]
    pub watchdog_attempts: u32,

    /// Sleep between polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_watchdog_attempts() -> u32 {
    suspend::WATCHDOG_ATTEMPTS
}

fn default_poll_interval_ms() -> u64 {
    suspend::POLL_INTERVAL_MS
}

impl Default for SuspendOptions {
    fn default() -> Self {
        Self {
            watchdog_attempts: default_watchdog_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SuspendOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Toolstack Options
// ============================================================================

/// Options for a [`XenliteContext`](crate::XenliteContext).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XenliteOptions {
    /// Durable state directory (userdata, device model files).
    ///
    /// Default: `$XENLITE_STATE_DIR` or /var/lib/xen
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory relative HVM firmware paths resolve against.
    ///
    /// Default: `$XENLITE_FIRMWARE_DIR` or /usr/lib/xen/boot
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,

    /// Directory for the rolling log file. No file logging when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub suspend: SuspendOptions,

    /// How long to wait for the device model to change state, in seconds.
    #[serde(default = "default_device_model_wait_secs")]
    pub device_model_wait_secs: u64,

    /// Retry policy for conflicting build publication transactions.
    #[serde(default)]
    pub transaction_retry: RetryPolicy,

    /// Force (`Some(true)`) or suppress (`Some(false)`) CPUID policy
    /// application. Detected from the host architecture when unset.
    #[serde(default)]
    pub cpuid_policy: Option<bool>,
}

fn default_state_dir() -> PathBuf {
    std::env::var(envs::XENLITE_STATE_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(paths::STATE_DIR))
}

fn default_firmware_dir() -> PathBuf {
    std::env::var(envs::XENLITE_FIRMWARE_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(paths::FIRMWARE_DIR))
}

fn default_device_model_wait_secs() -> u64 {
    device_model_defaults::WAIT_SECS
}

impl Default for XenliteOptions {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            firmware_dir: default_firmware_dir(),
            log_dir: None,
            suspend: SuspendOptions::default(),
            device_model_wait_secs: default_device_model_wait_secs(),
            transaction_retry: RetryPolicy::default(),
            cpuid_policy: None,
        }
    }
}

impl XenliteOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> XenliteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| XenliteError::io(path, e))?;
        let options = serde_json::from_str(&content).map_err(|e| {
            XenliteError::Config(format!("invalid options in {}: {}", path.display(), e))
        })?;
        Ok(options)
    }

    pub fn device_model_wait(&self) -> Duration {
        Duration::from_secs(self.device_model_wait_secs)
    }
}
