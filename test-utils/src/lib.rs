//! Shared fakes and fixtures for xenlite tests.

pub mod hypervisor;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use xenlite::domain::{BuildInfo, GuestBuildInfo, HvmBuildInfo, PvBuildInfo};
use xenlite::hypervisor::TscMode;
use xenlite::{SuspendOptions, XenliteContext, XenliteOptions};

pub use hypervisor::{EvtchnLog, FakeEventChannel, FakeHypervisor, HvCall, LOCAL_SUSPEND_PORT, ops};
pub use store::{JournalEntry, MemoryStore};

/// A context over fresh fakes and an isolated state directory.
pub struct TestContext {
    pub ctx: XenliteContext,
    pub store: Arc<MemoryStore>,
    pub hv: Arc<FakeHypervisor>,
    pub state_dir: PathBuf,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    /// Polls never sleep, device model waits time out at once and the
    /// CPUID policy is applied.
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    pub fn with_options(customize: impl FnOnce(&mut XenliteOptions)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let state_dir = temp_dir.path().join("state");
        let mut options = XenliteOptions {
            state_dir: state_dir.clone(),
            firmware_dir: temp_dir.path().join("boot"),
            log_dir: None,
            suspend: SuspendOptions {
                watchdog_attempts: 60,
                poll_interval_ms: 0,
            },
            device_model_wait_secs: 0,
            cpuid_policy: Some(true),
            ..XenliteOptions::default()
        };
        customize(&mut options);

        let store = Arc::new(MemoryStore::new());
        let hv = Arc::new(FakeHypervisor::new());
        let ctx = XenliteContext::new(store.clone(), hv.clone(), options)
            .expect("Failed to create context");
        Self {
            ctx,
            store,
            hv,
            state_dir,
            _temp_dir: temp_dir,
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// HVM guest: 4 vcpus (0 and 2 online), 512 MiB with 8 MiB of video RAM.
pub fn hvm_build_info() -> BuildInfo {
    BuildInfo {
        max_vcpus: 4,
        cur_vcpus: 0b0101,
        max_memkb: 524288,
        target_memkb: 524288,
        video_memkb: 8192,
        tsc_mode: TscMode::Default,
        kernel: "hvmloader".into(),
        guest: GuestBuildInfo::Hvm(HvmBuildInfo {
            shadow_memkb: 6144,
            pae: true,
            viridian: false,
            hpet: true,
            vpt_align: true,
            timer_mode: 1,
        }),
    }
}

/// PV guest: 2 vcpus, 256 MiB target out of 384 MiB.
pub fn pv_build_info() -> BuildInfo {
    BuildInfo {
        max_vcpus: 2,
        cur_vcpus: 0b11,
        max_memkb: 393216,
        target_memkb: 262144,
        video_memkb: 0,
        tsc_mode: TscMode::Default,
        kernel: "/boot/vmlinuz-xen".into(),
        guest: GuestBuildInfo::Pv(PvBuildInfo {
            slack_memkb: 8192,
            cmdline: "root=/dev/xvda1 ro".into(),
            ramdisk: Some("/boot/initrd-xen".into()),
            features: String::new(),
        }),
    }
}
