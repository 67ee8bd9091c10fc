//! Hypervisor control interface consumed by the toolstack core.
//!
//! The core never talks to the hypervisor directly. Everything privileged goes
//! through the [`Hypervisor`] trait so that the orchestration logic can be
//! driven against a real control library or an in-memory fake.

pub mod capabilities;
pub mod evtchn;

use std::io::{Read, Write};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xenlite_shared::errors::XenliteResult;

pub use capabilities::Capabilities;
pub use evtchn::EventChannel;

/// Hypervisor-assigned domain identity.
pub type DomId = u32;

/// Event channel port number.
pub type EvtchnPort = u32;

/// Machine frame number of a shared page.
pub type Mfn = u64;

/// Reason a domain reported when it shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    Poweroff,
    Reboot,
    Suspend,
    Crash,
    Watchdog,
}

impl ShutdownReason {
    /// Hypervisor ABI value.
    pub fn code(&self) -> u32 {
        match self {
            ShutdownReason::Poweroff => 0,
            ShutdownReason::Reboot => 1,
            ShutdownReason::Suspend => 2,
            ShutdownReason::Crash => 3,
            ShutdownReason::Watchdog => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ShutdownReason::Poweroff),
            1 => Some(ShutdownReason::Reboot),
            2 => Some(ShutdownReason::Suspend),
            3 => Some(ShutdownReason::Crash),
            4 => Some(ShutdownReason::Watchdog),
            _ => None,
        }
    }
}

bitflags! {
    /// Domain state flags as reported by a domain info query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DomainFlags: u32 {
        const DYING = 1 << 0;
        const HVM_GUEST = 1 << 1;
        const SHUTDOWN = 1 << 2;
        const PAUSED = 1 << 3;
        const BLOCKED = 1 << 4;
        const RUNNING = 1 << 5;
    }
}

/// Snapshot of a domain as the hypervisor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub domid: DomId,
    pub uuid: Uuid,
    pub flags: DomainFlags,
    /// Only meaningful while [`DomainFlags::SHUTDOWN`] is set.
    pub shutdown_reason: Option<ShutdownReason>,
}

impl DomainInfo {
    pub fn is_hvm(&self) -> bool {
        self.flags.contains(DomainFlags::HVM_GUEST)
    }

    pub fn is_shutdown(&self) -> bool {
        self.flags.contains(DomainFlags::SHUTDOWN)
    }

    /// Shutdown reason, absent while the domain is running.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        if self.is_shutdown() {
            self.shutdown_reason
        } else {
            None
        }
    }
}

/// TSC virtualization mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TscMode {
    #[default]
    Default,
    AlwaysEmulate,
    NeverEmulate,
    Pvrdtscp,
}

impl TscMode {
    pub fn code(&self) -> u32 {
        match self {
            TscMode::Default => 0,
            TscMode::AlwaysEmulate => 1,
            TscMode::NeverEmulate => 2,
            TscMode::Pvrdtscp => 3,
        }
    }
}

/// HVM parameters the core reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvmParam {
    CallbackIrq,
    StorePfn,
    StoreEvtchn,
    PaeEnabled,
    Viridian,
    TimerMode,
    HpetEnabled,
    AcpiSState,
    VptAlign,
}

impl HvmParam {
    /// Hypervisor ABI index.
    pub fn index(&self) -> u32 {
        match self {
            HvmParam::CallbackIrq => 0,
            HvmParam::StorePfn => 1,
            HvmParam::StoreEvtchn => 2,
            HvmParam::PaeEnabled => 4,
            HvmParam::Viridian => 9,
            HvmParam::TimerMode => 10,
            HvmParam::HpetEnabled => 11,
            HvmParam::AcpiSState => 14,
            HvmParam::VptAlign => 16,
        }
    }
}

bitflags! {
    /// Flags passed to the domain-save hypercall.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SaveFlags: u32 {
        const LIVE = 1 << 0;
        const DEBUG = 1 << 1;
        const HVM = 1 << 2;
    }
}

impl SaveFlags {
    /// Compose the flag set; each flag is independent of the others.
    pub fn compose(live: bool, debug: bool, hvm: bool) -> Self {
        let mut flags = SaveFlags::empty();
        flags.set(SaveFlags::LIVE, live);
        flags.set(SaveFlags::DEBUG, debug);
        flags.set(SaveFlags::HVM, hvm);
        flags
    }
}

/// Shared ring frames produced by an image build or restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageFrames {
    pub store_mfn: Mfn,
    pub console_mfn: Mfn,
}

/// Inputs to the PV guest image builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvImageParams {
    pub mem_mb: u64,
    pub kernel: String,
    pub ramdisk: Option<String>,
    pub flags: u32,
    pub store_port: EvtchnPort,
    pub console_port: EvtchnPort,
}

/// Inputs to the HVM image builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvmImageParams {
    pub max_mem_mb: u64,
    pub target_mem_mb: u64,
    pub firmware: String,
}

/// Inputs to a state restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreParams {
    pub store_port: EvtchnPort,
    pub console_port: EvtchnPort,
    pub hvm: bool,
    pub pae: bool,
}

/// Callbacks the save hypercall invokes while it captures state.
pub trait SaveCallbacks {
    /// Quiesce the guest. Returns `true` when capture may proceed.
    fn suspend(&mut self) -> bool;

    /// Toggle the device model's log-dirty tracking.
    fn switch_logdirty(&mut self, domid: DomId, enable: bool);
}

/// Allocated PV image handle. Released when dropped.
pub trait PvImage {
    fn linux_build(&mut self, domid: DomId, params: &PvImageParams) -> XenliteResult<ImageFrames>;
}

/// Privileged hypervisor operations.
pub trait Hypervisor: Send + Sync {
    fn set_max_vcpus(&self, domid: DomId, max: u32) -> XenliteResult<()>;

    fn set_max_mem(&self, domid: DomId, kb: u64) -> XenliteResult<()>;

    fn set_memmap_limit(&self, domid: DomId, kb: u64) -> XenliteResult<()>;

    fn set_tsc_mode(&self, domid: DomId, mode: TscMode) -> XenliteResult<()>;

    /// Allocate the shadow page-table pool, in megabytes.
    fn shadow_set_allocation(&self, domid: DomId, mb: u64) -> XenliteResult<()>;

    /// Allocate an unbound event channel in `domid` for `remote` to bind.
    fn evtchn_alloc_unbound(&self, domid: DomId, remote: DomId) -> XenliteResult<EvtchnPort>;

    fn domain_info(&self, domid: DomId) -> XenliteResult<DomainInfo>;

    /// Allocate a PV image for the given command line and feature string.
    fn pv_image_allocate(&self, cmdline: &str, features: &str) -> XenliteResult<Box<dyn PvImage>>;

    fn hvm_build(&self, domid: DomId, params: &HvmImageParams) -> XenliteResult<()>;

    fn get_hvm_param(&self, domid: DomId, param: HvmParam) -> XenliteResult<u64>;

    fn set_hvm_param(&self, domid: DomId, param: HvmParam, value: u64) -> XenliteResult<()>;

    /// Stream the domain's state into `sink`.
    ///
    /// `callbacks.suspend()` is invoked before the final capture; a `false`
    /// return must fail the save.
    fn domain_save(
        &self,
        domid: DomId,
        sink: &mut dyn Write,
        flags: SaveFlags,
        callbacks: &mut dyn SaveCallbacks,
    ) -> XenliteResult<()>;

    fn domain_restore(
        &self,
        domid: DomId,
        source: &mut dyn Read,
        params: RestoreParams,
    ) -> XenliteResult<ImageFrames>;

    /// Apply the CPUID feature policy. Only valid on x86 hosts.
    fn apply_cpuid_policy(&self, domid: DomId) -> XenliteResult<()>;

    fn domain_shutdown(&self, domid: DomId, reason: ShutdownReason) -> XenliteResult<()>;

    /// Open a handle to the event channel subsystem.
    fn open_event_channel(&self) -> XenliteResult<Box<dyn EventChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_flags_are_independent() {
        assert_eq!(SaveFlags::compose(false, false, false), SaveFlags::empty());
        assert_eq!(SaveFlags::compose(true, false, false), SaveFlags::LIVE);
        assert_eq!(
            SaveFlags::compose(false, true, true),
            SaveFlags::DEBUG | SaveFlags::HVM
        );
        assert_eq!(SaveFlags::compose(true, true, true), SaveFlags::all());
    }

    #[test]
    fn test_shutdown_reason_codes() {
        for reason in [
            ShutdownReason::Poweroff,
            ShutdownReason::Reboot,
            ShutdownReason::Suspend,
            ShutdownReason::Crash,
            ShutdownReason::Watchdog,
        ] {
            assert_eq!(ShutdownReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(ShutdownReason::from_code(99), None);
    }

    #[test]
    fn test_shutdown_reason_requires_flag() {
        let mut info = DomainInfo {
            domid: 3,
            uuid: Uuid::nil(),
            flags: DomainFlags::RUNNING,
            shutdown_reason: Some(ShutdownReason::Suspend),
        };
        assert_eq!(info.shutdown_reason(), None);

        info.flags = DomainFlags::SHUTDOWN;
        assert_eq!(info.shutdown_reason(), Some(ShutdownReason::Suspend));
    }
}
