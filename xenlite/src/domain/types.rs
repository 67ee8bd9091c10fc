//! Build configuration and build output types.

use std::fmt;

use crate::hypervisor::{EvtchnPort, Mfn, TscMode};
use serde::{Deserialize, Serialize};
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Guest virtualization type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Hvm,
    Pv,
}

impl GuestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestType::Hvm => "hvm",
            GuestType::Pv => "pv",
        }
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HVM-only build settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HvmBuildInfo {
    /// Shadow page-table pool, in KiB. Rounded up to whole MiB when applied.
    #[serde(default)]
    pub shadow_memkb: u64,
    #[serde(default)]
    pub pae: bool,
    #[serde(default)]
    pub viridian: bool,
    #[serde(default)]
    pub hpet: bool,
    #[serde(default)]
    pub vpt_align: bool,
    #[serde(default)]
    pub timer_mode: u32,
}

/// PV-only build settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvBuildInfo {
    /// Extra memmap headroom on top of max memory, in KiB.
    #[serde(default)]
    pub slack_memkb: u64,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default)]
    pub ramdisk: Option<String>,
    #[serde(default)]
    pub features: String,
}

/// Guest-type-specific part of [`BuildInfo`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuestBuildInfo {
    Hvm(HvmBuildInfo),
    Pv(PvBuildInfo),
}

/// Immutable configuration for one domain build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub max_vcpus: u32,
    /// Bitmask of vcpus initially online. vcpu 0 is always online.
    #[serde(default)]
    pub cur_vcpus: u64,
    pub max_memkb: u64,
    pub target_memkb: u64,
    #[serde(default)]
    pub video_memkb: u64,
    #[serde(default)]
    pub tsc_mode: TscMode,
    /// PV kernel image, or HVM firmware (relative to the firmware dir).
    pub kernel: String,
    pub guest: GuestBuildInfo,
}

impl BuildInfo {
    pub fn guest_type(&self) -> GuestType {
        match self.guest {
            GuestBuildInfo::Hvm(_) => GuestType::Hvm,
            GuestBuildInfo::Pv(_) => GuestType::Pv,
        }
    }

    pub fn is_hvm(&self) -> bool {
        self.guest_type() == GuestType::Hvm
    }

    pub fn hvm(&self) -> Option<&HvmBuildInfo> {
        match &self.guest {
            GuestBuildInfo::Hvm(hvm) => Some(hvm),
            GuestBuildInfo::Pv(_) => None,
        }
    }

    pub fn pv(&self) -> Option<&PvBuildInfo> {
        match &self.guest {
            GuestBuildInfo::Pv(pv) => Some(pv),
            GuestBuildInfo::Hvm(_) => None,
        }
    }

    /// Parse a build description from JSON.
    pub fn from_json(json: &str) -> XenliteResult<Self> {
        let info: BuildInfo = serde_json::from_str(json)?;
        info.validate()?;
        Ok(info)
    }

    /// Reject configurations the build arithmetic cannot handle.
    pub fn validate(&self) -> XenliteResult<()> {
        if self.max_vcpus == 0 {
            return Err(XenliteError::InvalidArgument(
                "max_vcpus must be at least 1".into(),
            ));
        }
        if self.target_memkb > self.max_memkb {
            return Err(XenliteError::InvalidArgument(format!(
                "target memory {} KiB exceeds max memory {} KiB",
                self.target_memkb, self.max_memkb
            )));
        }
        if self.is_hvm() && self.video_memkb > self.target_memkb {
            return Err(XenliteError::InvalidArgument(format!(
                "video memory {} KiB exceeds target memory {} KiB",
                self.video_memkb, self.target_memkb
            )));
        }
        Ok(())
    }
}

/// Mutable output of a build, published into the store at the end.
///
/// Fields are meaningless until the image build (or restore) has run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildState {
    pub store_port: EvtchnPort,
    pub console_port: EvtchnPort,
    pub store_mfn: Mfn,
    pub console_mfn: Mfn,
}

/// Caller-supplied entries written in the same transaction as the build
/// publication.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraEntries {
    /// Relative to the domain's vm path.
    pub vm: Vec<(String, String)>,
    /// Relative to the domain path.
    pub local: Vec<(String, String)>,
}
