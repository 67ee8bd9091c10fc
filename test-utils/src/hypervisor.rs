//! Scriptable hypervisor and event channel fakes.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;
use xenlite::hypervisor::{
    DomId, DomainFlags, DomainInfo, EventChannel, EvtchnPort, HvmImageParams, HvmParam,
    Hypervisor, ImageFrames, PvImage, PvImageParams, RestoreParams, SaveCallbacks, SaveFlags,
    ShutdownReason, TscMode,
};
use xenlite_shared::{XenliteError, XenliteResult};

/// A hypervisor operation as the fake saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HvCall {
    SetMaxVcpus { domid: DomId, max: u32 },
    SetMaxMem { domid: DomId, kb: u64 },
    SetMemmapLimit { domid: DomId, kb: u64 },
    SetTscMode { domid: DomId, mode: TscMode },
    ShadowAllocation { domid: DomId, mb: u64 },
    EvtchnAllocUnbound { domid: DomId, remote: DomId },
    PvImageAllocate { cmdline: String, features: String },
    LinuxBuild { domid: DomId, params: PvImageParams },
    HvmBuild { domid: DomId, params: HvmImageParams },
    SetHvmParam { domid: DomId, param: HvmParam, value: u64 },
    DomainSave { domid: DomId, flags: SaveFlags },
    DomainRestore { domid: DomId, params: RestoreParams },
    ApplyCpuidPolicy { domid: DomId },
    DomainShutdown { domid: DomId, reason: ShutdownReason },
}

/// Operation names accepted by [`FakeHypervisor::fail_on`].
pub mod ops {
    pub const SET_MAX_VCPUS: &str = "set_max_vcpus";
    pub const SET_MAX_MEM: &str = "set_max_mem";
    pub const EVTCHN_ALLOC: &str = "evtchn_alloc_unbound";
    pub const PV_IMAGE_ALLOCATE: &str = "pv_image_allocate";
    pub const LINUX_BUILD: &str = "linux_build";
    pub const HVM_BUILD: &str = "hvm_build";
    pub const SET_HVM_PARAM: &str = "set_hvm_param";
    pub const DOMAIN_SAVE: &str = "domain_save";
    pub const OPEN_EVENT_CHANNEL: &str = "open_event_channel";
}

/// What the event channel fake did, shared with every handle it opened.
#[derive(Debug, Default)]
pub struct EvtchnLog {
    pub opened: u32,
    pub binds: Vec<(DomId, EvtchnPort)>,
    pub notifies: Vec<EvtchnPort>,
    pub awaits: Vec<EvtchnPort>,
    pub released: Vec<EvtchnPort>,
    pub closed: u32,
    pub fail_bind: bool,
    pub fail_notify: bool,
    pub fail_await: bool,
}

/// Local port handed out by a successful bind.
pub const LOCAL_SUSPEND_PORT: EvtchnPort = 42;

#[derive(Default)]
struct HvState {
    calls: Vec<HvCall>,
    next_port: EvtchnPort,
    domains: HashMap<DomId, DomainInfo>,
    suspend_after: HashMap<DomId, u32>,
    info_queries: HashMap<DomId, u32>,
    hvm_params: HashMap<(DomId, HvmParam), u64>,
    failing: HashSet<&'static str>,
    frames: ImageFrames,
    save_payload: Vec<u8>,
    suspend_results: Vec<bool>,
}

/// Hypervisor kept in memory. Records every call and fails on demand.
pub struct FakeHypervisor {
    state: Arc<Mutex<HvState>>,
    evtchn: Arc<Mutex<EvtchnLog>>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let state = HvState {
            next_port: 1,
            frames: ImageFrames {
                store_mfn: 0xfeff0,
                console_mfn: 0xfeff1,
            },
            save_payload: b"LinuxGuestRecord".to_vec(),
            ..HvState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            evtchn: Arc::new(Mutex::new(EvtchnLog::default())),
        }
    }

    /// Register a running domain with a random UUID.
    pub fn add_domain(&self, domid: DomId, hvm: bool) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut flags = DomainFlags::RUNNING;
        flags.set(DomainFlags::HVM_GUEST, hvm);
        self.state.lock().domains.insert(
            domid,
            DomainInfo {
                domid,
                uuid,
                flags,
                shutdown_reason: None,
            },
        );
        uuid
    }

    /// Report a suspend shutdown from the `n`th domain info query on.
    pub fn suspend_after(&self, domid: DomId, n: u32) {
        self.state.lock().suspend_after.insert(domid, n);
    }

    pub fn info_queries(&self, domid: DomId) -> u32 {
        self.state.lock().info_queries.get(&domid).copied().unwrap_or(0)
    }

    pub fn set_hvm_param_value(&self, domid: DomId, param: HvmParam, value: u64) {
        self.state.lock().hvm_params.insert((domid, param), value);
    }

    pub fn hvm_param_value(&self, domid: DomId, param: HvmParam) -> Option<u64> {
        self.state.lock().hvm_params.get(&(domid, param)).copied()
    }

    /// Make the named operation (see [`ops`]) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn set_frames(&self, frames: ImageFrames) {
        self.state.lock().frames = frames;
    }

    /// Bytes written to the sink by a successful save.
    pub fn set_save_payload(&self, payload: &[u8]) {
        self.state.lock().save_payload = payload.to_vec();
    }

    pub fn calls(&self) -> Vec<HvCall> {
        self.state.lock().calls.clone()
    }

    /// Return values of every `suspend()` callback the save invoked.
    pub fn suspend_results(&self) -> Vec<bool> {
        self.state.lock().suspend_results.clone()
    }

    /// Event channel activity across all opened handles.
    pub fn evtchn(&self) -> Arc<Mutex<EvtchnLog>> {
        self.evtchn.clone()
    }

    fn record(&self, op: &'static str, call: HvCall) -> XenliteResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(op) {
            return Err(XenliteError::Hypervisor(format!("{op} failed")));
        }
        Ok(())
    }

    fn check(&self, op: &'static str) -> XenliteResult<()> {
        if self.state.lock().failing.contains(op) {
            return Err(XenliteError::Hypervisor(format!("{op} failed")));
        }
        Ok(())
    }
}

struct FakePvImage {
    state: Arc<Mutex<HvState>>,
}

impl PvImage for FakePvImage {
    fn linux_build(&mut self, domid: DomId, params: &PvImageParams) -> XenliteResult<ImageFrames> {
        let mut state = self.state.lock();
        state.calls.push(HvCall::LinuxBuild {
            domid,
            params: params.clone(),
        });
        if state.failing.contains(ops::LINUX_BUILD) {
            return Err(XenliteError::ImageBuild("kernel rejected".into()));
        }
        Ok(state.frames)
    }
}

impl Hypervisor for FakeHypervisor {
    fn set_max_vcpus(&self, domid: DomId, max: u32) -> XenliteResult<()> {
        self.record(ops::SET_MAX_VCPUS, HvCall::SetMaxVcpus { domid, max })
    }

    fn set_max_mem(&self, domid: DomId, kb: u64) -> XenliteResult<()> {
        self.record(ops::SET_MAX_MEM, HvCall::SetMaxMem { domid, kb })
    }

    fn set_memmap_limit(&self, domid: DomId, kb: u64) -> XenliteResult<()> {
        self.record("set_memmap_limit", HvCall::SetMemmapLimit { domid, kb })
    }

    fn set_tsc_mode(&self, domid: DomId, mode: TscMode) -> XenliteResult<()> {
        self.record("set_tsc_mode", HvCall::SetTscMode { domid, mode })
    }

    fn shadow_set_allocation(&self, domid: DomId, mb: u64) -> XenliteResult<()> {
        self.record("shadow_set_allocation", HvCall::ShadowAllocation { domid, mb })
    }

    fn evtchn_alloc_unbound(&self, domid: DomId, remote: DomId) -> XenliteResult<EvtchnPort> {
        self.record(ops::EVTCHN_ALLOC, HvCall::EvtchnAllocUnbound { domid, remote })?;
        let mut state = self.state.lock();
        let port = state.next_port;
        state.next_port += 1;
        Ok(port)
    }

    fn domain_info(&self, domid: DomId) -> XenliteResult<DomainInfo> {
        let mut state = self.state.lock();
        let queries = {
            let q = state.info_queries.entry(domid).or_insert(0);
            *q += 1;
            *q
        };
        let suspended = state.suspend_after.get(&domid).is_some_and(|&n| queries >= n);
        let mut info = state
            .domains
            .get(&domid)
            .cloned()
            .ok_or_else(|| XenliteError::NotFound(format!("domain {domid}")))?;
        if suspended {
            info.flags.insert(DomainFlags::SHUTDOWN);
            info.flags.remove(DomainFlags::RUNNING);
            info.shutdown_reason = Some(ShutdownReason::Suspend);
        }
        Ok(info)
    }

    fn pv_image_allocate(&self, cmdline: &str, features: &str) -> XenliteResult<Box<dyn PvImage>> {
        self.record(
            ops::PV_IMAGE_ALLOCATE,
            HvCall::PvImageAllocate {
                cmdline: cmdline.to_string(),
                features: features.to_string(),
            },
        )?;
        Ok(Box::new(FakePvImage {
            state: self.state.clone(),
        }))
    }

    fn hvm_build(&self, domid: DomId, params: &HvmImageParams) -> XenliteResult<()> {
        self.record(
            ops::HVM_BUILD,
            HvCall::HvmBuild {
                domid,
                params: params.clone(),
            },
        )
        .map_err(|_| XenliteError::ImageBuild("firmware load failed".into()))?;
        let store_pfn = self.state.lock().frames.store_mfn;
        self.set_hvm_param_value(domid, HvmParam::StorePfn, store_pfn);
        Ok(())
    }

    fn get_hvm_param(&self, domid: DomId, param: HvmParam) -> XenliteResult<u64> {
        Ok(self.hvm_param_value(domid, param).unwrap_or(0))
    }

    fn set_hvm_param(&self, domid: DomId, param: HvmParam, value: u64) -> XenliteResult<()> {
        self.record(ops::SET_HVM_PARAM, HvCall::SetHvmParam { domid, param, value })?;
        self.set_hvm_param_value(domid, param, value);
        Ok(())
    }

    fn domain_save(
        &self,
        domid: DomId,
        sink: &mut dyn Write,
        flags: SaveFlags,
        callbacks: &mut dyn SaveCallbacks,
    ) -> XenliteResult<()> {
        self.record(ops::DOMAIN_SAVE, HvCall::DomainSave { domid, flags })?;

        let live = flags.contains(SaveFlags::LIVE);
        if live {
            callbacks.switch_logdirty(domid, true);
        }
        let suspended = callbacks.suspend();
        self.state.lock().suspend_results.push(suspended);
        if live {
            callbacks.switch_logdirty(domid, false);
        }
        if !suspended {
            return Err(XenliteError::Hypervisor(format!(
                "domain {domid}: suspend callback failed"
            )));
        }

        let payload = self.state.lock().save_payload.clone();
        sink.write_all(&payload)
            .map_err(|e| XenliteError::io("save stream", e))
    }

    fn domain_restore(
        &self,
        domid: DomId,
        source: &mut dyn Read,
        params: RestoreParams,
    ) -> XenliteResult<ImageFrames> {
        self.record("domain_restore", HvCall::DomainRestore { domid, params })?;
        let mut stream = Vec::new();
        source
            .read_to_end(&mut stream)
            .map_err(|e| XenliteError::io("restore stream", e))?;
        if stream.is_empty() {
            return Err(XenliteError::Hypervisor("empty restore stream".into()));
        }
        Ok(self.state.lock().frames)
    }

    fn apply_cpuid_policy(&self, domid: DomId) -> XenliteResult<()> {
        self.record("apply_cpuid_policy", HvCall::ApplyCpuidPolicy { domid })
    }

    fn domain_shutdown(&self, domid: DomId, reason: ShutdownReason) -> XenliteResult<()> {
        self.record("domain_shutdown", HvCall::DomainShutdown { domid, reason })
    }

    fn open_event_channel(&self) -> XenliteResult<Box<dyn EventChannel>> {
        self.check(ops::OPEN_EVENT_CHANNEL)?;
        self.evtchn.lock().opened += 1;
        Ok(Box::new(FakeEventChannel {
            log: self.evtchn.clone(),
        }))
    }
}

/// Event channel handle backed by a shared [`EvtchnLog`].
pub struct FakeEventChannel {
    log: Arc<Mutex<EvtchnLog>>,
}

impl EventChannel for FakeEventChannel {
    fn bind_suspend(&mut self, domid: DomId, remote_port: EvtchnPort) -> XenliteResult<EvtchnPort> {
        let mut log = self.log.lock();
        log.binds.push((domid, remote_port));
        if log.fail_bind {
            return Err(XenliteError::Hypervisor("bind refused".into()));
        }
        Ok(LOCAL_SUSPEND_PORT)
    }

    fn notify(&mut self, local_port: EvtchnPort) -> XenliteResult<()> {
        let mut log = self.log.lock();
        log.notifies.push(local_port);
        if log.fail_notify {
            return Err(XenliteError::Hypervisor("notify failed".into()));
        }
        Ok(())
    }

    fn await_suspend(&mut self, local_port: EvtchnPort) -> XenliteResult<()> {
        let mut log = self.log.lock();
        log.awaits.push(local_port);
        if log.fail_await {
            return Err(XenliteError::Hypervisor("no suspend ack".into()));
        }
        Ok(())
    }

    fn release_suspend(&mut self, local_port: EvtchnPort) {
        self.log.lock().released.push(local_port);
    }

    fn close(&mut self) {
        self.log.lock().closed += 1;
    }
}
