//! Domain build orchestration.
//!
//! ## Sequence
//!
//! ```text
//! build_pre ──→ build_pv | build_hvm ──→ build_post
//!  (sizing,       (image construction,     (cpuid policy, store
//!   event           ring frames)             publication, introduce)
//!   channels)
//! ```
//!
//! Each step fails independently and nothing is rolled back: a failed build
//! leaves a partially configured domain for the caller to destroy.

use std::io::Read;

use crate::domain::retry::retry_on_conflict;
use crate::domain::types::{BuildInfo, BuildState, ExtraEntries};
use crate::hypervisor::{DomId, HvmImageParams, HvmParam, PvImageParams, RestoreParams};
use crate::runtime::XenliteContext;
use crate::runtime::constants::{control, memory, store as keys};
use crate::xenstore::{Transaction, XBT_NULL, join};
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Remote end of the store and console channels.
const BACKEND_DOMID: DomId = 0;

/// Wrap a failure of a sizing/allocation step as a hypervisor error.
fn sizing(op: &'static str) -> impl FnOnce(XenliteError) -> XenliteError {
    move |err| {
        let msg = match err {
            XenliteError::Hypervisor(msg) => msg,
            other => other.to_string(),
        };
        XenliteError::Hypervisor(format!("{op}: {msg}"))
    }
}

/// Wrap a failure of an image construction step.
fn image_build(op: &'static str) -> impl FnOnce(XenliteError) -> XenliteError {
    move |err| {
        let msg = match err {
            XenliteError::ImageBuild(msg) => msg,
            other => other.to_string(),
        };
        XenliteError::ImageBuild(format!("{op}: {msg}"))
    }
}

/// Add two KiB quantities, rejecting sums that do not fit.
fn memory_sum(domid: DomId, what: &str, base: u64, extra: u64) -> XenliteResult<u64> {
    base.checked_add(extra).ok_or_else(|| {
        XenliteError::InvalidArgument(format!(
            "domain {domid}: {what} of {base} + {extra} KiB overflows"
        ))
    })
}

/// Size the domain's resources and allocate its store/console channels.
///
/// Must run before any image is built.
pub fn build_pre(ctx: &XenliteContext, domid: DomId, info: &BuildInfo) -> XenliteResult<BuildState> {
    let hv = ctx.hypervisor();

    let max_mem = memory_sum(domid, "max memory", info.target_memkb, memory::MAXMEM_CONSTANT_KB)?;
    let memmap_limit = match info.pv() {
        Some(pv) => memory_sum(domid, "memmap limit", info.max_memkb, pv.slack_memkb)?,
        None => info.max_memkb,
    };

    hv.set_max_vcpus(domid, info.max_vcpus)
        .map_err(sizing("set max vcpus"))?;
    hv.set_max_mem(domid, max_mem)
        .map_err(sizing("set max memory"))?;
    hv.set_memmap_limit(domid, memmap_limit)
        .map_err(sizing("set memmap limit"))?;
    hv.set_tsc_mode(domid, info.tsc_mode)
        .map_err(sizing("set tsc mode"))?;

    if let Some(hvm) = info.hvm() {
        let shadow_mb = hvm.shadow_memkb.div_ceil(1024);
        hv.shadow_set_allocation(domid, shadow_mb)
            .map_err(sizing("shadow allocation"))?;
    }

    let state = BuildState {
        store_port: hv
            .evtchn_alloc_unbound(domid, BACKEND_DOMID)
            .map_err(sizing("allocate store event channel"))?,
        console_port: hv
            .evtchn_alloc_unbound(domid, BACKEND_DOMID)
            .map_err(sizing("allocate console event channel"))?,
        ..BuildState::default()
    };

    tracing::debug!(
        domid,
        guest = %info.guest_type(),
        store_port = state.store_port,
        console_port = state.console_port,
        "domain resources sized"
    );
    Ok(state)
}

/// Build a PV guest image and record its ring frames.
pub fn build_pv(
    ctx: &XenliteContext,
    domid: DomId,
    info: &BuildInfo,
    state: &mut BuildState,
) -> XenliteResult<()> {
    let pv = info.pv().ok_or_else(|| {
        XenliteError::InvalidArgument(format!("domain {domid}: build_pv on a non-PV build"))
    })?;

    let mut image = ctx
        .hypervisor()
        .pv_image_allocate(&pv.cmdline, &pv.features)
        .map_err(|e| {
            tracing::error!(domid, error = %e, "pv image allocation failed");
            sizing("pv image allocate")(e)
        })?;

    let params = PvImageParams {
        mem_mb: info.target_memkb / 1024,
        kernel: info.kernel.clone(),
        ramdisk: pv.ramdisk.clone(),
        flags: 0,
        store_port: state.store_port,
        console_port: state.console_port,
    };
    let frames = image.linux_build(domid, &params).map_err(|e| {
        tracing::error!(domid, error = %e, "pv linux build failed");
        image_build("linux build")(e)
    })?;

    state.store_mfn = frames.store_mfn;
    state.console_mfn = frames.console_mfn;
    tracing::debug!(domid, store_mfn = state.store_mfn, console_mfn = state.console_mfn, "pv image built");
    Ok(())
}

/// Build an HVM guest image and apply its platform parameters.
pub fn build_hvm(
    ctx: &XenliteContext,
    domid: DomId,
    info: &BuildInfo,
    state: &mut BuildState,
) -> XenliteResult<()> {
    let hvm = info.hvm().ok_or_else(|| {
        XenliteError::InvalidArgument(format!("domain {domid}: build_hvm on a non-HVM build"))
    })?;
    let (Some(max_kb), Some(target_kb)) = (
        info.max_memkb.checked_sub(info.video_memkb),
        info.target_memkb.checked_sub(info.video_memkb),
    ) else {
        return Err(XenliteError::InvalidArgument(format!(
            "domain {domid}: video memory {} KiB exceeds guest memory",
            info.video_memkb
        )));
    };

    let firmware = ctx.layout().firmware_path(&info.kernel);
    let params = HvmImageParams {
        max_mem_mb: max_kb / 1024,
        target_mem_mb: target_kb / 1024,
        firmware: firmware.to_string_lossy().into_owned(),
    };

    let hv = ctx.hypervisor();
    hv.hvm_build(domid, &params).map_err(|e| {
        tracing::error!(domid, error = %e, "hvm building failed");
        image_build("hvm build")(e)
    })?;

    let set_params = || -> XenliteResult<u64> {
        hv.set_hvm_param(domid, HvmParam::PaeEnabled, hvm.pae as u64)?;
        hv.set_hvm_param(domid, HvmParam::Viridian, hvm.viridian as u64)?;
        hv.set_hvm_param(domid, HvmParam::TimerMode, u64::from(hvm.timer_mode))?;
        hv.set_hvm_param(domid, HvmParam::HpetEnabled, hvm.hpet as u64)?;
        hv.set_hvm_param(domid, HvmParam::VptAlign, hvm.vpt_align as u64)?;
        hv.set_hvm_param(domid, HvmParam::StoreEvtchn, u64::from(state.store_port))?;
        hv.get_hvm_param(domid, HvmParam::StorePfn)
    };
    let store_pfn = set_params().map_err(|e| {
        tracing::error!(domid, error = %e, "hvm build set params failed");
        image_build("hvm set params")(e)
    })?;

    state.store_mfn = store_pfn;
    tracing::debug!(domid, firmware = %params.firmware, store_mfn = store_pfn, "hvm image built");
    Ok(())
}

/// Per-vcpu availability entries.
///
/// vcpu 0 is always online; vcpu `i` is online iff bit `i` of `cur_vcpus`
/// is set.
pub fn vcpu_availability(max_vcpus: u32, cur_vcpus: u64) -> Vec<(String, String)> {
    (0..max_vcpus)
        .map(|i| {
            let online = i == 0 || cur_vcpus.checked_shr(i).is_some_and(|m| m & 1 == 1);
            let state = if online { control::ONLINE } else { control::OFFLINE };
            (keys::cpu_availability(i), state.to_string())
        })
        .collect()
}

/// Entries published under the domain path by [`build_post`].
pub fn publication_entries(domid: DomId, info: &BuildInfo, state: &BuildState) -> Vec<(String, String)> {
    let mut entries = vec![
        (keys::MEMORY_STATIC_MAX.to_string(), info.max_memkb.to_string()),
        (keys::MEMORY_TARGET.to_string(), info.target_memkb.to_string()),
        (keys::MEMORY_VIDEORAM.to_string(), info.video_memkb.to_string()),
        (keys::DOMID.to_string(), domid.to_string()),
        (keys::STORE_PORT.to_string(), state.store_port.to_string()),
        (keys::STORE_RING_REF.to_string(), state.store_mfn.to_string()),
    ];
    entries.extend(vcpu_availability(info.max_vcpus, info.cur_vcpus));
    entries
}

/// Publish the built domain into the config store and introduce its ring.
///
/// The domain entries and both caller-supplied lists are written in one
/// transaction. A commit that loses a concurrent-modification race is
/// restarted from scratch according to the context's retry policy.
pub fn build_post(
    ctx: &XenliteContext,
    domid: DomId,
    info: &BuildInfo,
    state: &BuildState,
    extra: &ExtraEntries,
) -> XenliteResult<()> {
    if ctx.capabilities().cpuid_policy {
        ctx.hypervisor()
            .apply_cpuid_policy(domid)
            .map_err(sizing("apply cpuid policy"))?;
    }

    let store = ctx.store();
    let dom_path = store.get_domain_path(domid)?;
    let vm_path = store.read(XBT_NULL, &join(&dom_path, keys::VM))?;
    if vm_path.is_none() && !extra.vm.is_empty() {
        return Err(XenliteError::NotFound(format!(
            "domain {domid}: no vm path under {dom_path}"
        )));
    }

    retry_on_conflict(&ctx.options().transaction_retry, |attempt| {
        let entries = publication_entries(domid, info, state);
        let tx = Transaction::start(store)?;
        tracing::trace!(domid, attempt, tx = tx.id(), "publishing build");
        tx.writev(&dom_path, &entries)?;
        tx.writev(&dom_path, &extra.local)?;
        if let Some(vm_path) = &vm_path {
            tx.writev(vm_path, &extra.vm)?;
        }
        tx.commit()
    })?;

    store.introduce_domain(domid, state.store_mfn, state.store_port)?;
    tracing::info!(domid, dom_path = %dom_path, "domain build published");
    Ok(())
}

/// Size, build and publish a domain in one go.
pub fn build_domain(
    ctx: &XenliteContext,
    domid: DomId,
    info: &BuildInfo,
    extra: &ExtraEntries,
) -> XenliteResult<BuildState> {
    info.validate()?;
    let mut state = build_pre(ctx, domid, info)?;
    if info.is_hvm() {
        build_hvm(ctx, domid, info, &mut state)?;
    } else {
        build_pv(ctx, domid, info, &mut state)?;
    }
    build_post(ctx, domid, info, &state, extra)?;
    Ok(state)
}

/// Restore a domain's state from `source` into ports allocated by
/// [`build_pre`], filling in the ring frames.
pub fn restore_common(
    ctx: &XenliteContext,
    domid: DomId,
    info: &BuildInfo,
    state: &mut BuildState,
    source: &mut dyn Read,
) -> XenliteResult<()> {
    let params = RestoreParams {
        store_port: state.store_port,
        console_port: state.console_port,
        hvm: info.is_hvm(),
        pae: info.hvm().is_some_and(|h| h.pae),
    };
    let frames = ctx.hypervisor().domain_restore(domid, source, params)?;
    state.store_mfn = frames.store_mfn;
    state.console_mfn = frames.console_mfn;
    tracing::debug!(domid, store_mfn = state.store_mfn, "domain state restored");
    Ok(())
}
