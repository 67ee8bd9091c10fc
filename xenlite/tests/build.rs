//! Integration tests for domain build orchestration.
//!
//! Covers the full pre → image → post sequence against the fakes:
//! - resource sizing and channel allocation order
//! - store publication, including retries on transaction conflicts
//! - error codes of sizing versus image-build failures

use xenlite::domain::{
    BuildInfo, BuildState, ExtraEntries, GuestBuildInfo, HvmBuildInfo, RetryPolicy, build_domain,
    build_hvm, build_post, build_pre, build_pv, restore_common,
};
use xenlite::XenliteError;
use xenlite::hypervisor::{HvmParam, ImageFrames, TscMode};
use xenlite_test_utils::{
    HvCall, TestContext, hvm_build_info, ops, pv_build_info,
};

const DOMID: u32 = 7;
const DOM_PATH: &str = "/local/domain/7";
const VM_PATH: &str = "/vm/5a4fd1b6-1111-4222-8333-944455556666";

fn seeded() -> TestContext {
    let t = TestContext::new();
    t.store.set(&format!("{DOM_PATH}/vm"), VM_PATH);
    t
}

fn key(rel: &str) -> String {
    format!("{DOM_PATH}/{rel}")
}

// ============================================================================
// END-TO-END
// ============================================================================

#[test]
fn hvm_build_publishes_memory_and_vcpus() {
    let t = seeded();
    let info = BuildInfo {
        max_vcpus: 2,
        cur_vcpus: 0b01,
        max_memkb: 2097152,
        target_memkb: 1048576,
        video_memkb: 16384,
        tsc_mode: TscMode::Default,
        kernel: "hvmloader".into(),
        guest: GuestBuildInfo::Hvm(HvmBuildInfo::default()),
    };

    let state = build_domain(&t.ctx, DOMID, &info, &ExtraEntries::default()).unwrap();

    assert_eq!(t.store.get(&key("memory/static-max")).as_deref(), Some("2097152"));
    assert_eq!(t.store.get(&key("memory/target")).as_deref(), Some("1048576"));
    assert_eq!(t.store.get(&key("memory/videoram")).as_deref(), Some("16384"));
    assert_eq!(t.store.get(&key("cpu/0/availability")).as_deref(), Some("online"));
    assert_eq!(t.store.get(&key("cpu/1/availability")).as_deref(), Some("offline"));
    assert_eq!(t.store.get(&key("domid")).as_deref(), Some("7"));
    assert_eq!(
        t.store.get(&key("store/port")),
        Some(state.store_port.to_string())
    );
    assert_eq!(
        t.store.get(&key("store/ring-ref")),
        Some(state.store_mfn.to_string())
    );
    assert_eq!(t.store.introduced(), vec![(DOMID, state.store_mfn, state.store_port)]);
    assert_eq!(t.store.commits(), 1);
}

#[test]
fn hvm_build_sizes_and_configures_in_order() {
    let t = seeded();
    let info = hvm_build_info();

    let state = build_domain(&t.ctx, DOMID, &info, &ExtraEntries::default()).unwrap();
    let firmware = t.ctx.layout().firmware_dir().join("hvmloader");

    let calls = t.hv.calls();
    assert_eq!(
        &calls[..8],
        &[
            HvCall::SetMaxVcpus { domid: DOMID, max: 4 },
            HvCall::SetMaxMem { domid: DOMID, kb: 524288 + 1024 },
            HvCall::SetMemmapLimit { domid: DOMID, kb: 524288 },
            HvCall::SetTscMode { domid: DOMID, mode: TscMode::Default },
            HvCall::ShadowAllocation { domid: DOMID, mb: 6 },
            HvCall::EvtchnAllocUnbound { domid: DOMID, remote: 0 },
            HvCall::EvtchnAllocUnbound { domid: DOMID, remote: 0 },
            HvCall::HvmBuild {
                domid: DOMID,
                params: xenlite::hypervisor::HvmImageParams {
                    max_mem_mb: 504,
                    target_mem_mb: 504,
                    firmware: firmware.to_string_lossy().into_owned(),
                },
            },
        ]
    );
    assert!(calls.contains(&HvCall::ApplyCpuidPolicy { domid: DOMID }));

    assert_eq!(t.hv.hvm_param_value(DOMID, HvmParam::PaeEnabled), Some(1));
    assert_eq!(t.hv.hvm_param_value(DOMID, HvmParam::Viridian), Some(0));
    assert_eq!(t.hv.hvm_param_value(DOMID, HvmParam::TimerMode), Some(1));
    assert_eq!(t.hv.hvm_param_value(DOMID, HvmParam::HpetEnabled), Some(1));
    assert_eq!(
        t.hv.hvm_param_value(DOMID, HvmParam::StoreEvtchn),
        Some(u64::from(state.store_port))
    );
    assert_eq!(state.store_mfn, 0xfeff0);

    let states: Vec<String> = (0..4)
        .map(|i| t.store.get(&key(&format!("cpu/{i}/availability"))).unwrap())
        .collect();
    assert_eq!(states, vec!["online", "offline", "online", "offline"]);
}

#[test]
fn pv_build_uses_target_memory_and_slack() {
    let t = seeded();
    let info = pv_build_info();

    let state = build_domain(&t.ctx, DOMID, &info, &ExtraEntries::default()).unwrap();

    let calls = t.hv.calls();
    assert!(calls.contains(&HvCall::SetMemmapLimit { domid: DOMID, kb: 393216 + 8192 }));
    assert!(!calls.iter().any(|c| matches!(c, HvCall::ShadowAllocation { .. })));
    let linux = calls
        .iter()
        .find_map(|c| match c {
            HvCall::LinuxBuild { params, .. } => Some(params.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(linux.mem_mb, 256);
    assert_eq!(linux.kernel, "/boot/vmlinuz-xen");
    assert_eq!(linux.ramdisk.as_deref(), Some("/boot/initrd-xen"));
    assert_eq!(linux.store_port, state.store_port);
    assert_eq!(linux.console_port, state.console_port);
    assert_eq!(state.console_mfn, 0xfeff1);
}

// ============================================================================
// PUBLICATION
// ============================================================================

#[test]
fn conflicting_commits_are_retried_until_one_lands() {
    let t = seeded();
    let info = pv_build_info();
    let state = build_pre(&t.ctx, DOMID, &info).unwrap();
    let extra = ExtraEntries {
        vm: vec![("name".into(), "web01".into())],
        local: vec![("console/type".into(), "xenconsoled".into())],
    };
    t.store.inject_conflicts(3);

    build_post(&t.ctx, DOMID, &info, &state, &extra).unwrap();

    assert_eq!(t.store.conflicts(), 3);
    assert_eq!(t.store.commits(), 1);
    assert_eq!(t.store.open_transactions(), 0);
    assert_eq!(t.store.introduced().len(), 1);

    // The committed state carries all three entry sets.
    assert_eq!(t.store.get(&key("memory/target")).as_deref(), Some("262144"));
    assert_eq!(t.store.get(&format!("{VM_PATH}/name")).as_deref(), Some("web01"));
    assert_eq!(t.store.get(&key("console/type")).as_deref(), Some("xenconsoled"));

    // Every attempt rewrote each set in full.
    assert_eq!(t.store.writes_to(&key("memory/target")).len(), 4);
    assert_eq!(t.store.writes_to(&format!("{VM_PATH}/name")).len(), 4);
    assert_eq!(t.store.writes_to(&key("console/type")).len(), 4);
}

#[test]
fn bounded_retry_gives_up_with_conflict() {
    let t = TestContext::with_options(|o| o.transaction_retry = RetryPolicy::bounded(2));
    t.store.set(&format!("{DOM_PATH}/vm"), VM_PATH);
    let info = pv_build_info();
    let state = build_pre(&t.ctx, DOMID, &info).unwrap();
    t.store.inject_conflicts(5);

    let err = build_post(&t.ctx, DOMID, &info, &state, &ExtraEntries::default()).unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(t.store.commits(), 0);
    assert!(t.store.introduced().is_empty());
}

#[test]
fn extra_entries_land_under_vm_and_domain_paths() {
    let t = seeded();
    let info = pv_build_info();
    let state = build_pre(&t.ctx, DOMID, &info).unwrap();
    let extra = ExtraEntries {
        vm: vec![("name".into(), "web01".into())],
        local: vec![("console/type".into(), "xenconsoled".into())],
    };

    build_post(&t.ctx, DOMID, &info, &state, &extra).unwrap();

    assert_eq!(t.store.get(&format!("{VM_PATH}/name")).as_deref(), Some("web01"));
    assert_eq!(t.store.get(&key("console/type")).as_deref(), Some("xenconsoled"));
}

#[test]
fn missing_vm_path_fails_only_with_vm_entries() {
    let t = TestContext::new();
    let info = pv_build_info();
    let state = build_pre(&t.ctx, DOMID, &info).unwrap();

    build_post(&t.ctx, DOMID, &info, &state, &ExtraEntries::default()).unwrap();

    let extra = ExtraEntries {
        vm: vec![("name".into(), "web01".into())],
        local: vec![],
    };
    let err = build_post(&t.ctx, DOMID, &info, &state, &extra).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn cpuid_policy_skipped_when_unsupported() {
    let t = TestContext::with_options(|o| o.cpuid_policy = Some(false));
    let info = pv_build_info();

    build_domain(&t.ctx, DOMID, &info, &ExtraEntries::default()).unwrap();

    assert!(!t.hv.calls().contains(&HvCall::ApplyCpuidPolicy { domid: DOMID }));
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn pv_allocation_failure_is_code_minus_one() {
    let t = seeded();
    let info = pv_build_info();
    let mut state = build_pre(&t.ctx, DOMID, &info).unwrap();
    t.hv.fail_on(ops::PV_IMAGE_ALLOCATE);

    let err = build_pv(&t.ctx, DOMID, &info, &mut state).unwrap_err();
    assert_eq!(err.code(), -1);
}

#[test]
fn pv_linux_build_failure_is_code_minus_two() {
    let t = seeded();
    let info = pv_build_info();
    let mut state = build_pre(&t.ctx, DOMID, &info).unwrap();
    t.hv.fail_on(ops::LINUX_BUILD);

    let err = build_pv(&t.ctx, DOMID, &info, &mut state).unwrap_err();
    assert_eq!(err.code(), -2);
    assert_eq!(state.store_mfn, 0);
}

#[test]
fn hvm_param_failure_is_an_image_build_error() {
    let t = seeded();
    let info = hvm_build_info();
    let mut state = build_pre(&t.ctx, DOMID, &info).unwrap();
    t.hv.fail_on(ops::SET_HVM_PARAM);

    let err = build_hvm(&t.ctx, DOMID, &info, &mut state).unwrap_err();
    assert_eq!(err.code(), -2);
}

#[test]
fn sizing_failure_stops_the_build() {
    let t = seeded();
    t.hv.fail_on(ops::SET_MAX_MEM);

    let err = build_domain(&t.ctx, DOMID, &pv_build_info(), &ExtraEntries::default()).unwrap_err();

    assert_eq!(err.code(), -1);
    assert!(!t.hv.calls().iter().any(|c| matches!(c, HvCall::EvtchnAllocUnbound { .. })));
    assert_eq!(t.store.commits(), 0);
}

#[test]
fn invalid_build_info_is_rejected_before_sizing() {
    let t = seeded();
    let mut info = pv_build_info();
    info.target_memkb = info.max_memkb + 1;

    assert!(build_domain(&t.ctx, DOMID, &info, &ExtraEntries::default()).is_err());
    assert!(t.hv.calls().is_empty());
}

#[test]
fn oversized_memory_is_rejected_before_sizing() {
    let t = seeded();
    let mut info = pv_build_info();
    info.max_memkb = u64::MAX;

    let err = build_pre(&t.ctx, DOMID, &info).unwrap_err();

    assert!(matches!(err, XenliteError::InvalidArgument(_)));
    assert!(t.hv.calls().is_empty());

    let mut info = hvm_build_info();
    info.max_memkb = u64::MAX;
    info.target_memkb = u64::MAX;
    assert!(build_pre(&t.ctx, DOMID, &info).is_err());
    assert!(t.hv.calls().is_empty());
}

// ============================================================================
// RESTORE
// ============================================================================

#[test]
fn restore_fills_ring_frames() {
    let t = seeded();
    let info = hvm_build_info();
    t.hv.set_frames(ImageFrames {
        store_mfn: 0x1234,
        console_mfn: 0x5678,
    });
    let mut state = build_pre(&t.ctx, DOMID, &info).unwrap();

    let mut stream: &[u8] = b"LinuxGuestRecord....";
    restore_common(&t.ctx, DOMID, &info, &mut state, &mut stream).unwrap();

    assert_eq!(
        state,
        BuildState {
            store_port: state.store_port,
            console_port: state.console_port,
            store_mfn: 0x1234,
            console_mfn: 0x5678,
        }
    );
    let restored = t.hv.calls().into_iter().find_map(|c| match c {
        HvCall::DomainRestore { params, .. } => Some(params),
        _ => None,
    });
    let params = restored.unwrap();
    assert!(params.hvm);
    assert!(params.pae);
}
