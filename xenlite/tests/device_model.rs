//! Integration tests for device model state capture and restore.

use std::fs;

use xenlite::XenliteError;
use xenlite::device_model::{restore_device_model, save_device_model, wait_for_device_model};
use xenlite_test_utils::TestContext;

const DOMID: u32 = 5;
const SIGNATURE: &[u8] = b"QemuDeviceModelRecord";
const COMMAND: &str = "/local/domain/0/device-model/5/command";
const STATE: &str = "/local/domain/0/device-model/5/state";

/// Emulator that pauses as soon as it is asked to save.
fn with_emulator() -> TestContext {
    let t = TestContext::new();
    t.store.respond(COMMAND, "save", STATE, "paused");
    fs::create_dir_all(&t.state_dir).unwrap();
    t
}

fn emulator_state(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn save_appends_signature_and_state() {
    let t = with_emulator();
    let state = emulator_state(2500);
    let dump = t.state_dir.join("qemu-save.5");
    fs::write(&dump, &state).unwrap();

    let mut sink = b"guest".to_vec();
    let copied = save_device_model(&t.ctx, DOMID, &mut sink).unwrap();

    assert_eq!(copied, 2500);
    assert_eq!(&sink[..5], b"guest");
    assert_eq!(&sink[5..5 + SIGNATURE.len()], SIGNATURE);
    assert_eq!(&sink[5 + SIGNATURE.len()..], &state[..]);
    assert!(!dump.exists());
    assert_eq!(t.store.writes_to(COMMAND), vec!["save"]);
    assert_eq!(t.store.active_watches(), 0);
}

#[test]
fn save_times_out_when_emulator_never_pauses() {
    let t = TestContext::new();
    t.store.set(STATE, "running");

    let err = save_device_model(&t.ctx, DOMID, &mut Vec::new()).unwrap_err();

    assert!(matches!(err, XenliteError::Timeout(_)));
    assert_eq!(t.store.writes_to(COMMAND), vec!["save"]);
    assert_eq!(t.store.active_watches(), 0);
}

#[test]
fn save_without_dump_file_fails() {
    let t = with_emulator();

    let mut sink = Vec::new();
    let err = save_device_model(&t.ctx, DOMID, &mut sink).unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(sink, SIGNATURE);
}

#[test]
fn wait_returns_at_once_when_state_already_reached() {
    let t = TestContext::new();
    t.store.set(STATE, "paused");

    wait_for_device_model(&t.ctx, DOMID, "paused", std::time::Duration::ZERO).unwrap();
}

#[test]
fn restore_writes_resume_file() {
    let t = TestContext::new();
    let state = emulator_state(1500);
    let mut stream = SIGNATURE.to_vec();
    stream.extend_from_slice(&state);

    let written = restore_device_model(&t.ctx, DOMID, &mut stream.as_slice()).unwrap();

    assert_eq!(written, 1500);
    assert_eq!(fs::read(t.state_dir.join("qemu-resume.5")).unwrap(), state);
}

#[test]
fn restore_rejects_stream_without_signature() {
    let t = TestContext::new();

    let err = restore_device_model(&t.ctx, DOMID, &mut &b"garbage-that-is-long-enough"[..]).unwrap_err();

    assert!(matches!(err, XenliteError::InvalidArgument(_)));
    assert!(!t.state_dir.join("qemu-resume.5").exists());
}

#[test]
fn save_then_restore_hands_state_back() {
    let t = with_emulator();
    let state = emulator_state(4096);
    fs::write(t.state_dir.join("qemu-save.5"), &state).unwrap();

    let mut stream = Vec::new();
    save_device_model(&t.ctx, DOMID, &mut stream).unwrap();
    restore_device_model(&t.ctx, DOMID, &mut stream.as_slice()).unwrap();

    assert_eq!(fs::read(t.state_dir.join("qemu-resume.5")).unwrap(), state);
}
