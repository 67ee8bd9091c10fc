//! Device model (emulator) state capture and hand-back.
//!
//! On save the emulator is told to dump its state to `qemu-save.{domid}` and
//! pause. Once it reports "paused", the state is appended to the save stream
//! behind a fixed signature and the dump file is removed. Restore reverses
//! this into `qemu-resume.{domid}` for the emulator to pick up.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::hypervisor::DomId;
use crate::runtime::XenliteContext;
use crate::runtime::constants::device_model;
use crate::xenstore::XBT_NULL;
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Label used for errors on the caller's stream, which has no path.
const STREAM: &str = "saved-state stream";

/// Block until the device model of `domid` reports `state`.
///
/// Watches the emulator's state key and re-reads it on every event.
///
/// # Errors
///
/// `Timeout` when the state is not reached within `timeout`; store errors
/// are propagated.
pub fn wait_for_device_model(
    ctx: &XenliteContext,
    domid: DomId,
    state: &str,
    timeout: Duration,
) -> XenliteResult<()> {
    let store = ctx.store();
    let path = device_model::state_path(domid);
    let token = format!("dm-{domid}-{state}");

    store.watch(&path, &token)?;
    let deadline = Instant::now() + timeout;
    let result = (|| -> XenliteResult<()> {
        loop {
            if store.read(XBT_NULL, &path)?.as_deref() == Some(state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(XenliteError::Timeout(format!(
                    "device model for domain {domid} did not reach '{state}' within {timeout:?}"
                )));
            }
            store.read_watch(deadline - now)?;
        }
    })();

    if let Err(e) = store.unwatch(&path, &token) {
        tracing::warn!(domid, path = %path, error = %e, "failed to remove device model watch");
    }
    result
}

/// Append the device model state of `domid` to `sink`.
///
/// Returns the number of state bytes copied, signature excluded. The dump
/// file is removed once fully copied.
pub fn save_device_model(ctx: &XenliteContext, domid: DomId, sink: &mut dyn Write) -> XenliteResult<u64> {
    let filename = ctx.layout().device_model_save_path(domid);
    tracing::debug!(domid, path = %filename.display(), "saving device model state");

    ctx.store()
        .write(XBT_NULL, &device_model::command_path(domid), device_model::CMD_SAVE)?;
    wait_for_device_model(ctx, domid, device_model::STATE_PAUSED, ctx.options().device_model_wait())?;

    sink.write_all(device_model::SIGNATURE.as_bytes())
        .map_err(|e| XenliteError::io(STREAM, e))?;

    let mut state = File::open(&filename).map_err(|e| XenliteError::io(&filename, e))?;
    let copied = copy_chunks(&mut state, &filename, sink, Path::new(STREAM))?;
    drop(state);

    if let Err(e) = fs::remove_file(&filename) {
        tracing::warn!(path = %filename.display(), error = %e, "failed to remove device model state");
    }
    tracing::debug!(domid, bytes = copied, "device model state saved");
    Ok(copied)
}

/// Consume and check the signature that precedes device model state.
///
/// `Ok(false)` when the stream ends early or holds something else.
pub fn read_device_model_signature(source: &mut dyn Read) -> XenliteResult<bool> {
    let mut buf = [0u8; device_model::SIGNATURE.len()];
    match source.read_exact(&mut buf) {
        Ok(()) => Ok(&buf[..] == device_model::SIGNATURE.as_bytes()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(XenliteError::io(STREAM, e)),
    }
}

/// Write the device model state found in `source` to the resume file of
/// `domid`. Returns the number of bytes written.
pub fn restore_device_model(
    ctx: &XenliteContext,
    domid: DomId,
    source: &mut dyn Read,
) -> XenliteResult<u64> {
    if !read_device_model_signature(source)? {
        return Err(XenliteError::InvalidArgument(format!(
            "domain {domid}: stream does not carry device model state"
        )));
    }

    ctx.layout().prepare()?;
    let filename = ctx.layout().device_model_resume_path(domid);
    let mut resume = File::create(&filename).map_err(|e| XenliteError::io(&filename, e))?;
    let copied = copy_chunks(source, Path::new(STREAM), &mut resume, &filename)?;
    resume.sync_all().map_err(|e| XenliteError::io(&filename, e))?;

    tracing::debug!(domid, path = %filename.display(), bytes = copied, "device model state restored");
    Ok(copied)
}

/// Copy in fixed-size chunks, retrying interrupted reads.
fn copy_chunks(
    src: &mut dyn Read,
    src_path: &Path,
    dst: &mut dyn Write,
    dst_path: &Path,
) -> XenliteResult<u64> {
    let mut buf = [0u8; device_model::CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(XenliteError::io(src_path, e)),
        };
        dst.write_all(&buf[..n])
            .map_err(|e| XenliteError::io(dst_path, e))?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails the first read with EINTR, then behaves like the inner reader.
    struct Interrupting<R> {
        inner: R,
        interrupted: bool,
    }

    impl<R: Read> Read for Interrupting<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
    }

    #[test]
    fn test_copy_chunks_spans_multiple_chunks() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let n = copy_chunks(&mut data.as_slice(), Path::new("src"), &mut out, Path::new("dst")).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_chunks_retries_interrupted_read() {
        let mut src = Interrupting {
            inner: &b"state"[..],
            interrupted: false,
        };
        let mut out = Vec::new();
        copy_chunks(&mut src, Path::new("src"), &mut out, Path::new("dst")).unwrap();
        assert_eq!(out, b"state");
    }

    #[test]
    fn test_copy_chunks_aborts_on_read_error() {
        let mut out = Vec::new();
        let err = copy_chunks(&mut Broken, Path::new("/var/lib/xen/qemu-save.1"), &mut out, Path::new("dst"))
            .unwrap_err();
        assert_eq!(err.os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_signature_check() {
        let mut good = &b"QemuDeviceModelRecordrest"[..];
        assert!(read_device_model_signature(&mut good).unwrap());
        assert_eq!(good, b"rest");

        let mut short = &b"Qemu"[..];
        assert!(!read_device_model_signature(&mut short).unwrap());

        let mut other = &b"LinuxGuestRecordxxxxxxx"[..];
        assert!(!read_device_model_signature(&mut other).unwrap());
    }
}
