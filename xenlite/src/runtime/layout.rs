use std::path::{Path, PathBuf};

use xenlite_shared::errors::{XenliteError, XenliteResult};

/// File naming patterns under the state directory
pub mod filenames {
    /// userdata-{role}.{uuid}.{userid}
    pub fn userdata(role: &str, uuid: &str, userid: &str) -> String {
        format!("userdata-{role}.{uuid}.{userid}")
    }

    /// Device model state written on save
    pub fn device_model_save(domid: u32) -> String {
        format!("qemu-save.{domid}")
    }

    /// Device model state read back on restore
    pub fn device_model_resume(domid: u32) -> String {
        format!("qemu-resume.{domid}")
    }
}

// ============================================================================
// FILESYSTEM LAYOUT
// ============================================================================

/// Filesystem locations the toolstack reads and writes.
///
/// ```text
/// {state_dir}/
/// ├── userdata-d.{uuid}.{userid}   # durable userdata record
/// ├── userdata-n.{uuid}.{userid}   # staging file (in-flight write)
/// ├── qemu-save.{domid}            # device model state on save
/// └── qemu-resume.{domid}          # device model state on restore
/// {firmware_dir}/                  # HVM firmware, relative paths resolve here
/// ```
#[derive(Clone, Debug)]
pub struct XenLayout {
    state_dir: PathBuf,
    firmware_dir: PathBuf,
}

impl XenLayout {
    pub fn new(state_dir: PathBuf, firmware_dir: PathBuf) -> Self {
        Self {
            state_dir,
            firmware_dir,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn firmware_dir(&self) -> &Path {
        &self.firmware_dir
    }

    /// Path of one userdata file.
    ///
    /// `role` and `userid` may be wildcards when building an enumeration
    /// pattern; the result is then only meaningful as a pattern.
    pub fn userdata_path(&self, role: &str, uuid: &str, userid: &str) -> PathBuf {
        self.state_dir.join(filenames::userdata(role, uuid, userid))
    }

    pub fn device_model_save_path(&self, domid: u32) -> PathBuf {
        self.state_dir.join(filenames::device_model_save(domid))
    }

    pub fn device_model_resume_path(&self, domid: u32) -> PathBuf {
        self.state_dir.join(filenames::device_model_resume(domid))
    }

    /// Resolve a kernel/firmware path: absolute paths are kept, relative
    /// ones are taken from the firmware directory.
    pub fn firmware_path(&self, kernel: &str) -> PathBuf {
        let path = Path::new(kernel);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.firmware_dir.join(path)
        }
    }

    /// Create the state directory.
    pub fn prepare(&self) -> XenliteResult<()> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| XenliteError::io(&self.state_dir, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> XenLayout {
        XenLayout::new(PathBuf::from("/var/lib/xen"), PathBuf::from("/usr/lib/xen/boot"))
    }

    #[test]
    fn test_userdata_path() {
        let path = layout().userdata_path("d", "6f1c9f7e-0000-4000-8000-000000000001", "xl");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/xen/userdata-d.6f1c9f7e-0000-4000-8000-000000000001.xl")
        );
    }

    #[test]
    fn test_firmware_path_resolution() {
        let layout = layout();
        assert_eq!(
            layout.firmware_path("hvmloader"),
            PathBuf::from("/usr/lib/xen/boot/hvmloader")
        );
        assert_eq!(
            layout.firmware_path("/opt/fw/hvmloader"),
            PathBuf::from("/opt/fw/hvmloader")
        );
    }

    #[test]
    fn test_device_model_paths() {
        let layout = layout();
        assert_eq!(
            layout.device_model_save_path(5),
            PathBuf::from("/var/lib/xen/qemu-save.5")
        );
        assert_eq!(
            layout.device_model_resume_path(5),
            PathBuf::from("/var/lib/xen/qemu-resume.5")
        );
    }

    #[test]
    fn test_prepare_creates_state_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let state = temp.path().join("state");
        let layout = XenLayout::new(state.clone(), temp.path().join("fw"));
        layout.prepare().unwrap();
        assert!(state.is_dir());
    }
}
