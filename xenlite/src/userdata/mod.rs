//! Durable per-domain userdata.
//!
//! ## Storage Model
//!
//! Records live as plain files in the state directory, keyed by the domain
//! UUID (looked up on every call, never cached) and a caller-chosen user id:
//!
//! ```text
//! {state_dir}/
//! ├── userdata-d.{uuid}.{userid}   # durable record
//! └── userdata-n.{uuid}.{userid}   # staging file, exists only mid-write
//! ```
//!
//! ## Atomic Writes
//!
//! A write goes to the staging file, is flushed, then renamed over the
//! durable record. The rename is the only durability boundary: readers see
//! the previous complete record or the new complete record, never a mix.
//! Concurrent writers to the same key are not serialized; the last rename
//! wins.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::hypervisor::DomId;
use crate::runtime::XenliteContext;
use crate::runtime::constants::userdata_roles as roles;
use crate::runtime::layout::filenames;
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Userdata operations bound to a context.
pub struct UserdataStore<'a> {
    ctx: &'a XenliteContext,
}

impl<'a> UserdataStore<'a> {
    pub fn new(ctx: &'a XenliteContext) -> Self {
        Self { ctx }
    }

    /// Store `data` for (`domid`, `userid`), replacing any previous record.
    ///
    /// Storing an empty blob deletes the record, with [`delete`](Self::delete)
    /// semantics.
    pub fn store(&self, domid: DomId, userid: &str, data: &[u8]) -> XenliteResult<()> {
        validate_userid(userid)?;
        let uuid = self.domain_uuid(domid)?;
        let durable = self.ctx.layout().userdata_path(roles::DURABLE, &uuid, userid);

        if data.is_empty() {
            return remove_record(&durable);
        }

        let staging = self.ctx.layout().userdata_path(roles::STAGING, &uuid, userid);
        self.ctx.layout().prepare()?;

        if let Err(e) = write_staging(&staging, data) {
            tracing::error!(
                domid,
                path = %staging.display(),
                error = %e,
                "cannot write userdata staging file"
            );
            discard_staging(&staging);
            return Err(XenliteError::io(staging, e));
        }

        if let Err(e) = fs::rename(&staging, &durable) {
            tracing::error!(
                domid,
                from = %staging.display(),
                to = %durable.display(),
                error = %e,
                "cannot commit userdata record"
            );
            discard_staging(&staging);
            return Err(XenliteError::io(durable, e));
        }

        tracing::debug!(domid, userid, bytes = data.len(), "userdata stored");
        Ok(())
    }

    /// Read the complete record for (`domid`, `userid`).
    ///
    /// # Errors
    ///
    /// - `NotFound` when no record exists
    /// - `Corrupt` when the record exists but is empty
    /// - `Io` for any other filesystem failure
    pub fn retrieve(&self, domid: DomId, userid: &str) -> XenliteResult<Vec<u8>> {
        validate_userid(userid)?;
        let uuid = self.domain_uuid(domid)?;
        let durable = self.ctx.layout().userdata_path(roles::DURABLE, &uuid, userid);

        match fs::read(&durable) {
            Ok(data) if data.is_empty() => {
                tracing::error!(path = %durable.display(), "userdata file is empty");
                Err(XenliteError::Corrupt(durable))
            }
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(XenliteError::NotFound(format!(
                "userdata '{userid}' for domain {domid}"
            ))),
            Err(e) => Err(XenliteError::io(durable, e)),
        }
    }

    /// Remove the record. A missing record is reported as the filesystem
    /// error, not ignored.
    pub fn delete(&self, domid: DomId, userid: &str) -> XenliteResult<()> {
        validate_userid(userid)?;
        let uuid = self.domain_uuid(domid)?;
        let durable = self.ctx.layout().userdata_path(roles::DURABLE, &uuid, userid);
        remove_record(&durable)
    }

    /// Remove every userdata file of the domain, any role, any user id.
    ///
    /// Best effort: individual failures are logged and the sweep continues.
    /// Returns how many files were removed.
    pub fn destroy_all(&self, domid: DomId) -> XenliteResult<usize> {
        let uuid = self.domain_uuid(domid)?;
        let pattern = filenames::userdata(roles::ANY, &uuid, roles::ANY_USER);
        let dir = self.ctx.layout().state_dir();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                tracing::error!(dir = %dir.display(), pattern, error = %e, "userdata enumeration failed");
                return Ok(0);
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !wildcard_match(&pattern, name) {
                continue;
            }
            if remove_record(&entry.path()).is_ok() {
                removed += 1;
            }
        }

        tracing::debug!(domid, removed, "userdata destroyed");
        Ok(removed)
    }

    fn domain_uuid(&self, domid: DomId) -> XenliteResult<String> {
        let info = self.ctx.domain_info(domid).map_err(|e| {
            tracing::error!(domid, error = %e, "unable to find domain info");
            e
        })?;
        Ok(info.uuid.hyphenated().to_string())
    }
}

impl XenliteContext {
    /// Userdata operations on this context.
    pub fn userdata(&self) -> UserdataStore<'_> {
        UserdataStore::new(self)
    }
}

/// User ids become part of a file name; keep them to one path component
/// and free of pattern characters.
fn validate_userid(userid: &str) -> XenliteResult<()> {
    if userid.is_empty() || userid.contains(['/', '\0', '*', '?', '[']) {
        return Err(XenliteError::InvalidArgument(format!(
            "invalid userdata id '{userid}'"
        )));
    }
    Ok(())
}

fn write_staging(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = open_staging(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn open_staging(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_staging(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn discard_staging(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
    }
}

fn remove_record(path: &Path) -> XenliteResult<()> {
    fs::remove_file(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "remove failed");
        XenliteError::io(PathBuf::from(path), e)
    })
}

/// Shell-style match supporting `?` (one char) and `*` (any run).
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
