//! Error taxonomy for the xenlite toolstack core.
//!
//! Errors are grouped by how a caller is expected to react:
//! - sizing/allocation and image-build failures are fatal to a build
//! - [`XenliteError::Conflict`] is transient and retried by the publication step
//! - suspend handshake failures are fatal to one suspend attempt
//! - userdata failures carry the underlying OS error

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across all xenlite crates.
pub type XenliteResult<T> = Result<T, XenliteError>;

/// Numeric code for generic failures.
pub const ERROR_FAIL: i32 = -3;

#[derive(Debug, Error)]
pub enum XenliteError {
    /// Hypervisor resource sizing or allocation failed.
    #[error("hypervisor: {0}")]
    Hypervisor(String),

    /// Guest image construction failed.
    #[error("image build: {0}")]
    ImageBuild(String),

    /// Config store transaction lost a concurrent-modification race.
    #[error("store transaction conflict")]
    Conflict,

    /// Any other config store failure.
    #[error("store: {0}")]
    Store(String),

    /// Suspend handshake failed.
    #[error("suspend: {0}")]
    Suspend(String),

    /// Filesystem failure on a specific path.
    #[error("io on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A durable record exists but holds no data.
    #[error("record {} is empty", .0.display())]
    Corrupt(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator did not reach the awaited state in time.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl XenliteError {
    /// Create an I/O error bound to the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is the transient transaction conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, XenliteError::Conflict)
    }

    /// Whether this reports a missing record or file.
    pub fn is_not_found(&self) -> bool {
        match self {
            XenliteError::NotFound(_) => true,
            XenliteError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Numeric result code in the toolstack convention.
    ///
    /// Sizing/allocation failures are `-1`, image-build failures `-2`,
    /// everything else [`ERROR_FAIL`].
    pub fn code(&self) -> i32 {
        match self {
            XenliteError::Hypervisor(_) => -1,
            XenliteError::ImageBuild(_) => -2,
            _ => ERROR_FAIL,
        }
    }

    /// Underlying errno, where one exists.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            XenliteError::Io { source, .. } => source
                .raw_os_error()
                .or_else(|| (source.kind() == io::ErrorKind::NotFound).then_some(libc::ENOENT)),
            XenliteError::Corrupt(_) => Some(libc::EPROTO),
            XenliteError::NotFound(_) => Some(libc::ENOENT),
            XenliteError::Timeout(_) => Some(libc::ETIMEDOUT),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for XenliteError {
    fn from(err: serde_json::Error) -> Self {
        XenliteError::Config(err.to_string())
    }
}
