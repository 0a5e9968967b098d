//! Error taxonomy for disk image operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by a [`DiskImageService`](crate::DiskImageService).
///
/// Credential and lifecycle failures are never retried by this crate.
/// Retrying a wrong password or a busy device can leave a container in a
/// worse state than the caller found it.
#[derive(Error, Debug)]
pub enum DiskImageError {
    /// The container could not be created (path unwritable, or a container
    /// already exists there).
    #[error("Failed to create container at {path}: {reason}")]
    ContainerCreationFailed {
        /// Requested container path
        path: PathBuf,
        /// Tool output or local reason
        reason: String,
    },

    /// The password was rejected by the container.
    #[error("Incorrect password for container {0}")]
    InvalidCredential(PathBuf),

    /// The container is already attached at the given mount point.
    ///
    /// Callers treat this as success; [`attach`](crate::DiskImageService::attach)
    /// implementations resolve it to the existing mount point themselves.
    #[error("Container is already attached at {0}")]
    AlreadyAttached(PathBuf),

    /// Detach was refused because files on the volume are still open.
    #[error("Volume at {0} is busy (files are still open)")]
    DeviceBusy(PathBuf),

    /// The physical volume holding the container is not connected.
    #[error("The drive holding {0} is not connected")]
    HostDriveUnavailable(PathBuf),

    /// The host volume is present but the container file is not.
    #[error("Container not found: {0}")]
    ContainerNotFound(PathBuf),

    /// The host tool is not installed or not on `PATH`.
    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    /// The host tool exited with a non-zero status that could not be
    /// classified further.
    #[error("{program} exited with code {code:?}: {stderr}")]
    CommandFailed {
        /// Program name
        program: String,
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
        /// Trimmed standard error
        stderr: String,
    },

    /// The tool succeeded but its output did not contain what we needed.
    #[error("Unexpected output from {program}: {detail}")]
    UnexpectedOutput {
        /// Program name
        program: String,
        /// What was missing
        detail: String,
    },

    /// Local filesystem error around the container.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl DiskImageError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for errors caused by a rejected password.
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential(_))
    }

    /// Returns true when the backing drive has gone away.
    pub fn is_host_unavailable(&self) -> bool {
        matches!(self, Self::HostDriveUnavailable(_))
    }
}
