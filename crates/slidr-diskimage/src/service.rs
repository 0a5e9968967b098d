//! Disk image service abstraction
//!
//! [`DiskImageService`] is the seam between vault orchestration and the
//! host's encrypted container facility. The production implementation is
//! [`HdiutilService`](crate::HdiutilService); tests use
//! [`FakeDiskImageService`](crate::testing::FakeDiskImageService).
//!
//! Every operation is async: on the host they are external process
//! invocations, and callers may be interleaved with other work at each
//! `.await`. No operation imposes its own timeout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::DiskImageError;

/// Result alias for disk image operations.
pub type Result<T> = std::result::Result<T, DiskImageError>;

/// Default maximum size of a newly created growable container (1 TiB).
///
/// Sparse containers only consume the space actually written.
pub const DEFAULT_MAX_CONTAINER_BYTES: u64 = 1 << 40;

/// What [`DiskImageService::create`] learned about a new container.
///
/// The vault layer turns this into a registered vault configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSeed {
    /// Actual path of the container file (the host may append an extension)
    pub container_path: PathBuf,
    /// Volume name the container attaches under
    pub mount_point_name: String,
    /// Identifier of the physical volume holding the container, if known
    pub volume_uuid: Option<String>,
}

/// Host facility for encrypted, file-backed containers.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the vault service shares one
/// instance between the UI flows and the auto-lock task.
#[async_trait]
pub trait DiskImageService: Send + Sync {
    /// Create a new encrypted, growable container at `container`.
    ///
    /// # Errors
    ///
    /// - [`DiskImageError::ContainerCreationFailed`] if something already
    ///   exists at the path or the location is unwritable
    async fn create(
        &self,
        name: &str,
        container: &Path,
        password: &SecretString,
    ) -> Result<ContainerSeed>;

    /// Unlock and mount a container, returning its mount point.
    ///
    /// Attaching an already-attached container returns the existing mount
    /// point instead of failing, once the password has been checked.
    ///
    /// # Errors
    ///
    /// - [`DiskImageError::InvalidCredential`] on a wrong password
    /// - [`DiskImageError::HostDriveUnavailable`] if the backing volume is absent
    async fn attach(&self, container: &Path, password: &SecretString) -> Result<PathBuf>;

    /// Unmount a container by mount point.
    ///
    /// With `force` set, open file handles are abandoned. This is how a
    /// container is reclaimed after a crashed consumer.
    ///
    /// # Errors
    ///
    /// - [`DiskImageError::DeviceBusy`] if `force` is false and files are open
    async fn detach(&self, mount_point: &Path, force: bool) -> Result<()>;

    /// Current mount point of `container`, or `None` if it is not attached.
    async fn resolve_mount_point(&self, container: &Path) -> Result<Option<PathBuf>>;

    /// Re-encrypt the container's key slot under a new password.
    ///
    /// Calling this again with the arguments swapped restores the old
    /// password; the vault layer relies on that for rollback.
    ///
    /// # Errors
    ///
    /// - [`DiskImageError::InvalidCredential`] if `old` is wrong
    async fn change_password(
        &self,
        container: &Path,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<()>;

    /// Check `password` against the container without attaching it.
    ///
    /// # Errors
    ///
    /// - [`DiskImageError::InvalidCredential`] on a wrong password
    /// - [`DiskImageError::HostDriveUnavailable`] if the backing volume is absent
    async fn verify_password(&self, container: &Path, password: &SecretString) -> Result<()>;

    /// Change the maximum size of a detached container.
    async fn resize(&self, container: &Path, password: &SecretString, max_bytes: u64)
    -> Result<()>;

    /// Whether the volume holding `container` is currently connected.
    fn is_host_available(&self, container: &Path) -> bool {
        container.parent().is_some_and(Path::exists)
    }
}
