//! Error types for the vault subsystem

use std::io;
use std::path::PathBuf;

use slidr_diskimage::DiskImageError;
use thiserror::Error;

use crate::credential::CredentialError;

/// Result alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors surfaced by the vault subsystem.
///
/// Credential and container lifecycle errors always reach the caller; they
/// are never retried internally.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The encrypted container could not be created.
    #[error("Failed to create vault container at {path}: {reason}")]
    ContainerCreationFailed {
        /// Requested container path
        path: PathBuf,
        /// Why creation failed
        reason: String,
    },

    /// Wrong password.
    #[error("Incorrect password for vault container {0}")]
    InvalidCredential(PathBuf),

    /// The container is already attached (callers treat this as success).
    #[error("Vault is already unlocked at {0}")]
    AlreadyAttached(PathBuf),

    /// Files on the vault volume are still open.
    #[error("Vault volume {0} is busy; close any open files and try again")]
    DeviceBusy(PathBuf),

    /// The drive holding the container is not connected.
    #[error("The drive holding vault container {0} is not connected")]
    HostDriveUnavailable(PathBuf),

    /// The drive is present but the container file is gone.
    #[error("Vault container not found: {0}")]
    ContainerNotFound(PathBuf),

    /// The manifest could not be written.
    #[error("Failed to write vault manifest {path}: {source}")]
    RegistryWriteFailed {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The manifest exists but could not be read.
    #[error("Failed to read vault manifest {path}: {source}")]
    ManifestUnreadable {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The manifest exists but is not a valid document.
    #[error("Vault manifest {path} is corrupted ({reason}); a copy was saved to {backup_path}")]
    ManifestCorrupted {
        /// Manifest path
        path: PathBuf,
        /// Where the unreadable document was copied
        backup_path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Timed out waiting for another process holding the manifest lock.
    #[error("Timed out waiting for the vault manifest lock at {0}")]
    ManifestLockTimeout(PathBuf),

    /// File system failure during migration or container cleanup.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Host tool failure that does not map onto a more specific variant.
    #[error("Disk image operation failed: {0}")]
    DiskImage(#[source] DiskImageError),

    /// No vault with this id is registered.
    #[error("No vault registered with id {0}")]
    VaultNotFound(String),

    /// Only one local vault may exist.
    #[error("A local vault is already registered at {0}")]
    LocalVaultExists(PathBuf),

    /// Secure credential store failure.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// A stored password was requested but none is saved.
    #[error("No vault password is saved in the keychain")]
    NoStoredCredential,

    /// Password rotation failed and at least one container could not be
    /// rolled back to the old password.
    #[error("Password change failed ({cause}) and could not be undone for: {}", stranded.join(", "))]
    RotationRollbackFailed {
        /// The failure that triggered rollback
        cause: Box<VaultError>,
        /// Names of vaults left on the new password
        stranded: Vec<String>,
    },

    /// Vault mode cannot be torn down while vaults are still registered.
    #[error("{0} vault(s) are still registered")]
    VaultsStillRegistered(usize),

    /// Files are still inside a vault after migrating its library out.
    #[error("{} file(s) are still inside the vault at {mount_point}", remaining.len())]
    VaultNotEmpty {
        /// Vault mount point
        mount_point: PathBuf,
        /// Leftover files, relative to the mount point
        remaining: Vec<PathBuf>,
    },

    /// A catalog path is absolute or escapes its library root.
    #[error("Invalid library-relative path: {0}")]
    InvalidRelativePath(String),

    /// The platform application support directory could not be determined.
    #[error("Failed to find the application support directory")]
    NoSupportDir,
}

impl VaultError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Coarse classification for presenting the error to a user.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::InvalidCredential(_) | Self::NoStoredCredential => FailureCategory::WrongPassword,
            Self::HostDriveUnavailable(_) => FailureCategory::DriveNotConnected,
            Self::DeviceBusy(_) => FailureCategory::Busy,
            Self::ManifestCorrupted { .. } => FailureCategory::Corrupt,
            Self::Io { source, .. }
            | Self::RegistryWriteFailed { source, .. }
            | Self::ManifestUnreadable { source, .. } => io_category(source),
            Self::RotationRollbackFailed { cause, .. } => cause.category(),
            _ => FailureCategory::Other,
        }
    }

    /// A sentence suitable for the setup wizard's error view.
    pub fn user_message(&self) -> String {
        match self.category() {
            FailureCategory::WrongPassword => "The password is incorrect.".to_owned(),
            FailureCategory::DriveNotConnected => {
                "The drive holding this vault is not connected. Connect it and try again."
                    .to_owned()
            }
            FailureCategory::DiskFull => {
                "There is not enough free space to finish. Free up space and try again."
                    .to_owned()
            }
            FailureCategory::PermissionDenied => {
                "Slidr does not have permission to access a required file.".to_owned()
            }
            FailureCategory::Busy => {
                "The vault is in use. Close any open files from it and try again.".to_owned()
            }
            FailureCategory::Corrupt | FailureCategory::Other => self.to_string(),
        }
    }
}

/// What kind of problem an error represents, for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// The password was rejected
    WrongPassword,
    /// A removable drive is missing
    DriveNotConnected,
    /// Out of disk space or quota
    DiskFull,
    /// File permissions
    PermissionDenied,
    /// Open files prevent locking
    Busy,
    /// Unreadable manifest
    Corrupt,
    /// Anything else
    Other,
}

fn io_category(error: &io::Error) -> FailureCategory {
    match error.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => FailureCategory::DiskFull,
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            FailureCategory::PermissionDenied
        }
        io::ErrorKind::ResourceBusy => FailureCategory::Busy,
        _ => FailureCategory::Other,
    }
}

impl From<DiskImageError> for VaultError {
    fn from(error: DiskImageError) -> Self {
        match error {
            DiskImageError::ContainerCreationFailed { path, reason } => {
                Self::ContainerCreationFailed { path, reason }
            }
            DiskImageError::InvalidCredential(path) => Self::InvalidCredential(path),
            DiskImageError::AlreadyAttached(path) => Self::AlreadyAttached(path),
            DiskImageError::DeviceBusy(path) => Self::DeviceBusy(path),
            DiskImageError::HostDriveUnavailable(path) => Self::HostDriveUnavailable(path),
            DiskImageError::ContainerNotFound(path) => Self::ContainerNotFound(path),
            DiskImageError::Io { path, source } => Self::Io { path, source },
            other => Self::DiskImage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_distinguish_common_failures() {
        let wrong = VaultError::InvalidCredential(PathBuf::from("/v"));
        let unplugged = VaultError::HostDriveUnavailable(PathBuf::from("/Volumes/X/v"));
        let full = VaultError::io(
            "/Volumes/Slidr/a.jpg",
            io::Error::from(io::ErrorKind::StorageFull),
        );

        assert_eq!(wrong.category(), FailureCategory::WrongPassword);
        assert_eq!(unplugged.category(), FailureCategory::DriveNotConnected);
        assert_eq!(full.category(), FailureCategory::DiskFull);

        let messages = [wrong.user_message(), unplugged.user_message(), full.user_message()];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
        assert_ne!(messages[0], messages[2]);
    }

    #[test]
    fn test_disk_image_errors_map_onto_taxonomy() {
        let mapped: VaultError = DiskImageError::DeviceBusy(PathBuf::from("/Volumes/S")).into();
        assert!(matches!(mapped, VaultError::DeviceBusy(_)));

        let mapped: VaultError = DiskImageError::ToolMissing("hdiutil".to_owned()).into();
        assert!(matches!(mapped, VaultError::DiskImage(_)));
    }

    #[test]
    fn test_rollback_failure_inherits_category() {
        let error = VaultError::RotationRollbackFailed {
            cause: Box::new(VaultError::HostDriveUnavailable(PathBuf::from("/x"))),
            stranded: vec!["Local Vault".to_owned()],
        };
        assert_eq!(error.category(), FailureCategory::DriveNotConnected);
        assert!(error.to_string().contains("Local Vault"));
    }
}
