//! Explicit configuration for the vault subsystem.
//!
//! Everything the vault layer needs to know about its environment lives in
//! one [`VaultContext`] value that the application builds at startup and
//! passes to [`VaultService`](crate::VaultService) and
//! [`MigrationOrchestrator`](crate::MigrationOrchestrator).

use std::path::{Path, PathBuf};

use crate::error::VaultError;

/// Environment variable overriding the plaintext support directory.
pub const SUPPORT_DIR_ENV: &str = "SLIDR_SUPPORT_DIR";

/// File name of the vault manifest inside the support directory.
pub const MANIFEST_FILE_NAME: &str = "vault_manifest.json";

/// Keychain service name the shared vault password is stored under.
pub const DEFAULT_CREDENTIAL_SERVICE: &str = "com.slidr.vault";

/// Logical name (keychain account) of the shared vault password.
pub const DEFAULT_CREDENTIAL_NAME: &str = "vault-password";

/// Migration progress is reported every this many items.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 25;

/// Configuration for the vault subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultContext {
    /// Plaintext application support directory (never inside a vault)
    pub support_dir: PathBuf,
    /// Manifest file name within `support_dir`
    pub manifest_file_name: String,
    /// Directory the host attaches containers under
    pub mount_root: PathBuf,
    /// Keychain service for the shared password
    pub credential_service: String,
    /// Keychain account for the shared password
    pub credential_name: String,
    /// Items between migration progress callbacks
    pub progress_interval: usize,
}

impl VaultContext {
    /// Context rooted at an explicit support directory.
    pub fn new(support_dir: impl Into<PathBuf>) -> Self {
        Self {
            support_dir: support_dir.into(),
            manifest_file_name: MANIFEST_FILE_NAME.to_owned(),
            mount_root: PathBuf::from(slidr_diskimage::DEFAULT_VOLUMES_ROOT),
            credential_service: DEFAULT_CREDENTIAL_SERVICE.to_owned(),
            credential_name: DEFAULT_CREDENTIAL_NAME.to_owned(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Resolve the support directory from the environment or the platform
    /// conventions.
    ///
    /// `SLIDR_SUPPORT_DIR` wins when set; otherwise the platform data
    /// directory for the application is used (e.g.
    /// `~/Library/Application Support/com.slidr.Slidr` on macOS).
    pub fn discover() -> Result<Self, VaultError> {
        if let Some(dir) = std::env::var_os(SUPPORT_DIR_ENV) {
            tracing::debug!("Using support dir from {}", SUPPORT_DIR_ENV);
            return Ok(Self::new(PathBuf::from(dir)));
        }

        let dirs = directories::ProjectDirs::from("com", "slidr", "Slidr")
            .ok_or(VaultError::NoSupportDir)?;
        Ok(Self::new(dirs.data_dir()))
    }

    /// Override the credential service/account pair.
    #[must_use]
    pub fn with_credential(mut self, service: impl Into<String>, name: impl Into<String>) -> Self {
        self.credential_service = service.into();
        self.credential_name = name.into();
        self
    }

    /// Override the mount root (must match the disk image service's).
    #[must_use]
    pub fn with_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.mount_root = root.into();
        self
    }

    /// Override the migration progress cadence.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    /// Full path of the manifest document.
    pub fn manifest_path(&self) -> PathBuf {
        self.support_dir.join(&self.manifest_file_name)
    }

    /// The plaintext support directory.
    pub fn support_dir(&self) -> &Path {
        &self.support_dir
    }
}
