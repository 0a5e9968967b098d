//! The vault manifest: every registered container plus security policy.
//!
//! The manifest is stored as plaintext JSON outside every vault, because it
//! is what tells the application that vaults exist before any of them is
//! unlocked. Policy fields are optional in the document; [`SecurityPolicy`]
//! resolves them to concrete values when read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slidr_diskimage::ContainerSeed;

use crate::error::{Result, VaultError};

/// Where a vault container physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    /// The startup disk
    Local,
    /// A removable drive
    External,
}

impl DriveType {
    /// Get a user-friendly display name
    pub fn display_name(self) -> &'static str {
        match self {
            DriveType::Local => "Local",
            DriveType::External => "External",
        }
    }
}

/// One registered encrypted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfiguration {
    /// Unique identifier, never reused
    pub id: String,
    /// User-friendly display name
    pub name: String,
    /// Absolute path of the container file on its host volume
    pub container_path: PathBuf,
    /// Volume name the container attaches under.
    ///
    /// Only the name is stored; the mount root can change between sessions.
    pub mount_point_name: String,
    /// Local or external drive
    pub drive_type: DriveType,
    /// Identifier of the physical volume holding the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_uuid: Option<String>,
    /// When the container was created
    pub created_date: DateTime<Utc>,
    /// Soft-disable flag (absent means enabled)
    #[serde(default, rename = "isEnabled", skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
}

impl VaultConfiguration {
    /// Build a configuration for a freshly created container.
    pub fn from_seed(name: impl Into<String>, seed: ContainerSeed, drive_type: DriveType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            container_path: seed.container_path,
            mount_point_name: seed.mount_point_name,
            drive_type,
            volume_uuid: seed.volume_uuid,
            created_date: Utc::now(),
            enabled: None,
        }
    }

    /// Whether the vault takes part in auto-mount and auto-lock.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Enable or soft-disable the vault.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = Some(enabled);
    }

    /// Where the container would be mounted under `mount_root`.
    pub fn expected_mount_point(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(&self.mount_point_name)
    }
}

/// Resolved security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Mirror the shared password into the keychain
    pub use_keychain: bool,
    /// Lock every vault when the host goes to sleep
    pub auto_lock_on_sleep: bool,
    /// Lock every vault when the screensaver starts
    pub auto_lock_on_screensaver: bool,
    /// Lock after this much inactivity
    pub lock_timeout: Option<Duration>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            use_keychain: true,
            auto_lock_on_sleep: true,
            auto_lock_on_screensaver: false,
            lock_timeout: None,
        }
    }
}

impl SecurityPolicy {
    /// Resolve a manifest's optional policy fields against the defaults.
    pub fn resolve(manifest: &VaultManifest) -> Self {
        let defaults = Self::default();
        Self {
            use_keychain: manifest.use_keychain.unwrap_or(defaults.use_keychain),
            auto_lock_on_sleep: manifest
                .auto_lock_on_sleep
                .unwrap_or(defaults.auto_lock_on_sleep),
            auto_lock_on_screensaver: manifest
                .auto_lock_on_screensaver
                .unwrap_or(defaults.auto_lock_on_screensaver),
            lock_timeout: manifest
                .lock_timeout_minutes
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(u64::from(m) * 60)),
        }
    }
}

/// Registry root document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultManifest {
    /// Schema version for future migrations
    #[serde(default = "default_version")]
    pub version: u32,
    /// Registered vaults in registration order
    #[serde(default)]
    pub vaults: Vec<VaultConfiguration>,
    /// Mirror the shared password into the keychain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_keychain: Option<bool>,
    /// Lock on host sleep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_lock_on_sleep: Option<bool>,
    /// Lock on screensaver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_lock_on_screensaver: Option<bool>,
    /// Idle timeout in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_minutes: Option<u32>,
}

fn default_version() -> u32 {
    1
}

impl Default for VaultManifest {
    fn default() -> Self {
        Self {
            version: default_version(),
            vaults: Vec::new(),
            use_keychain: None,
            auto_lock_on_sleep: None,
            auto_lock_on_screensaver: None,
            lock_timeout_minutes: None,
        }
    }
}

impl VaultManifest {
    /// Resolved security policy.
    pub fn policy(&self) -> SecurityPolicy {
        SecurityPolicy::resolve(self)
    }

    /// True when no vault has ever been registered (or all were destroyed).
    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Find a vault by ID
    pub fn find(&self, id: &str) -> Option<&VaultConfiguration> {
        self.vaults.iter().find(|v| v.id == id)
    }

    /// Find a vault by ID (mutable)
    pub fn find_mut(&mut self, id: &str) -> Option<&mut VaultConfiguration> {
        self.vaults.iter_mut().find(|v| v.id == id)
    }

    /// Register a vault.
    ///
    /// Rejects a second local vault. Re-adding a configuration with a known
    /// id replaces nothing and is a no-op.
    pub fn add(&mut self, config: VaultConfiguration) -> Result<()> {
        if self.find(&config.id).is_some() {
            tracing::debug!("Vault {} already registered", config.id);
            return Ok(());
        }
        if config.drive_type == DriveType::Local {
            if let Some(existing) = self.local_vault() {
                return Err(VaultError::LocalVaultExists(existing.container_path.clone()));
            }
        }
        self.vaults.push(config);
        Ok(())
    }

    /// Remove a vault configuration by ID
    pub fn remove(&mut self, id: &str) -> Option<VaultConfiguration> {
        let index = self.vaults.iter().position(|v| v.id == id)?;
        Some(self.vaults.remove(index))
    }

    /// The local vault, if one is registered.
    pub fn local_vault(&self) -> Option<&VaultConfiguration> {
        self.vaults.iter().find(|v| v.drive_type == DriveType::Local)
    }

    /// All vaults on external drives, in registration order.
    pub fn external_vaults(&self) -> Vec<&VaultConfiguration> {
        self.vaults
            .iter()
            .filter(|v| v.drive_type == DriveType::External)
            .collect()
    }
}
