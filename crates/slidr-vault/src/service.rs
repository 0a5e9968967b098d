//! Vault lifecycle orchestration.
//!
//! [`VaultService`] ties the disk image facility, the manifest and the
//! credential store together: it creates and registers containers, mounts
//! and unmounts them, and rotates the shared password across every
//! registered container without ever leaving them on different passwords.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use slidr_diskimage::{DiskImageError, DiskImageService};

use crate::context::VaultContext;
use crate::credential::CredentialStore;
use crate::error::{Result, VaultError};
use crate::manifest::{DriveType, SecurityPolicy, VaultConfiguration};
use crate::registry::VaultRegistry;

/// Runtime state of one registered vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultState {
    /// Unlocked and mounted
    Attached {
        /// Live mount point
        mount_point: PathBuf,
    },
    /// Locked
    Detached,
    /// The drive holding the container is not connected
    HostDriveUnavailable,
}

/// A vault that could not be unmounted by [`VaultService::unmount_all`].
#[derive(Debug)]
pub struct UnmountFailure {
    /// Vault id
    pub id: String,
    /// Vault display name
    pub name: String,
    /// Why the unmount failed
    pub error: VaultError,
}

/// Orchestrates vault containers, the manifest and the shared password.
pub struct VaultService {
    images: Arc<dyn DiskImageService>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<VaultRegistry>,
    context: VaultContext,
}

impl std::fmt::Debug for VaultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultService")
            .field("registry", &self.registry)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl VaultService {
    /// Build a service over the given collaborators.
    pub fn new(
        context: VaultContext,
        images: Arc<dyn DiskImageService>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let registry = Arc::new(VaultRegistry::new(&context));
        Self::with_registry(context, images, credentials, registry)
    }

    /// Build a service sharing an existing registry.
    pub fn with_registry(
        context: VaultContext,
        images: Arc<dyn DiskImageService>,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<VaultRegistry>,
    ) -> Self {
        Self {
            images,
            credentials,
            registry,
            context,
        }
    }

    /// The manifest registry.
    pub fn registry(&self) -> &Arc<VaultRegistry> {
        &self.registry
    }

    /// The configuration this service was built with.
    pub fn context(&self) -> &VaultContext {
        &self.context
    }

    /// Current security policy.
    pub async fn policy(&self) -> Result<SecurityPolicy> {
        Ok(self.registry.load().await?.policy())
    }

    async fn require(&self, id: &str) -> Result<VaultConfiguration> {
        self.registry
            .find(id)
            .await?
            .ok_or_else(|| VaultError::VaultNotFound(id.to_owned()))
    }

    /// Create a new container and register it.
    ///
    /// If registration fails after the container was created, the container
    /// is left on disk and the registry error is returned, so the caller can
    /// retry with [`add_vault`](Self::add_vault) or clean up by hand.
    pub async fn create_vault(
        &self,
        name: &str,
        container: &Path,
        password: &SecretString,
        drive_type: DriveType,
    ) -> Result<VaultConfiguration> {
        if drive_type == DriveType::Local {
            if let Some(existing) = self.registry.local_vault().await? {
                return Err(VaultError::LocalVaultExists(existing.container_path));
            }
        }

        tracing::info!(
            "Creating {} vault '{}' at {}",
            drive_type.display_name().to_lowercase(),
            name,
            container.display()
        );
        let seed = self.images.create(name, container, password).await?;
        let config = VaultConfiguration::from_seed(name, seed, drive_type);

        let registered = config.clone();
        let use_keychain = match self
            .registry
            .update(move |manifest| {
                manifest.add(registered)?;
                Ok(manifest.policy().use_keychain)
            })
            .await
        {
            Ok(use_keychain) => use_keychain,
            Err(e) => {
                tracing::error!(
                    "Vault container {} was created but could not be registered: {}",
                    config.container_path.display(),
                    e
                );
                return Err(e);
            }
        };

        if use_keychain {
            self.remember_password(password);
        }
        tracing::info!("Registered vault '{}' ({})", config.name, config.id);
        Ok(config)
    }

    /// Register an existing container.
    pub async fn add_vault(&self, config: VaultConfiguration) -> Result<()> {
        let id = config.id.clone();
        self.registry.update(move |manifest| manifest.add(config)).await?;
        tracing::info!("Added vault {} to manifest", id);
        Ok(())
    }

    /// Unlock and mount a vault, returning its mount point.
    ///
    /// Mounting an already-mounted vault returns the existing mount point
    /// once `password` has been checked against the container.
    pub async fn mount_vault(&self, id: &str, password: &SecretString) -> Result<PathBuf> {
        let config = self.require(id).await?;

        if let Some(mount_point) = self.images.resolve_mount_point(&config.container_path).await? {
            self.images
                .verify_password(&config.container_path, password)
                .await?;
            tracing::debug!("Vault '{}' already mounted at {}", config.name, mount_point.display());
            return Ok(mount_point);
        }

        match self.images.attach(&config.container_path, password).await {
            Ok(mount_point) => {
                tracing::info!("Mounted vault '{}' at {}", config.name, mount_point.display());
                Ok(mount_point)
            }
            Err(DiskImageError::AlreadyAttached(_)) => self
                .images
                .resolve_mount_point(&config.container_path)
                .await?
                .ok_or(VaultError::AlreadyAttached(config.container_path)),
            Err(e) => {
                tracing::warn!("Failed to mount vault '{}': {}", config.name, e);
                Err(e.into())
            }
        }
    }

    /// Mount a vault with the password mirrored in the keychain.
    pub async fn mount_with_stored_credential(&self, id: &str) -> Result<PathBuf> {
        let password = self.stored_password().await?;
        self.mount_vault(id, &password).await
    }

    /// The shared password from the keychain, when the policy allows it.
    pub async fn stored_password(&self) -> Result<SecretString> {
        if !self.policy().await?.use_keychain {
            return Err(VaultError::NoStoredCredential);
        }
        self.credentials
            .load(&self.context.credential_name)?
            .ok_or(VaultError::NoStoredCredential)
    }

    /// Lock a vault. Unmounting a vault that is not mounted succeeds.
    pub async fn unmount_vault(&self, id: &str) -> Result<()> {
        self.detach_vault(id, false).await
    }

    /// Lock a vault even if files on it are still open.
    ///
    /// This is the cleanup primitive for abandoned sessions.
    pub async fn force_unmount_vault(&self, id: &str) -> Result<()> {
        self.detach_vault(id, true).await
    }

    async fn detach_vault(&self, id: &str, force: bool) -> Result<()> {
        let config = self.require(id).await?;
        self.detach_config(&config, force).await
    }

    async fn detach_config(&self, config: &VaultConfiguration, force: bool) -> Result<()> {
        let Some(mount_point) = self.images.resolve_mount_point(&config.container_path).await?
        else {
            tracing::debug!("Vault '{}' is not mounted", config.name);
            return Ok(());
        };

        self.images.detach(&mount_point, force).await?;
        tracing::info!(
            "Unmounted vault '{}' from {}{}",
            config.name,
            mount_point.display(),
            if force { " (forced)" } else { "" }
        );
        Ok(())
    }

    /// Unmount every registered vault, best-effort.
    ///
    /// Returns the vaults that could not be unmounted; an error is only
    /// returned when the manifest itself cannot be read.
    pub async fn unmount_all(&self, force: bool) -> Result<Vec<UnmountFailure>> {
        let manifest = self.registry.load().await?;
        let mut failures = Vec::new();

        for config in &manifest.vaults {
            if let Err(error) = self.detach_config(config, force).await {
                tracing::warn!("Failed to unmount vault '{}': {}", config.name, error);
                failures.push(UnmountFailure {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    error,
                });
            }
        }
        Ok(failures)
    }

    /// Rotate the shared password on every registered container.
    ///
    /// Containers are rotated in registration order. On the first failure
    /// every container already rotated is switched back to `old` before the
    /// error is returned. The keychain is updated only after all containers
    /// accepted `new`.
    ///
    /// # Errors
    ///
    /// - The first rotation failure, after a successful rollback
    /// - [`VaultError::RotationRollbackFailed`] if some container could not
    ///   be switched back
    /// - [`VaultError::Credential`] if the containers were rotated but the
    ///   keychain could not be updated
    pub async fn change_all_passwords(&self, old: &SecretString, new: &SecretString) -> Result<()> {
        let manifest = self.registry.load().await?;
        tracing::info!("Changing password on {} vault(s)", manifest.vaults.len());

        let mut rotated: Vec<&VaultConfiguration> = Vec::with_capacity(manifest.vaults.len());
        for config in &manifest.vaults {
            if let Err(e) = self
                .images
                .change_password(&config.container_path, old, new)
                .await
            {
                let cause = VaultError::from(e);
                tracing::warn!(
                    "Password change failed for vault '{}': {}; rolling back {} vault(s)",
                    config.name,
                    cause,
                    rotated.len()
                );
                return Err(self.roll_back(&rotated, old, new, cause).await);
            }
            tracing::debug!("Changed password for vault '{}'", config.name);
            rotated.push(config);
        }

        if manifest.policy().use_keychain {
            self.credentials.save(&self.context.credential_name, new)?;
        }
        tracing::info!("Password changed on all vaults");
        Ok(())
    }

    async fn roll_back(
        &self,
        rotated: &[&VaultConfiguration],
        old: &SecretString,
        new: &SecretString,
        cause: VaultError,
    ) -> VaultError {
        let mut stranded = Vec::new();
        for config in rotated.iter().rev() {
            if let Err(e) = self
                .images
                .change_password(&config.container_path, new, old)
                .await
            {
                tracing::error!(
                    "Failed to restore the previous password on vault '{}': {}",
                    config.name,
                    e
                );
                stranded.push(config.name.clone());
            }
        }

        if stranded.is_empty() {
            cause
        } else {
            VaultError::RotationRollbackFailed {
                cause: Box::new(cause),
                stranded,
            }
        }
    }

    /// Change a vault's maximum size.
    pub async fn resize_vault(
        &self,
        id: &str,
        password: &SecretString,
        max_bytes: u64,
    ) -> Result<()> {
        let config = self.require(id).await?;
        self.images
            .resize(&config.container_path, password, max_bytes)
            .await?;
        tracing::info!("Resized vault '{}' to {} bytes", config.name, max_bytes);
        Ok(())
    }

    /// Detach a vault, delete its container and unregister it.
    ///
    /// Only the disable-vault-mode flow calls this, after the vault's
    /// contents have been migrated back to plaintext.
    pub async fn destroy_vault(&self, id: &str) -> Result<VaultConfiguration> {
        let config = self.require(id).await?;
        if !self.images.is_host_available(&config.container_path) {
            return Err(VaultError::HostDriveUnavailable(config.container_path));
        }

        self.detach_config(&config, true).await?;
        remove_container(&config.container_path).await?;
        self.registry.remove(id).await?;
        tracing::info!(
            "Destroyed vault '{}' at {}",
            config.name,
            config.container_path.display()
        );
        Ok(config)
    }

    /// Enable or soft-disable a vault.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.registry
            .update(|manifest| {
                manifest
                    .find_mut(id)
                    .ok_or_else(|| VaultError::VaultNotFound(id.to_owned()))?
                    .set_enabled(enabled);
                Ok(())
            })
            .await
    }

    /// Replace the security policy.
    ///
    /// Turning the keychain off also removes the stored password.
    pub async fn update_policy(&self, policy: SecurityPolicy) -> Result<()> {
        self.registry
            .update(|manifest| {
                manifest.use_keychain = Some(policy.use_keychain);
                manifest.auto_lock_on_sleep = Some(policy.auto_lock_on_sleep);
                manifest.auto_lock_on_screensaver = Some(policy.auto_lock_on_screensaver);
                manifest.lock_timeout_minutes = policy.lock_timeout.map(|timeout| {
                    u32::try_from(timeout.as_secs().div_ceil(60)).unwrap_or(u32::MAX)
                });
                Ok(())
            })
            .await?;

        if !policy.use_keychain {
            self.forget_stored_password()?;
        }
        Ok(())
    }

    /// Remove the shared password from the keychain.
    pub fn forget_stored_password(&self) -> Result<()> {
        self.credentials.delete(&self.context.credential_name)?;
        Ok(())
    }

    fn remember_password(&self, password: &SecretString) {
        if let Err(e) = self.credentials.save(&self.context.credential_name, password) {
            tracing::warn!("Failed to save vault password to keychain: {}", e);
        }
    }

    /// Runtime state of every registered vault, in registration order.
    ///
    /// Recovers mount state after an unclean shutdown: the manifest only
    /// stores mount point names, so live mount points are resolved from
    /// the host.
    pub async fn vault_states(&self) -> Result<Vec<(VaultConfiguration, VaultState)>> {
        let manifest = self.registry.load().await?;
        let mut states = Vec::with_capacity(manifest.vaults.len());

        for config in manifest.vaults {
            let state = if !self.images.is_host_available(&config.container_path) {
                VaultState::HostDriveUnavailable
            } else {
                match self.images.resolve_mount_point(&config.container_path).await? {
                    Some(mount_point) => VaultState::Attached { mount_point },
                    None => VaultState::Detached,
                }
            };
            states.push((config, state));
        }
        Ok(states)
    }

    /// Where `config` is mounted by default under the context's mount root.
    ///
    /// The host may pick a different path if the name is taken; use
    /// [`vault_states`](Self::vault_states) for the live mount point.
    pub fn expected_mount_point(&self, config: &VaultConfiguration) -> PathBuf {
        config.expected_mount_point(&self.context.mount_root)
    }

    /// The local vault, if one is registered.
    pub async fn local_vault(&self) -> Result<Option<VaultConfiguration>> {
        self.registry.local_vault().await
    }

    /// Vaults on external drives.
    pub async fn external_vaults(&self) -> Result<Vec<VaultConfiguration>> {
        self.registry.external_vaults().await
    }
}

/// Containers are bundles (directories) on the host; plain image files are
/// accepted too.
async fn remove_container(path: &Path) -> Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Vault container {} already removed", path.display());
            Ok(())
        }
        Err(e) => Err(VaultError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemoryCredentialStore;
    use secrecy::ExposeSecret;
    use slidr_diskimage::testing::FakeDiskImageService;
    use std::time::Duration;
    use tempfile::TempDir;

    const DEFAULT_NAME: &str = crate::context::DEFAULT_CREDENTIAL_NAME;

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        images: Arc<FakeDiskImageService>,
        credentials: Arc<MemoryCredentialStore>,
        service: VaultService,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let mounts = root.join("Volumes");
        let images = Arc::new(FakeDiskImageService::new(&mounts));
        let credentials = Arc::new(MemoryCredentialStore::new());
        let context = VaultContext::new(root.join("support")).with_mount_root(&mounts);
        let service = VaultService::new(context, images.clone(), credentials.clone());
        Harness {
            _dir: dir,
            root,
            images,
            credentials,
            service,
        }
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_owned())
    }

    #[tokio::test]
    async fn test_create_registers_and_mirrors_password() {
        let h = harness();
        let config = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();

        assert_eq!(h.service.local_vault().await.unwrap(), Some(config));
        let stored = h.credentials.load(DEFAULT_NAME).unwrap().unwrap();
        assert_eq!(stored.expose_secret(), "pw");
    }

    #[tokio::test]
    async fn test_second_local_vault_rejected_before_creating_container() {
        let h = harness();
        h.service
            .create_vault("Local Vault", &h.root.join("a.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();

        let err = h
            .service
            .create_vault("Again", &h.root.join("b.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::LocalVaultExists(_)));
        assert!(!h.root.join("b.bundle").exists());
    }

    #[tokio::test]
    async fn test_unmount_is_idempotent() {
        let h = harness();
        let config = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();

        h.service.unmount_vault(&config.id).await.unwrap();
        h.service.mount_vault(&config.id, &secret("pw")).await.unwrap();
        h.service.unmount_vault(&config.id).await.unwrap();
        h.service.unmount_vault(&config.id).await.unwrap();
        assert_eq!(h.images.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_vault_needs_force() {
        let h = harness();
        let config = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();
        let mount_point = h.service.mount_vault(&config.id, &secret("pw")).await.unwrap();
        h.images.hold_open(&mount_point);

        let err = h.service.unmount_vault(&config.id).await.unwrap_err();
        assert!(matches!(err, VaultError::DeviceBusy(_)));

        h.service.force_unmount_vault(&config.id).await.unwrap();
        assert_eq!(h.images.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_mount_with_stored_credential() {
        let h = harness();
        let config = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();
        h.service
            .mount_with_stored_credential(&config.id)
            .await
            .unwrap();

        let policy = SecurityPolicy {
            use_keychain: false,
            ..SecurityPolicy::default()
        };
        h.service.update_policy(policy).await.unwrap();
        assert!(!h.credentials.contains(DEFAULT_NAME));
        let err = h
            .service
            .mount_with_stored_credential(&config.id)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NoStoredCredential));
    }

    #[tokio::test]
    async fn test_update_policy_round_trips_timeout() {
        let h = harness();
        let policy = SecurityPolicy {
            auto_lock_on_screensaver: true,
            lock_timeout: Some(Duration::from_secs(5 * 60)),
            ..SecurityPolicy::default()
        };
        h.service.update_policy(policy).await.unwrap();
        assert_eq!(h.service.policy().await.unwrap(), policy);
    }

    #[tokio::test]
    async fn test_vault_states_and_set_enabled() {
        let h = harness();
        let local = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();
        let mount_point = h.service.mount_vault(&local.id, &secret("pw")).await.unwrap();
        assert_eq!(mount_point, h.service.expected_mount_point(&local));

        h.service.set_enabled(&local.id, false).await.unwrap();
        let states = h.service.vault_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert!(!states[0].0.is_enabled());
        assert_eq!(states[0].1, VaultState::Attached { mount_point });

        let err = h.service.set_enabled("missing", true).await.unwrap_err();
        assert!(matches!(err, VaultError::VaultNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_removes_container_and_registration() {
        let h = harness();
        let config = h
            .service
            .create_vault("Local Vault", &h.root.join("v.bundle"), &secret("pw"), DriveType::Local)
            .await
            .unwrap();
        h.service.mount_vault(&config.id, &secret("pw")).await.unwrap();

        h.service.destroy_vault(&config.id).await.unwrap();
        assert!(!config.container_path.exists());
        assert!(h.service.local_vault().await.unwrap().is_none());
        assert_eq!(h.images.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_vault() {
        let h = harness();
        let err = h.service.mount_vault("nope", &secret("pw")).await.unwrap_err();
        assert!(matches!(err, VaultError::VaultNotFound(_)));
    }
}
