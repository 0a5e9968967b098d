//! Turning vault mode on and off.
//!
//! These compose the service and migration primitives in the order the
//! setup wizard runs them. Both leave the application expected to restart
//! so the data layer reopens from the new database location.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{Result, VaultError};
use crate::manifest::{DriveType, VaultConfiguration};
use crate::migration::{
    LibraryLayout, MediaCatalog, MigrationDirection, MigrationOrchestrator, MigrationReport,
    MigrationRoots, RootPair, StorageLocation, database_destination, remaining_files,
};
use crate::service::VaultService;

/// Display name of the vault created for the local library.
pub const LOCAL_VAULT_NAME: &str = "Local Vault";

/// The plaintext library a flow operates on.
#[derive(Debug, Clone)]
pub struct LibrarySpec {
    /// Plaintext library root on the startup disk
    pub root: PathBuf,
    /// Database and cache locations relative to `root`
    pub layout: LibraryLayout,
    /// External library to restore alongside the local one
    pub external: Option<ExternalLibrary>,
}

/// An external library and the vault holding it.
#[derive(Debug, Clone)]
pub struct ExternalLibrary {
    /// Registered id of the external vault
    pub vault_id: String,
    /// Plaintext library root on the external drive
    pub root: PathBuf,
}

/// Encrypt the local library into a new (or previously created) local vault.
///
/// Creates the container at `container` unless a local vault already exists
/// there, mounts it, migrates the library in and unmounts it again.
pub async fn enable_vault_mode<F>(
    service: &VaultService,
    catalog: &dyn MediaCatalog,
    library: &LibrarySpec,
    container: PathBuf,
    password: &SecretString,
    progress: F,
) -> Result<(VaultConfiguration, MigrationReport)>
where
    F: FnMut(usize, usize) + Send,
{
    let items = catalog.fetch_items(StorageLocation::Local).await?;

    let config = match service.local_vault().await? {
        Some(existing) if existing.container_path == container => {
            tracing::info!("Resuming vault setup with existing vault '{}'", existing.name);
            existing
        }
        Some(existing) => return Err(VaultError::LocalVaultExists(existing.container_path)),
        None => {
            service
                .create_vault(LOCAL_VAULT_NAME, &container, password, DriveType::Local)
                .await?
        }
    };

    let mount_point = service.mount_vault(&config.id, password).await?;
    let roots = MigrationRoots::local(&library.root, &mount_point);

    catalog.release().await?;
    let report = MigrationOrchestrator::new(service.context())
        .migrate(
            &items,
            &library.layout,
            &roots,
            MigrationDirection::IntoVault,
            progress,
        )
        .await?;

    catalog
        .reopen(&database_destination(
            &library.layout,
            &roots,
            MigrationDirection::IntoVault,
        ))
        .await?;
    catalog
        .record_migrated(&report.moved_items, MigrationDirection::IntoVault)
        .await?;
    catalog.release().await?;

    service.unmount_vault(&config.id).await?;
    tracing::info!("Vault mode enabled with vault '{}'", config.name);
    Ok((config, report))
}

/// Decrypt the library back to plaintext and remove vault mode.
///
/// `password` is checked against every vault taking part, even ones that
/// are already unlocked. After the migration each of them is destroyed,
/// unless a file is still inside one; then [`VaultError::VaultNotEmpty`] is
/// returned and nothing is destroyed. The manifest and the stored password
/// are deleted only when no vault is left registered; otherwise
/// [`VaultError::VaultsStillRegistered`] is returned and the remaining
/// vaults are untouched.
pub async fn disable_vault_mode<F>(
    service: &VaultService,
    catalog: &dyn MediaCatalog,
    library: &LibrarySpec,
    password: &SecretString,
    progress: F,
) -> Result<MigrationReport>
where
    F: FnMut(usize, usize) + Send,
{
    let Some(local) = service.local_vault().await? else {
        return finish_teardown(service).await.map(|()| MigrationReport::default());
    };

    let local_mount = service.mount_vault(&local.id, password).await?;
    let mut roots = MigrationRoots::local(&library.root, &local_mount);
    let mut participants = vec![local.id.clone()];

    let mut items = catalog.fetch_items(StorageLocation::Local).await?;
    if let Some(external) = &library.external {
        let mount_point = service.mount_vault(&external.vault_id, password).await?;
        roots = roots.with_external(RootPair::new(&external.root, mount_point));
        participants.push(external.vault_id.clone());
        items.extend(catalog.fetch_items(StorageLocation::External).await?);
    }

    catalog.release().await?;
    let report = MigrationOrchestrator::new(service.context())
        .migrate(
            &items,
            &library.layout,
            &roots,
            MigrationDirection::OutOfVault,
            progress,
        )
        .await?;

    catalog
        .reopen(&database_destination(
            &library.layout,
            &roots,
            MigrationDirection::OutOfVault,
        ))
        .await?;
    catalog
        .record_migrated(&report.moved_items, MigrationDirection::OutOfVault)
        .await?;

    // Destroying a container deletes whatever is still in it
    for pair in roots.pairs() {
        let remaining = remaining_files(&pair.vault).await?;
        if !remaining.is_empty() {
            tracing::error!(
                "{} file(s) not migrated out of {}, keeping the vault",
                remaining.len(),
                pair.vault.display()
            );
            return Err(VaultError::VaultNotEmpty {
                mount_point: pair.vault.clone(),
                remaining,
            });
        }
    }

    for id in &participants {
        service.destroy_vault(id).await?;
    }
    finish_teardown(service).await?;
    Ok(report)
}

async fn finish_teardown(service: &VaultService) -> Result<()> {
    let remaining = service.registry().load().await?.vaults.len();
    if remaining > 0 {
        tracing::warn!("{} vault(s) still registered, keeping the manifest", remaining);
        return Err(VaultError::VaultsStillRegistered(remaining));
    }

    service.registry().delete_manifest().await?;
    if let Err(e) = service.forget_stored_password() {
        tracing::warn!("Failed to remove vault password from keychain: {}", e);
    }
    tracing::info!("Vault mode disabled");
    Ok(())
}
