//! Encrypted vault mode for the Slidr media library.
//!
//! A vault is an encrypted, password-protected container (see
//! [`slidr_diskimage`]) registered in a plaintext manifest. Vault mode moves
//! the library's database, caches and media files into vaults and back
//! again, keeps one shared password valid for every registered container,
//! and locks vaults automatically when the host sleeps or goes idle.
//!
//! # Components
//!
//! - [`CredentialStore`] - keychain storage for the shared password
//! - [`VaultRegistry`] / [`VaultManifest`] - the durable vault registry
//! - [`VaultService`] - create, mount, unmount and rekey vaults
//! - [`MigrationOrchestrator`] - move a library into or out of a vault
//! - [`AutoLockPolicy`] - lock on sleep, screensaver or inactivity
//! - [`flows`] - the enable/disable vault mode sequences
//!
//! Everything is configured through one explicit [`VaultContext`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use secrecy::SecretString;
//! use slidr_diskimage::HdiutilService;
//! use slidr_vault::{DriveType, KeychainCredentialStore, VaultContext, VaultService};
//!
//! # async fn run() -> slidr_vault::Result<()> {
//! let context = VaultContext::discover()?;
//! let credentials = KeychainCredentialStore::new(context.credential_service.clone());
//! let service = VaultService::new(
//!     context,
//!     Arc::new(HdiutilService::new()),
//!     Arc::new(credentials),
//! );
//!
//! let password = SecretString::from("correcthorse1".to_owned());
//! let vault = service
//!     .create_vault(
//!         "Local Vault",
//!         "/Users/me/Slidr.sparsebundle".as_ref(),
//!         &password,
//!         DriveType::Local,
//!     )
//!     .await?;
//! let mount_point = service.mount_vault(&vault.id, &password).await?;
//! println!("Vault unlocked at {}", mount_point.display());
//! service.unmount_vault(&vault.id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod autolock;
mod context;
mod credential;
mod error;
pub mod flows;
mod manifest;
pub mod migration;
mod registry;
mod service;

pub use autolock::{AutoLockPolicy, HostEvent, LockReport, LockTrigger};
pub use context::{
    DEFAULT_CREDENTIAL_NAME, DEFAULT_CREDENTIAL_SERVICE, DEFAULT_PROGRESS_INTERVAL,
    MANIFEST_FILE_NAME, SUPPORT_DIR_ENV, VaultContext,
};
pub use credential::{
    CredentialError, CredentialStore, KeychainCredentialStore, MemoryCredentialStore,
};
pub use error::{FailureCategory, Result, VaultError};
pub use manifest::{DriveType, SecurityPolicy, VaultConfiguration, VaultManifest};
pub use migration::{
    LibraryLayout, MediaCatalog, MigrationDirection, MigrationItem, MigrationOrchestrator,
    MigrationReport, MigrationRoots, RootPair, StorageLocation,
};
pub use registry::VaultRegistry;
pub use service::{UnmountFailure, VaultService, VaultState};
