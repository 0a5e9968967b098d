//! Shared fixtures for vault integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use slidr_diskimage::testing::FakeDiskImageService;
use slidr_vault::{
    DriveType, MediaCatalog, MemoryCredentialStore, MigrationDirection, MigrationItem,
    StorageLocation, VaultConfiguration, VaultContext, VaultService,
};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const TEST_PASSWORD: &str = "correcthorse1";

pub fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

/// Install a log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scratch layout: `library/` (plaintext), `Volumes/` (mount root),
/// `support/` (manifest) and `ExternalDrive/` (a removable drive).
pub struct Harness {
    pub dir: TempDir,
    pub images: Arc<FakeDiskImageService>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub service: Arc<VaultService>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mounts = dir.path().join("Volumes");
        std::fs::create_dir_all(dir.path().join("library")).unwrap();
        std::fs::create_dir_all(dir.path().join("ExternalDrive")).unwrap();

        let images = Arc::new(FakeDiskImageService::new(&mounts).with_volume_uuid("TEST-UUID"));
        let credentials = Arc::new(MemoryCredentialStore::new());
        let context = VaultContext::new(dir.path().join("support")).with_mount_root(&mounts);
        let service = Arc::new(VaultService::new(
            context,
            images.clone(),
            credentials.clone(),
        ));
        Self {
            dir,
            images,
            credentials,
            service,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn library(&self) -> PathBuf {
        self.path("library")
    }

    pub fn external_drive(&self) -> PathBuf {
        self.path("ExternalDrive")
    }

    pub async fn local_vault(&self, password: &str) -> VaultConfiguration {
        self.service
            .create_vault(
                "Local Vault",
                &self.path("v.bundle"),
                &secret(password),
                DriveType::Local,
            )
            .await
            .unwrap()
    }

    pub async fn external_vault(&self, name: &str, password: &str) -> VaultConfiguration {
        self.service
            .create_vault(
                name,
                &self.external_drive().join(format!("{name}.bundle")),
                &secret(password),
                DriveType::External,
            )
            .await
            .unwrap()
    }

    /// Simulate unplugging the external drive.
    pub fn eject_external_drive(&self) {
        std::fs::rename(self.external_drive(), self.path("ExternalDrive-ejected")).unwrap();
    }

    pub fn reconnect_external_drive(&self) {
        std::fs::rename(self.path("ExternalDrive-ejected"), self.external_drive()).unwrap();
    }
}

pub fn write_file(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Every regular file under `root`, keyed by path relative to `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, std::fs::read(entry.path()).unwrap())
        })
        .collect()
}

/// In-memory stand-in for the persistence layer.
#[derive(Default)]
pub struct MockCatalog {
    items: Vec<MigrationItem>,
    pub state: Mutex<CatalogState>,
}

#[derive(Debug, Default)]
pub struct CatalogState {
    pub open: bool,
    pub database: Option<PathBuf>,
    pub recorded: Vec<(MigrationItem, MigrationDirection)>,
}

impl MockCatalog {
    pub fn new(items: Vec<MigrationItem>) -> Self {
        Self {
            items,
            state: Mutex::new(CatalogState {
                open: true,
                ..CatalogState::default()
            }),
        }
    }
}

#[async_trait]
impl MediaCatalog for MockCatalog {
    async fn fetch_items(&self, location: StorageLocation) -> slidr_vault::Result<Vec<MigrationItem>> {
        assert!(self.state.lock().open, "catalog read after release");
        Ok(self
            .items
            .iter()
            .filter(|item| item.location == location)
            .cloned()
            .collect())
    }

    async fn release(&self) -> slidr_vault::Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn reopen(&self, database: &Path) -> slidr_vault::Result<()> {
        assert!(database.exists(), "reopened a missing database");
        let mut state = self.state.lock();
        state.open = true;
        state.database = Some(database.to_path_buf());
        Ok(())
    }

    async fn record_migrated(
        &self,
        items: &[MigrationItem],
        direction: MigrationDirection,
    ) -> slidr_vault::Result<()> {
        self.state
            .lock()
            .recorded
            .extend(items.iter().cloned().map(|item| (item, direction)));
        Ok(())
    }
}
