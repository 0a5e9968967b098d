//! Durable storage for the vault manifest.
//!
//! The manifest is a single-writer resource. Every mutation goes through
//! [`VaultRegistry::update`], which serializes writers in-process with an
//! async mutex and across processes with an advisory lock on a sibling
//! `.lock` file, then reads, mutates and atomically replaces the document.

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::sync::Mutex;

use crate::context::VaultContext;
use crate::error::{Result, VaultError};
use crate::manifest::{VaultConfiguration, VaultManifest};

/// How long to wait for another process holding the manifest lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Owner of the on-disk [`VaultManifest`].
#[derive(Debug)]
pub struct VaultRegistry {
    manifest_path: PathBuf,
    lock_path: PathBuf,
    gate: Mutex<()>,
}

/// Exclusive advisory lock, released on drop.
struct ManifestLock {
    file: File,
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl VaultRegistry {
    /// Registry for the manifest described by `context`.
    pub fn new(context: &VaultContext) -> Self {
        Self::at(context.manifest_path())
    }

    /// Registry for a manifest at an explicit path.
    pub fn at(manifest_path: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        let lock_path = manifest_path.with_extension("lock");
        Self {
            manifest_path,
            lock_path,
            gate: Mutex::new(()),
        }
    }

    /// Path of the manifest document.
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Read the manifest.
    ///
    /// A missing document is not an error: it means vault mode was never
    /// configured, and an empty manifest is returned. A document that exists
    /// but does not parse is backed up and reported as
    /// [`VaultError::ManifestCorrupted`].
    pub async fn load(&self) -> Result<VaultManifest> {
        let _gate = self.gate.lock().await;
        self.read()
    }

    /// Replace the manifest wholesale.
    pub async fn save(&self, manifest: &VaultManifest) -> Result<()> {
        let _gate = self.gate.lock().await;
        let _lock = self.acquire_file_lock().await?;
        self.write(manifest)
    }

    /// Read-modify-write the manifest.
    ///
    /// The document is only written back when `mutator` succeeds. Concurrent
    /// callers are serialized; none of them observes a partial update.
    pub async fn update<F, R>(&self, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut VaultManifest) -> Result<R>,
    {
        let _gate = self.gate.lock().await;
        let _lock = self.acquire_file_lock().await?;

        let mut manifest = self.read()?;
        let result = mutator(&mut manifest)?;
        self.write(&manifest)?;
        Ok(result)
    }

    /// Look up a vault by id.
    pub async fn find(&self, id: &str) -> Result<Option<VaultConfiguration>> {
        Ok(self.load().await?.find(id).cloned())
    }

    /// Unregister a vault, returning its configuration if it was present.
    pub async fn remove(&self, id: &str) -> Result<Option<VaultConfiguration>> {
        self.update(|manifest| Ok(manifest.remove(id))).await
    }

    /// The local vault, if one is registered.
    pub async fn local_vault(&self) -> Result<Option<VaultConfiguration>> {
        Ok(self.load().await?.local_vault().cloned())
    }

    /// Vaults on external drives, in registration order.
    pub async fn external_vaults(&self) -> Result<Vec<VaultConfiguration>> {
        Ok(self
            .load()
            .await?
            .external_vaults()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Delete the manifest document. Only the disable-vault-mode flow calls
    /// this, after every container has been destroyed.
    pub async fn delete_manifest(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        {
            let _lock = self.acquire_file_lock().await?;
            match std::fs::remove_file(&self.manifest_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(VaultError::RegistryWriteFailed {
                        path: self.manifest_path.clone(),
                        source,
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.lock_path);
        tracing::info!("Deleted vault manifest {}", self.manifest_path.display());
        Ok(())
    }

    fn read(&self) -> Result<VaultManifest> {
        let contents = match std::fs::read_to_string(&self.manifest_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    "No vault manifest at {}, vault mode not configured",
                    self.manifest_path.display()
                );
                return Ok(VaultManifest::default());
            }
            Err(source) => {
                return Err(VaultError::ManifestUnreadable {
                    path: self.manifest_path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_str(&contents) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                tracing::error!(
                    "Failed to parse vault manifest {}: {}",
                    self.manifest_path.display(),
                    e
                );
                let backup_path = self.backup_corrupted(&contents);
                Err(VaultError::ManifestCorrupted {
                    path: self.manifest_path.clone(),
                    backup_path,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn backup_corrupted(&self, contents: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let stem = self
            .manifest_path
            .file_stem()
            .map_or_else(|| "vault_manifest".into(), |s| s.to_string_lossy());
        let backup_path = self
            .manifest_path
            .with_file_name(format!("{stem}.corrupted.{timestamp}.json"));

        match std::fs::write(&backup_path, contents) {
            Ok(()) => tracing::info!(
                "Created backup of corrupted vault manifest at {}",
                backup_path.display()
            ),
            Err(e) => tracing::error!(
                "Failed to back up corrupted vault manifest to {}: {}",
                backup_path.display(),
                e
            ),
        }
        backup_path
    }

    fn write(&self, manifest: &VaultManifest) -> Result<()> {
        let write_failed = |source| VaultError::RegistryWriteFailed {
            path: self.manifest_path.clone(),
            source,
        };

        let contents = serde_json::to_string_pretty(manifest)
            .map_err(io::Error::other)
            .map_err(write_failed)?;
        let tmp_path = self.manifest_path.with_extension("json.tmp");

        let mut file = File::create(&tmp_path).map_err(write_failed)?;
        file.write_all(contents.as_bytes()).map_err(write_failed)?;
        file.sync_all().map_err(write_failed)?;
        drop(file);

        if let Err(e) = std::fs::rename(&tmp_path, &self.manifest_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(write_failed(e));
        }

        tracing::debug!(
            "Saved vault manifest with {} vault(s) to {}",
            manifest.vaults.len(),
            self.manifest_path.display()
        );
        Ok(())
    }

    async fn acquire_file_lock(&self) -> Result<ManifestLock> {
        let write_failed = |source| VaultError::RegistryWriteFailed {
            path: self.lock_path.clone(),
            source,
        };

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failed)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(write_failed)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ManifestLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(VaultError::ManifestLockTimeout(self.lock_path.clone()));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(write_failed(e)),
            }
        }
    }
}
