//! What a migration moves, and between which roots.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relative_path::{Component, RelativePathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Storage-location class of a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    /// Inside the library directory on the startup disk
    Local,
    /// Under the library root on a removable drive
    External,
}

/// Which way a migration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Plaintext library into a mounted vault
    IntoVault,
    /// Mounted vault back to the plaintext library
    OutOfVault,
}

/// Validate a library-relative path.
///
/// Rejects absolute paths, empty paths and paths whose `..` components
/// would leave the library root.
pub fn library_path(raw: &str) -> Result<RelativePathBuf> {
    if raw.starts_with('/') || raw.starts_with('\\') || Path::new(raw).is_absolute() {
        return Err(VaultError::InvalidRelativePath(raw.to_owned()));
    }

    let path = RelativePathBuf::from(raw.to_owned());
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| VaultError::InvalidRelativePath(raw.to_owned()))?;
            }
        }
    }
    if depth == 0 {
        return Err(VaultError::InvalidRelativePath(raw.to_owned()));
    }
    Ok(path)
}

/// One media file the catalog says must move.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigrationItem {
    /// Path relative to the library root of its storage class
    pub relative_path: RelativePathBuf,
    /// Storage-location class
    pub location: StorageLocation,
}

impl MigrationItem {
    /// Build an item, validating its relative path.
    pub fn new(relative_path: &str, location: StorageLocation) -> Result<Self> {
        Ok(Self {
            relative_path: library_path(relative_path)?,
            location,
        })
    }

    /// Shorthand for a local-library item.
    pub fn local(relative_path: &str) -> Result<Self> {
        Self::new(relative_path, StorageLocation::Local)
    }

    /// The item's path under `root`.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        self.relative_path.to_path(root)
    }
}

/// A plaintext library root and the vault mount point that mirrors it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPair {
    /// Plaintext library root
    pub plaintext: PathBuf,
    /// Mount point of the vault holding this library
    pub vault: PathBuf,
}

impl RootPair {
    /// Pair a plaintext root with a vault mount point.
    pub fn new(plaintext: impl Into<PathBuf>, vault: impl Into<PathBuf>) -> Self {
        Self {
            plaintext: plaintext.into(),
            vault: vault.into(),
        }
    }

    /// `(source, destination)` for a direction.
    pub fn endpoints(&self, direction: MigrationDirection) -> (&Path, &Path) {
        match direction {
            MigrationDirection::IntoVault => (&self.plaintext, &self.vault),
            MigrationDirection::OutOfVault => (&self.vault, &self.plaintext),
        }
    }
}

/// Root pairs for every storage class taking part in a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRoots {
    /// Local library and the local vault
    pub local: RootPair,
    /// External library and its vault, if any
    pub external: Option<RootPair>,
}

impl MigrationRoots {
    /// Roots for a local-only library.
    pub fn local(plaintext: impl Into<PathBuf>, vault: impl Into<PathBuf>) -> Self {
        Self {
            local: RootPair::new(plaintext, vault),
            external: None,
        }
    }

    /// Add the external library pair.
    #[must_use]
    pub fn with_external(mut self, pair: RootPair) -> Self {
        self.external = Some(pair);
        self
    }

    /// The pair serving a storage class.
    pub fn pair(&self, location: StorageLocation) -> Option<&RootPair> {
        match location {
            StorageLocation::Local => Some(&self.local),
            StorageLocation::External => self.external.as_ref(),
        }
    }

    /// Every pair, local first.
    pub fn pairs(&self) -> impl Iterator<Item = &RootPair> {
        std::iter::once(&self.local).chain(self.external.as_ref())
    }
}

/// Library files that move wholesale rather than per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLayout {
    /// The catalog database, relative to the local root
    pub database: RelativePathBuf,
    /// Regenerable cache directories (thumbnails, transcripts)
    pub caches: Vec<RelativePathBuf>,
}

impl LibraryLayout {
    /// Layout with a database file and no caches.
    pub fn new(database: &str) -> Result<Self> {
        Ok(Self {
            database: library_path(database)?,
            caches: Vec::new(),
        })
    }

    /// Add a cache directory.
    pub fn with_cache(mut self, cache: &str) -> Result<Self> {
        self.caches.push(library_path(cache)?);
        Ok(self)
    }
}

/// The media catalog owned by the persistence layer.
///
/// Items are fetched before the database moves; once it has moved, the old
/// handle must not be used until [`reopen`](Self::reopen).
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    /// Every item stored in a storage-location class.
    async fn fetch_items(&self, location: StorageLocation) -> Result<Vec<MigrationItem>>;

    /// Close the database handle so the file can be relocated.
    async fn release(&self) -> Result<()>;

    /// Open the database at its new location.
    async fn reopen(&self, database: &Path) -> Result<()>;

    /// Record that `items` were migrated in `direction`.
    async fn record_migrated(
        &self,
        items: &[MigrationItem],
        direction: MigrationDirection,
    ) -> Result<()>;
}
