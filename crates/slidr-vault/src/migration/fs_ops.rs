//! File system primitives used by the migration phases.
//!
//! Every function maps I/O failures onto [`VaultError::Io`] with the path
//! that failed. Blocking tree walks run on the blocking thread pool.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, VaultError};

/// Suffix of a database file copy that has not been verified yet.
const PENDING_SUFFIX: &str = ".slidr-migrating";

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> VaultError {
    let path = path.to_path_buf();
    move |source| VaultError::io(path, source)
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::io(path, io::Error::other(e)))?
}

/// Whether anything (file, directory or dangling symlink) exists at `path`.
///
/// Only a missing path (or a missing parent directory) means absent; any
/// other failure, such as an unreadable parent, is an error.
pub(crate) async fn exists(path: &Path) -> Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(e) => Err(VaultError::io(path, e)),
    }
}

/// Remove a file or directory tree. A missing path is not an error.
pub(crate) async fn remove_path(path: &Path) -> Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::io(path, e)),
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err(parent))?;
    }
    Ok(())
}

/// Move `src` to `dst`, creating intermediate directories.
///
/// Renames when both sides share a file system; otherwise copies the tree
/// and removes the source. `dst` must not exist.
pub(crate) async fn move_path(src: &Path, dst: &Path) -> Result<()> {
    create_parent(dst).await?;
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(
                "{} and {} are on different devices, copying",
                src.display(),
                dst.display()
            );
            copy_then_remove(src, dst).await
        }
        Err(e) => Err(VaultError::io(src, e)),
    }
}

/// Recursively copy `src` to `dst`, then delete `src`.
pub(crate) async fn copy_then_remove(src: &Path, dst: &Path) -> Result<()> {
    let (from, to) = (src.to_path_buf(), dst.to_path_buf());
    blocking(src, move || copy_tree(&from, &to)).await?;
    remove_path(src).await
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| src.to_path_buf(), Path::to_path_buf);
            VaultError::io(path, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            std::fs::copy(entry.path(), &target).map_err(io_err(entry.path()))?;
        }
    }
    Ok(())
}

/// SHA-256 of a file's contents.
pub(crate) async fn file_digest(path: &Path) -> Result<[u8; 32]> {
    let owned = path.to_path_buf();
    blocking(path, move || {
        let mut file = File::open(&owned).map_err(io_err(&owned))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(io_err(&owned))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    })
    .await
}

/// Side files sharing the database's base name (`lib.db-wal`, `lib.db-shm`,
/// `lib.db-journal`), sorted by name.
async fn side_files(dir: &Path, database_name: &str) -> Result<Vec<String>> {
    let prefix = format!("{database_name}-");
    let mut names = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(VaultError::io(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(io_err(dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && !name.ends_with(PENDING_SUFFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn pending_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(PENDING_SUFFIX);
    path.with_file_name(name)
}

/// Relocate a database file together with its side files.
///
/// Every file is copied next to its destination under a temporary name and
/// its SHA-256 compared with the source. Only when all copies verify are
/// they renamed into place (replacing whatever was there, including stale
/// side files) and the sources deleted.
///
/// Returns the number of files relocated. A database missing at the source
/// relocates nothing.
pub(crate) async fn relocate_database(src: &Path, dst: &Path) -> Result<usize> {
    let Some(name) = src.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Err(VaultError::InvalidRelativePath(src.display().to_string()));
    };

    if !exists(src).await? {
        if exists(dst).await? {
            tracing::info!("Database already at {}", dst.display());
        } else {
            tracing::warn!("No database at {}, nothing to relocate", src.display());
        }
        return Ok(0);
    }

    let src_dir = src.parent().unwrap_or(Path::new(""));
    let dst_dir = dst.parent().unwrap_or(Path::new(""));
    tokio::fs::create_dir_all(dst_dir)
        .await
        .map_err(io_err(dst_dir))?;

    let mut names = vec![name.clone()];
    names.extend(side_files(src_dir, &name).await?);

    let mut staged: Vec<(PathBuf, PathBuf, PathBuf)> = Vec::with_capacity(names.len());
    for file in &names {
        let from = src_dir.join(file);
        let to = dst_dir.join(file);
        let pending = pending_path(&to);

        if let Err(e) = stage_copy(&from, &pending).await {
            for (_, _, pending) in &staged {
                let _ = remove_path(pending).await;
            }
            let _ = remove_path(&pending).await;
            return Err(e);
        }
        staged.push((from, to, pending));
    }

    for stale in side_files(dst_dir, &name).await? {
        if !names.contains(&stale) {
            tracing::debug!("Removing stale database side file {}", stale);
            remove_path(&dst_dir.join(stale)).await?;
        }
    }
    for (_, to, pending) in &staged {
        tokio::fs::rename(pending, to).await.map_err(io_err(to))?;
    }
    for (from, _, _) in &staged {
        remove_path(from).await?;
    }

    tracing::debug!(
        "Relocated database {} ({} file(s)) to {}",
        src.display(),
        staged.len(),
        dst_dir.display()
    );
    Ok(staged.len())
}

async fn stage_copy(from: &Path, pending: &Path) -> Result<()> {
    tokio::fs::copy(from, pending)
        .await
        .map_err(io_err(from))?;
    File::open(pending)
        .and_then(|f| f.sync_all())
        .map_err(io_err(pending))?;

    if file_digest(from).await? != file_digest(pending).await? {
        return Err(VaultError::io(
            pending,
            io::Error::new(
                io::ErrorKind::InvalidData,
                "copied database does not match its source",
            ),
        ));
    }
    Ok(())
}

/// Remove empty directories under `root`, deepest first. `root` itself is
/// never removed. Returns how many directories were removed.
pub(crate) async fn remove_empty_dirs(root: &Path) -> Result<usize> {
    if !exists(root).await? {
        return Ok(0);
    }
    let owned = root.to_path_buf();
    blocking(root, move || {
        let mut removed = 0;
        for entry in WalkDir::new(&owned).min_depth(1).contents_first(true) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            // Fails on non-empty directories, which is what we want
            if std::fs::remove_dir(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    })
    .await
}

/// Entries the host keeps on every mounted volume.
const HOST_METADATA: &[&str] = &[
    ".DS_Store",
    ".DocumentRevisions-V100",
    ".Spotlight-V100",
    ".TemporaryItems",
    ".Trashes",
    ".VolumeIcon.icns",
    ".fseventsd",
];

/// Regular files and symlinks under `root`, relative to it, ignoring host
/// volume metadata.
pub(crate) async fn remaining_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !exists(root).await? {
        return Ok(Vec::new());
    }
    let owned = root.to_path_buf();
    blocking(root, move || {
        let mut files = Vec::new();
        let walker = WalkDir::new(&owned).min_depth(1).into_iter().filter_entry(|entry| {
            !HOST_METADATA
                .iter()
                .any(|name| entry.file_name() == *name)
        });
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| owned.clone(), Path::to_path_buf);
                VaultError::io(path, e.into())
            })?;
            if !entry.file_type().is_dir() {
                let relative = entry.path().strip_prefix(&owned).unwrap_or(entry.path());
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    })
    .await
}
