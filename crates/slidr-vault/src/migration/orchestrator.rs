//! Library migration between plaintext storage and mounted vaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::context::VaultContext;
use crate::error::Result;
use crate::migration::fs_ops;
use crate::migration::plan::{
    LibraryLayout, MigrationDirection, MigrationItem, MigrationRoots, StorageLocation,
};

/// Outcome of one [`MigrationOrchestrator::migrate`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Media items now at the destination
    pub moved: usize,
    /// Media items missing at both source and destination
    pub skipped: usize,
    /// Database files relocated (the database plus its side files)
    pub database_files: usize,
    /// Cache directories relocated
    pub caches: usize,
    /// The items counted in `moved`
    pub moved_items: Vec<MigrationItem>,
}

/// Moves a library between a plaintext root and a mounted vault root.
///
/// Phases run in a fixed order, each assuming the previous one succeeded:
///
/// 1. the database and its side files (copy, verify, then delete the source)
/// 2. cache directories (replaced wholesale at the destination)
/// 3. media items, from a list fetched before phase 1
/// 4. removal of empty directories left at the source
///
/// A media item missing at the source is skipped, never fatal. Any other
/// I/O failure aborts the run; whatever was already moved stays moved, and
/// running the same migration again picks up where it stopped.
#[derive(Debug, Clone)]
pub struct MigrationOrchestrator {
    progress_interval: usize,
}

impl MigrationOrchestrator {
    /// Orchestrator using the context's progress cadence.
    pub fn new(context: &VaultContext) -> Self {
        Self {
            progress_interval: context.progress_interval.max(1),
        }
    }

    /// Run a migration.
    ///
    /// `progress` receives `(current, total)` over the media items every
    /// `progress_interval` items and on the last one.
    pub async fn migrate<F>(
        &self,
        items: &[MigrationItem],
        layout: &LibraryLayout,
        roots: &MigrationRoots,
        direction: MigrationDirection,
        mut progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(usize, usize) + Send,
    {
        let (local_src, local_dst) = roots.local.endpoints(direction);
        tracing::info!(
            "Starting {:?} migration of {} item(s) from {} to {}",
            direction,
            items.len(),
            local_src.display(),
            local_dst.display()
        );
        let mut report = MigrationReport::default();

        tracing::info!("Relocating database {}", layout.database);
        report.database_files = fs_ops::relocate_database(
            &layout.database.to_path(local_src),
            &layout.database.to_path(local_dst),
        )
        .await?;

        for cache in &layout.caches {
            if self
                .relocate_cache(&cache.to_path(local_src), &cache.to_path(local_dst))
                .await?
            {
                report.caches += 1;
            }
        }

        self.relocate_items(items, roots, direction, &mut report, &mut progress)
            .await?;

        let sources: HashSet<&Path> = roots
            .pairs()
            .map(|pair| pair.endpoints(direction).0)
            .collect();
        for source in sources {
            let removed = fs_ops::remove_empty_dirs(source).await?;
            tracing::debug!(
                "Removed {} empty director(ies) under {}",
                removed,
                source.display()
            );
        }

        tracing::info!(
            "Migration finished: {} moved, {} skipped, {} database file(s), {} cache(s)",
            report.moved,
            report.skipped,
            report.database_files,
            report.caches
        );
        Ok(report)
    }

    async fn relocate_cache(&self, src: &Path, dst: &Path) -> Result<bool> {
        if !fs_ops::exists(src).await? {
            tracing::debug!("No cache at {}", src.display());
            return Ok(false);
        }
        if fs_ops::exists(dst).await? {
            tracing::debug!("Replacing existing cache at {}", dst.display());
            fs_ops::remove_path(dst).await?;
        }
        fs_ops::move_path(src, dst).await?;
        tracing::info!("Relocated cache {} to {}", src.display(), dst.display());
        Ok(true)
    }

    async fn relocate_items<F>(
        &self,
        items: &[MigrationItem],
        roots: &MigrationRoots,
        direction: MigrationDirection,
        report: &mut MigrationReport,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = items.len();
        let mut warned_no_external = false;

        for (index, item) in items.iter().enumerate() {
            match roots.pair(item.location) {
                Some(pair) => {
                    let (src_root, dst_root) = pair.endpoints(direction);
                    let (src, dst) = (item.path_under(src_root), item.path_under(dst_root));
                    if relocate_item(&src, &dst).await? {
                        report.moved += 1;
                        report.moved_items.push(item.clone());
                    } else {
                        tracing::warn!(
                            "Skipping {}: not found at {}",
                            item.relative_path,
                            src.display()
                        );
                        report.skipped += 1;
                    }
                }
                None => {
                    if !warned_no_external {
                        tracing::warn!("No external library roots given, skipping external items");
                        warned_no_external = true;
                    }
                    debug_assert_eq!(item.location, StorageLocation::External);
                    report.skipped += 1;
                }
            }

            let current = index + 1;
            if current % self.progress_interval == 0 || current == total {
                progress(current, total);
            }
        }
        Ok(())
    }
}

/// Returns whether the item is now at `dst`.
async fn relocate_item(src: &Path, dst: &Path) -> Result<bool> {
    if !fs_ops::exists(src).await? {
        // Already moved by an earlier, interrupted run
        return fs_ops::exists(dst).await;
    }
    if fs_ops::exists(dst).await? {
        fs_ops::remove_path(dst).await?;
    }
    fs_ops::move_path(src, dst).await?;
    Ok(true)
}

/// Where the database lives after a migration in `direction`.
pub fn database_destination(
    layout: &LibraryLayout,
    roots: &MigrationRoots,
    direction: MigrationDirection,
) -> PathBuf {
    layout.database.to_path(roots.local.endpoints(direction).1)
}
