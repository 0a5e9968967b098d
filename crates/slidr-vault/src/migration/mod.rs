//! Moving a library between plaintext storage and mounted vaults.
//!
//! [`MigrationOrchestrator`] relocates the catalog database, the cache
//! directories and every media item the [`MediaCatalog`] lists, in either
//! [`MigrationDirection`]. Items are addressed by validated library-relative
//! paths so they resolve identically under the plaintext root and the vault
//! mount point.

mod fs_ops;
mod orchestrator;
mod plan;

pub(crate) use fs_ops::remaining_files;
pub use orchestrator::{MigrationOrchestrator, MigrationReport, database_destination};
pub use plan::{
    LibraryLayout, MediaCatalog, MigrationDirection, MigrationItem, MigrationRoots, RootPair,
    StorageLocation, library_path,
};
