//! Encrypted disk image lifecycle for Slidr library vaults.
//!
//! This crate wraps the host's encrypted container facility behind the
//! [`DiskImageService`] trait. A container is a growable, password-protected
//! disk image; it must be attached (mounted) before its contents are
//! visible, and detached again to lock it.
//!
//! # Components
//!
//! - [`DiskImageService`] - create, attach, detach, rekey and resize containers
//! - [`HdiutilService`] - production implementation driving `hdiutil`
//! - [`DiskImageError`] - structured failures (wrong password, busy device,
//!   missing drive, tool exit codes)
//! - [`mount_table`] - parsers for the host tools' output
//! - [`testing::FakeDiskImageService`] - directory-backed fake for tests
//!
//! # Why a trait?
//!
//! The host facility is an external process with its own failure modes and
//! no in-process completion guarantee. Keeping it behind a trait lets the
//! vault layer be exercised end to end (including ejected drives and busy
//! volumes) without creating real disk images.
//!
//! # Example
//!
//! ```no_run
//! use secrecy::SecretString;
//! use slidr_diskimage::{DiskImageService, HdiutilService};
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), slidr_diskimage::DiskImageError> {
//! let images = HdiutilService::new();
//! let password = SecretString::from("correcthorse1".to_owned());
//!
//! let seed = images
//!     .create("Slidr Vault", Path::new("/tmp/v.sparsebundle"), &password)
//!     .await?;
//! let mount_point = images.attach(&seed.container_path, &password).await?;
//! images.detach(&mount_point, false).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod command;
mod error;
mod force_detach;
mod hdiutil;
pub mod mount_table;
mod service;

/// Test doubles for the disk image facility.
pub mod testing;

pub use error::DiskImageError;
pub use hdiutil::{DEFAULT_VOLUMES_ROOT, HdiutilService, SPARSE_BUNDLE_EXTENSION};
pub use service::{ContainerSeed, DEFAULT_MAX_CONTAINER_BYTES, DiskImageService, Result};
