//! Testing utilities for code built on [`DiskImageService`](crate::DiskImageService).
//!
//! [`FakeDiskImageService`] emulates encrypted containers with plain
//! directories so vault orchestration can be exercised without `hdiutil`:
//!
//! - a container is a directory holding a password digest and a `contents/` tree
//! - attaching moves `contents/` to `{mount_root}/{volume name}`
//! - removing a container's parent directory emulates an ejected drive
//!
//! # Usage
//!
//! ```ignore
//! use slidr_diskimage::testing::FakeDiskImageService;
//!
//! let images = FakeDiskImageService::new(mount_root.path());
//! let seed = images.create("Local Vault", &container, &password).await?;
//! let mount_point = images.attach(&seed.container_path, &password).await?;
//! ```

mod fake;

pub use fake::FakeDiskImageService;
