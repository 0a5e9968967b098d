//! macOS disk image backend built on `hdiutil`.
//!
//! Containers are AES-256 encrypted sparse bundles holding a single APFS
//! volume. Passwords reach `hdiutil` through `-stdinpass`.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use secrecy::zeroize::Zeroizing;
use secrecy::{ExposeSecret, SecretString};

use crate::command::{classify_failure, run_tool};
use crate::error::DiskImageError;
use crate::force_detach::{ForceDetachTools, force_detach};
use crate::mount_table::{
    parse_attach_output, parse_df_mount_point, parse_info_output, parse_volume_uuid,
};
use crate::service::{ContainerSeed, DEFAULT_MAX_CONTAINER_BYTES, DiskImageService, Result};

/// Extension `hdiutil` gives sparse bundles.
pub const SPARSE_BUNDLE_EXTENSION: &str = "sparsebundle";

/// Default root under which removable volumes are mounted.
pub const DEFAULT_VOLUMES_ROOT: &str = "/Volumes";

/// [`DiskImageService`] backed by the host `hdiutil` tool.
#[derive(Debug, Clone)]
pub struct HdiutilService {
    hdiutil_binary: String,
    diskutil_binary: String,
    umount_binary: String,
    df_binary: String,
    volumes_root: PathBuf,
    max_container_bytes: u64,
}

impl HdiutilService {
    /// Constructs a service using the default binary names.
    pub fn new() -> Self {
        Self {
            hdiutil_binary: "hdiutil".to_owned(),
            diskutil_binary: "diskutil".to_owned(),
            umount_binary: "umount".to_owned(),
            df_binary: "df".to_owned(),
            volumes_root: PathBuf::from(DEFAULT_VOLUMES_ROOT),
            max_container_bytes: DEFAULT_MAX_CONTAINER_BYTES,
        }
    }

    /// Constructs a service with custom binaries.
    pub fn with_binaries(
        hdiutil_binary: impl Into<String>,
        diskutil_binary: impl Into<String>,
        umount_binary: impl Into<String>,
    ) -> Self {
        Self {
            hdiutil_binary: hdiutil_binary.into(),
            diskutil_binary: diskutil_binary.into(),
            umount_binary: umount_binary.into(),
            ..Self::new()
        }
    }

    /// Use a different root for detecting removable host volumes.
    #[must_use]
    pub fn with_volumes_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volumes_root = root.into();
        self
    }

    /// Maximum size given to newly created containers.
    #[must_use]
    pub fn with_max_container_bytes(mut self, bytes: u64) -> Self {
        self.max_container_bytes = bytes;
        self
    }

    /// Volume root a path lives on, if it is under the removable volumes root.
    ///
    /// `/Volumes/Photos/Slidr.sparsebundle` yields `/Volumes/Photos`.
    pub fn host_volume_root(&self, path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix(&self.volumes_root).ok()?;
        match rest.components().next()? {
            Component::Normal(name) => Some(self.volumes_root.join(name)),
            _ => None,
        }
    }

    /// Fail fast when a container's drive or the container itself is gone.
    fn check_container_present(&self, container: &Path) -> Result<()> {
        if container.exists() {
            return Ok(());
        }
        if !self.is_host_available(container) {
            return Err(DiskImageError::HostDriveUnavailable(container.to_path_buf()));
        }
        Err(DiskImageError::ContainerNotFound(container.to_path_buf()))
    }

    /// Look up the UUID of the volume holding `path`.
    ///
    /// Best effort: any tool failure yields `None`.
    async fn volume_uuid_for(&self, path: &Path) -> Option<String> {
        let df = run_tool(&self.df_binary, [OsStr::new("-P"), path.as_os_str()], None)
            .await
            .ok()
            .filter(|o| o.success)?;
        let volume = parse_df_mount_point(&df.stdout)?;

        let info = run_tool(
            &self.diskutil_binary,
            [OsStr::new("info"), volume.as_os_str()],
            None,
        )
        .await
        .ok()
        .filter(|o| o.success)?;
        let uuid = parse_volume_uuid(&info.stdout);
        tracing::debug!("Volume UUID for {}: {:?}", path.display(), uuid);
        uuid
    }

    fn force_tools(&self) -> ForceDetachTools<'_> {
        ForceDetachTools {
            hdiutil: &self.hdiutil_binary,
            diskutil: &self.diskutil_binary,
            umount: &self.umount_binary,
        }
    }
}

impl Default for HdiutilService {
    fn default() -> Self {
        Self::new()
    }
}

/// `hdiutil` appends `.sparsebundle` to paths that lack it.
fn normalized_bundle_path(container: &Path) -> PathBuf {
    if container.extension().is_some_and(|ext| ext == SPARSE_BUNDLE_EXTENSION) {
        container.to_path_buf()
    } else {
        let mut os = container.as_os_str().to_owned();
        os.push(".");
        os.push(SPARSE_BUNDLE_EXTENSION);
        PathBuf::from(os)
    }
}

fn password_input(password: &SecretString) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(password.expose_secret().as_bytes().to_vec())
}

/// `-oldstdinpass -newstdinpass` reads two NUL-terminated passwords.
fn password_pair_input(old: &SecretString, new: &SecretString) -> Zeroizing<Vec<u8>> {
    let mut input = Zeroizing::new(Vec::with_capacity(
        old.expose_secret().len() + new.expose_secret().len() + 2,
    ));
    input.extend_from_slice(old.expose_secret().as_bytes());
    input.push(0);
    input.extend_from_slice(new.expose_secret().as_bytes());
    input.push(0);
    input
}

fn same_file(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}

#[async_trait]
impl DiskImageService for HdiutilService {
    async fn create(
        &self,
        name: &str,
        container: &Path,
        password: &SecretString,
    ) -> Result<ContainerSeed> {
        let container_path = normalized_bundle_path(container);
        if container_path.exists() {
            return Err(DiskImageError::ContainerCreationFailed {
                path: container_path,
                reason: "a container already exists at this path".to_owned(),
            });
        }
        if !self.is_host_available(&container_path) {
            return Err(DiskImageError::ContainerCreationFailed {
                path: container_path,
                reason: "parent directory does not exist".to_owned(),
            });
        }

        tracing::info!("Creating encrypted container {}", container_path.display());
        let size = format!("{}b", self.max_container_bytes / 512);
        let output = run_tool(
            &self.hdiutil_binary,
            [
                OsStr::new("create"),
                OsStr::new("-size"),
                OsStr::new(&size),
                OsStr::new("-type"),
                OsStr::new("SPARSEBUNDLE"),
                OsStr::new("-fs"),
                OsStr::new("APFS"),
                OsStr::new("-encryption"),
                OsStr::new("AES-256"),
                OsStr::new("-stdinpass"),
                OsStr::new("-volname"),
                OsStr::new(name),
                container_path.as_os_str(),
            ],
            Some(password_input(password)),
        )
        .await?;

        if !output.success {
            return Err(DiskImageError::ContainerCreationFailed {
                path: container_path,
                reason: output.stderr,
            });
        }

        let volume_uuid = match container_path.parent() {
            Some(parent) => self.volume_uuid_for(parent).await,
            None => None,
        };

        tracing::info!("Created container {}", container_path.display());
        Ok(ContainerSeed {
            container_path,
            mount_point_name: name.to_owned(),
            volume_uuid,
        })
    }

    async fn attach(&self, container: &Path, password: &SecretString) -> Result<PathBuf> {
        self.check_container_present(container)?;

        if let Some(existing) = self.resolve_mount_point(container).await? {
            self.verify_password(container, password).await?;
            tracing::debug!(
                "{} already attached at {}",
                container.display(),
                existing.display()
            );
            return Ok(existing);
        }

        tracing::info!("Attaching {}", container.display());
        let output = run_tool(
            &self.hdiutil_binary,
            [
                OsStr::new("attach"),
                OsStr::new("-stdinpass"),
                OsStr::new("-nobrowse"),
                OsStr::new("-owners"),
                OsStr::new("on"),
                container.as_os_str(),
            ],
            Some(password_input(password)),
        )
        .await?;

        if !output.success {
            return match classify_failure(&self.hdiutil_binary, &output, container) {
                DiskImageError::AlreadyAttached(_) => self
                    .resolve_mount_point(container)
                    .await?
                    .ok_or_else(|| DiskImageError::UnexpectedOutput {
                        program: self.hdiutil_binary.clone(),
                        detail: "reported attached but no mount point found".to_owned(),
                    }),
                DiskImageError::ContainerNotFound(path) if !self.is_host_available(&path) => {
                    Err(DiskImageError::HostDriveUnavailable(path))
                }
                other => Err(other),
            };
        }

        let mount_point = parse_attach_output(&output.stdout).ok_or_else(|| {
            DiskImageError::UnexpectedOutput {
                program: self.hdiutil_binary.clone(),
                detail: "no mount point in attach output".to_owned(),
            }
        })?;
        tracing::info!("Attached {} at {}", container.display(), mount_point.display());
        Ok(mount_point)
    }

    async fn detach(&self, mount_point: &Path, force: bool) -> Result<()> {
        tracing::info!("Detaching {} (force: {})", mount_point.display(), force);

        // The fallback chain starts with `hdiutil detach -force`
        if force {
            return force_detach(&self.force_tools(), mount_point).await;
        }

        let output = run_tool(
            &self.hdiutil_binary,
            [OsStr::new("detach"), mount_point.as_os_str()],
            None,
        )
        .await?;
        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&self.hdiutil_binary, &output, mount_point))
        }
    }

    async fn resolve_mount_point(&self, container: &Path) -> Result<Option<PathBuf>> {
        let output = run_tool(&self.hdiutil_binary, ["info"], None).await?;
        if !output.success {
            return Err(classify_failure(&self.hdiutil_binary, &output, container));
        }

        Ok(parse_info_output(&output.stdout)
            .into_iter()
            .find(|image| same_file(&image.image_path, container))
            .and_then(|image| image.mount_point().map(Path::to_path_buf)))
    }

    async fn change_password(
        &self,
        container: &Path,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<()> {
        self.check_container_present(container)?;

        tracing::info!("Changing password of {}", container.display());
        let output = run_tool(
            &self.hdiutil_binary,
            [
                OsStr::new("chpass"),
                OsStr::new("-oldstdinpass"),
                OsStr::new("-newstdinpass"),
                container.as_os_str(),
            ],
            Some(password_pair_input(old, new)),
        )
        .await?;

        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&self.hdiutil_binary, &output, container))
        }
    }

    async fn verify_password(&self, container: &Path, password: &SecretString) -> Result<()> {
        self.check_container_present(container)?;

        // imageinfo has to unlock the header of an encrypted image
        let output = run_tool(
            &self.hdiutil_binary,
            [
                OsStr::new("imageinfo"),
                OsStr::new("-stdinpass"),
                container.as_os_str(),
            ],
            Some(password_input(password)),
        )
        .await?;

        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&self.hdiutil_binary, &output, container))
        }
    }

    async fn resize(
        &self,
        container: &Path,
        password: &SecretString,
        max_bytes: u64,
    ) -> Result<()> {
        self.check_container_present(container)?;

        let size = format!("{}b", max_bytes / 512);
        tracing::info!("Resizing {} to {} bytes", container.display(), max_bytes);
        let output = run_tool(
            &self.hdiutil_binary,
            [
                OsStr::new("resize"),
                OsStr::new("-size"),
                OsStr::new(&size),
                OsStr::new("-stdinpass"),
                container.as_os_str(),
            ],
            Some(password_input(password)),
        )
        .await?;

        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&self.hdiutil_binary, &output, container))
        }
    }

    fn is_host_available(&self, container: &Path) -> bool {
        match self.host_volume_root(container) {
            Some(volume) => volume.exists(),
            None => container.parent().is_some_and(Path::exists),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_bundle_path_appends_extension() {
        assert_eq!(
            normalized_bundle_path(Path::new("/tmp/v.bundle")),
            PathBuf::from("/tmp/v.bundle.sparsebundle")
        );
        assert_eq!(
            normalized_bundle_path(Path::new("/tmp/v.sparsebundle")),
            PathBuf::from("/tmp/v.sparsebundle")
        );
    }

    #[test]
    fn test_host_volume_root() {
        let service = HdiutilService::new();
        assert_eq!(
            service.host_volume_root(Path::new("/Volumes/Photos/Slidr/External.sparsebundle")),
            Some(PathBuf::from("/Volumes/Photos"))
        );
        assert_eq!(service.host_volume_root(Path::new("/Users/me/v.sparsebundle")), None);
    }

    #[test]
    fn test_missing_removable_volume_is_unavailable() {
        let service = HdiutilService::new().with_volumes_root("/nonexistent-volumes-root");
        let container = Path::new("/nonexistent-volumes-root/Gone/v.sparsebundle");
        assert!(!service.is_host_available(container));
        assert!(matches!(
            service.check_container_present(container),
            Err(DiskImageError::HostDriveUnavailable(_))
        ));
    }

    #[test]
    fn test_password_pair_is_nul_separated() {
        let input = password_pair_input(
            &SecretString::from("p1".to_owned()),
            &SecretString::from("p2".to_owned()),
        );
        assert_eq!(input.as_slice(), b"p1\0p2\0");
    }
}
