//! Directory-backed fake of the host disk image facility.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::DiskImageError;
use crate::service::{ContainerSeed, DiskImageService, Result};

const KEY_FILE: &str = "key";
const NAME_FILE: &str = "volname";
const SIZE_FILE: &str = "maxsize";
const CONTENTS_DIR: &str = "contents";

#[derive(Debug, Default)]
struct FakeState {
    /// Container path -> mount point
    attached: HashMap<PathBuf, PathBuf>,
    /// Mount points with open file handles
    busy: HashSet<PathBuf>,
    /// Containers whose next password change fails
    failing_rekeys: HashSet<PathBuf>,
    password_changes: usize,
}

/// In-process stand-in for [`HdiutilService`](crate::HdiutilService).
#[derive(Debug)]
pub struct FakeDiskImageService {
    mount_root: PathBuf,
    volume_uuid: Option<String>,
    state: Mutex<FakeState>,
}

fn digest(password: &SecretString) -> String {
    hex::encode(Sha256::digest(password.expose_secret().as_bytes()))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DiskImageError {
    let path = path.to_path_buf();
    move |source| DiskImageError::io(path, source)
}

impl FakeDiskImageService {
    /// Create a fake that mounts volumes under `mount_root`.
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            volume_uuid: None,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Report this volume UUID for every created container.
    #[must_use]
    pub fn with_volume_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.volume_uuid = Some(uuid.into());
        self
    }

    /// Mark a mount point as having open file handles.
    pub fn hold_open(&self, mount_point: &Path) {
        self.state.lock().busy.insert(mount_point.to_path_buf());
    }

    /// Make the next password change on `container` fail.
    pub fn fail_next_password_change(&self, container: &Path) {
        self.state
            .lock()
            .failing_rekeys
            .insert(container.to_path_buf());
    }

    /// Number of successful password changes performed so far.
    pub fn password_changes(&self) -> usize {
        self.state.lock().password_changes
    }

    /// Whether `container` currently accepts `password`.
    pub fn accepts_password(&self, container: &Path, password: &SecretString) -> bool {
        std::fs::read_to_string(container.join(KEY_FILE))
            .is_ok_and(|stored| stored.trim() == digest(password))
    }

    /// Number of attached containers.
    pub fn attached_count(&self) -> usize {
        self.state.lock().attached.len()
    }

    fn check_present(&self, container: &Path) -> Result<()> {
        if container.is_dir() {
            Ok(())
        } else if !self.is_host_available(container) {
            Err(DiskImageError::HostDriveUnavailable(container.to_path_buf()))
        } else {
            Err(DiskImageError::ContainerNotFound(container.to_path_buf()))
        }
    }

    async fn verify(&self, container: &Path, password: &SecretString) -> Result<()> {
        let stored = tokio::fs::read_to_string(container.join(KEY_FILE))
            .await
            .map_err(io_err(container))?;
        if stored.trim() == digest(password) {
            Ok(())
        } else {
            Err(DiskImageError::InvalidCredential(container.to_path_buf()))
        }
    }

    /// Pick `{root}/{name}`, or `{root}/{name} 1`... if taken, like the host does.
    fn free_mount_point(&self, name: &str) -> PathBuf {
        let first = self.mount_root.join(name);
        if !first.exists() {
            return first;
        }
        (1..)
            .map(|n| self.mount_root.join(format!("{name} {n}")))
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }
}

#[async_trait]
impl DiskImageService for FakeDiskImageService {
    async fn create(
        &self,
        name: &str,
        container: &Path,
        password: &SecretString,
    ) -> Result<ContainerSeed> {
        if container.exists() {
            return Err(DiskImageError::ContainerCreationFailed {
                path: container.to_path_buf(),
                reason: "a container already exists at this path".to_owned(),
            });
        }
        if let Err(e) = tokio::fs::create_dir(container).await {
            return Err(DiskImageError::ContainerCreationFailed {
                path: container.to_path_buf(),
                reason: e.to_string(),
            });
        }

        tokio::fs::create_dir(container.join(CONTENTS_DIR))
            .await
            .map_err(io_err(container))?;
        tokio::fs::write(container.join(KEY_FILE), digest(password))
            .await
            .map_err(io_err(container))?;
        tokio::fs::write(container.join(NAME_FILE), name)
            .await
            .map_err(io_err(container))?;

        Ok(ContainerSeed {
            container_path: container.to_path_buf(),
            mount_point_name: name.to_owned(),
            volume_uuid: self.volume_uuid.clone(),
        })
    }

    async fn attach(&self, container: &Path, password: &SecretString) -> Result<PathBuf> {
        self.check_present(container)?;
        self.verify(container, password).await?;

        if let Some(existing) = self.state.lock().attached.get(container) {
            return Ok(existing.clone());
        }

        let name = tokio::fs::read_to_string(container.join(NAME_FILE))
            .await
            .map_err(io_err(container))?;
        tokio::fs::create_dir_all(&self.mount_root)
            .await
            .map_err(io_err(&self.mount_root))?;

        let mount_point = self.free_mount_point(name.trim());
        tokio::fs::rename(container.join(CONTENTS_DIR), &mount_point)
            .await
            .map_err(io_err(&mount_point))?;

        self.state
            .lock()
            .attached
            .insert(container.to_path_buf(), mount_point.clone());
        Ok(mount_point)
    }

    async fn detach(&self, mount_point: &Path, force: bool) -> Result<()> {
        let container = {
            let mut state = self.state.lock();
            let container = state
                .attached
                .iter()
                .find(|(_, mp)| mp.as_path() == mount_point)
                .map(|(c, _)| c.clone())
                .ok_or_else(|| DiskImageError::ContainerNotFound(mount_point.to_path_buf()))?;

            if state.busy.contains(mount_point) && !force {
                return Err(DiskImageError::DeviceBusy(mount_point.to_path_buf()));
            }
            state.busy.remove(mount_point);
            container
        };

        if !container.is_dir() {
            return Err(DiskImageError::HostDriveUnavailable(container));
        }

        tokio::fs::rename(mount_point, container.join(CONTENTS_DIR))
            .await
            .map_err(io_err(mount_point))?;
        self.state.lock().attached.remove(&container);
        Ok(())
    }

    async fn resolve_mount_point(&self, container: &Path) -> Result<Option<PathBuf>> {
        Ok(self.state.lock().attached.get(container).cloned())
    }

    async fn change_password(
        &self,
        container: &Path,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<()> {
        self.check_present(container)?;
        self.verify(container, old).await?;

        if self.state.lock().failing_rekeys.remove(container) {
            return Err(DiskImageError::CommandFailed {
                program: "hdiutil".to_owned(),
                code: Some(1),
                stderr: "chpass failed - injected failure".to_owned(),
            });
        }

        tokio::fs::write(container.join(KEY_FILE), digest(new))
            .await
            .map_err(io_err(container))?;
        self.state.lock().password_changes += 1;
        Ok(())
    }

    async fn verify_password(&self, container: &Path, password: &SecretString) -> Result<()> {
        self.check_present(container)?;
        self.verify(container, password).await
    }

    async fn resize(
        &self,
        container: &Path,
        password: &SecretString,
        max_bytes: u64,
    ) -> Result<()> {
        self.check_present(container)?;
        self.verify(container, password).await?;
        tokio::fs::write(container.join(SIZE_FILE), max_bytes.to_string())
            .await
            .map_err(io_err(container))
    }
}
