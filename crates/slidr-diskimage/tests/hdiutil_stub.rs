//! `HdiutilService` against a scripted stand-in for the host tool.
//!
//! The stub records its arguments and standard input so the tests can check
//! what would have been passed to the real `hdiutil`.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use slidr_diskimage::{DiskImageError, DiskImageService, HdiutilService};
use tempfile::TempDir;

const STUB: &str = r#"#!/bin/sh
STATE="__STATE__"
echo "$*" >> "$STATE/args.log"
case "$1" in
  create)
    cat > "$STATE/create.stdin"
    for last; do :; done
    mkdir -p "$last"
    ;;
  attach)
    pw=$(cat)
    if [ "$pw" != "correcthorse1" ]; then
      echo "hdiutil: attach failed - Authentication error" >&2
      exit 1
    fi
    printf '/dev/disk4\tGUID_partition_scheme\t\n/dev/disk4s1\tApple_APFS\t\n/dev/disk5s1\t41504653-0000-11AA-AA11-00306543ECAC\t/Volumes/Slidr Vault\n'
    ;;
  imageinfo)
    pw=$(cat)
    if [ "$pw" != "correcthorse1" ]; then
      echo "hdiutil: imageinfo failed - Authentication error" >&2
      exit 1
    fi
    printf 'Format: UDSB\n'
    ;;
  info)
    printf 'framework       : 671.100.2\ndriver          : 10.15v671.100.2\n'
    ;;
  detach)
    if [ "$2" != "-force" ]; then
      echo "hdiutil: couldn't unmount \"disk4\" - Resource busy" >&2
      exit 16
    fi
    case "$3" in
      *Wedged*)
        echo "hdiutil: couldn't eject \"disk4\" - Resource busy" >&2
        exit 16
        ;;
    esac
    ;;
  chpass)
    cat > "$STATE/chpass.stdin"
    ;;
  *)
    echo "unsupported verb $1" >&2
    exit 2
    ;;
esac
"#;

struct Stub {
    dir: TempDir,
    service: HdiutilService,
}

impl Stub {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("hdiutil");
        std::fs::write(
            &script,
            STUB.replace("__STATE__", &dir.path().display().to_string()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let service = HdiutilService::with_binaries(
            script.display().to_string(),
            "/nonexistent/diskutil",
            "/nonexistent/umount",
        )
        .with_volumes_root(dir.path().join("Volumes"));
        Self { dir, service }
    }

    fn state(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(name)).unwrap()
    }

    fn args_log(&self) -> String {
        String::from_utf8(self.state("args.log")).unwrap()
    }

    fn container(&self) -> PathBuf {
        self.dir.path().join("Local Vault.sparsebundle")
    }
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

#[tokio::test]
async fn test_create_sends_password_on_stdin_only() {
    let stub = Stub::new();
    let seed = stub
        .service
        .create("Slidr Vault", &stub.dir.path().join("Local Vault"), &secret("correcthorse1"))
        .await
        .unwrap();

    assert_eq!(seed.container_path, stub.container());
    assert_eq!(seed.mount_point_name, "Slidr Vault");
    assert_eq!(stub.state("create.stdin"), b"correcthorse1");

    let args = stub.args_log();
    assert!(args.contains("-encryption AES-256"));
    assert!(args.contains("-stdinpass"));
    assert!(!args.contains("correcthorse1"));
}

#[tokio::test]
async fn test_attach_parses_mount_point_and_classifies_wrong_password() {
    let stub = Stub::new();
    std::fs::create_dir_all(stub.container()).unwrap();

    let err = stub
        .service
        .attach(&stub.container(), &secret("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_credential());

    let mount_point = stub
        .service
        .attach(&stub.container(), &secret("correcthorse1"))
        .await
        .unwrap();
    assert_eq!(mount_point, Path::new("/Volumes/Slidr Vault"));
}

#[tokio::test]
async fn test_detach_busy_unless_forced() {
    let stub = Stub::new();
    let mount_point = Path::new("/Volumes/Slidr Vault");

    let err = stub.service.detach(mount_point, false).await.unwrap_err();
    assert!(matches!(err, DiskImageError::DeviceBusy(_)));
    stub.service.detach(mount_point, true).await.unwrap();
}

#[tokio::test]
async fn test_forced_detach_runs_hdiutil_once() {
    let stub = Stub::new();
    let wedged = Path::new("/Volumes/Wedged Vault");

    let err = stub.service.detach(wedged, true).await.unwrap_err();
    assert!(matches!(err, DiskImageError::CommandFailed { .. }));

    let forced = stub
        .args_log()
        .lines()
        .filter(|line| line.starts_with("detach -force"))
        .count();
    assert_eq!(forced, 1);
}

#[tokio::test]
async fn test_verify_password() {
    let stub = Stub::new();
    std::fs::create_dir_all(stub.container()).unwrap();

    stub.service
        .verify_password(&stub.container(), &secret("correcthorse1"))
        .await
        .unwrap();
    let err = stub
        .service
        .verify_password(&stub.container(), &secret("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_credential());
    assert!(!stub.args_log().contains("correcthorse1"));
}

#[tokio::test]
async fn test_change_password_feeds_both_passwords() {
    let stub = Stub::new();
    std::fs::create_dir_all(stub.container()).unwrap();

    stub.service
        .change_password(&stub.container(), &secret("p1"), &secret("p2"))
        .await
        .unwrap();
    assert_eq!(stub.state("chpass.stdin"), b"p1\0p2\0");
}

#[tokio::test]
async fn test_missing_container_on_ejected_drive() {
    let stub = Stub::new();
    let container = stub
        .dir
        .path()
        .join("Volumes/Photos/Slidr External.sparsebundle");

    let err = stub
        .service
        .attach(&container, &secret("correcthorse1"))
        .await
        .unwrap_err();
    assert!(err.is_host_unavailable());
}

#[tokio::test]
async fn test_missing_tool() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("v.sparsebundle");
    std::fs::create_dir_all(&container).unwrap();
    let service = HdiutilService::with_binaries(
        "/nonexistent/hdiutil",
        "/nonexistent/diskutil",
        "/nonexistent/umount",
    );

    let err = service
        .resolve_mount_point(&container)
        .await
        .unwrap_err();
    assert!(matches!(err, DiskImageError::ToolMissing(_)));
}
