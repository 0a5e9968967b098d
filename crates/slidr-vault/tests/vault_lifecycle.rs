//! Vault lifecycle and password rotation against the fake disk image service.

mod common;

use common::{Harness, TEST_PASSWORD, secret};
use secrecy::ExposeSecret;
use slidr_vault::{
    CredentialStore, DEFAULT_CREDENTIAL_NAME, FailureCategory, VaultError, VaultRegistry,
    VaultState,
};

#[tokio::test]
async fn test_mount_twice_returns_same_mount_point() {
    let h = Harness::new();
    let vault = h.local_vault(TEST_PASSWORD).await;

    let first = h
        .service
        .mount_vault(&vault.id, &secret(TEST_PASSWORD))
        .await
        .unwrap();
    let second = h
        .service
        .mount_vault(&vault.id, &secret(TEST_PASSWORD))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.images.attached_count(), 1);
}

#[tokio::test]
async fn test_wrong_password_is_reported_as_such() {
    let h = Harness::new();
    let vault = h.local_vault(TEST_PASSWORD).await;

    let err = h
        .service
        .mount_vault(&vault.id, &secret("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidCredential(_)));
    assert_eq!(err.category(), FailureCategory::WrongPassword);
}

#[tokio::test]
async fn test_mounted_vault_still_checks_password() {
    let h = Harness::new();
    let vault = h.local_vault(TEST_PASSWORD).await;
    h.service
        .mount_vault(&vault.id, &secret(TEST_PASSWORD))
        .await
        .unwrap();

    let err = h
        .service
        .mount_vault(&vault.id, &secret("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidCredential(_)));
    assert_eq!(h.images.attached_count(), 1);
}

#[tokio::test]
async fn test_manifest_readable_with_nothing_attached() {
    let h = Harness::new();
    let local = h.local_vault(TEST_PASSWORD).await;
    let external = h.external_vault("Photos", TEST_PASSWORD).await;
    assert_eq!(h.images.attached_count(), 0);

    // A fresh registry, as after an application restart
    let registry = VaultRegistry::new(h.service.context());
    let manifest = registry.load().await.unwrap();

    assert_eq!(manifest.vaults.len(), 2);
    assert_eq!(manifest.local_vault(), Some(&local));
    assert_eq!(manifest.external_vaults(), vec![&external]);
    assert_eq!(local.volume_uuid.as_deref(), Some("TEST-UUID"));

    let states = h.service.vault_states().await.unwrap();
    assert!(states.iter().all(|(_, state)| *state == VaultState::Detached));
}

#[tokio::test]
async fn test_manifest_document_uses_camel_case_fields() {
    let h = Harness::new();
    h.local_vault(TEST_PASSWORD).await;

    let raw = std::fs::read_to_string(h.service.context().manifest_path()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let vault = &json["vaults"][0];
    assert_eq!(vault["driveType"], "local");
    assert_eq!(vault["mountPointName"], "Local Vault");
    assert!(vault["containerPath"].is_string());
    assert!(vault["createdDate"].is_string());
}

#[tokio::test]
async fn test_rotation_updates_every_vault_and_keychain() {
    let h = Harness::new();
    let local = h.local_vault("p1").await;
    let external = h.external_vault("Photos", "p1").await;

    h.service
        .change_all_passwords(&secret("p1"), &secret("p2"))
        .await
        .unwrap();

    for vault in [&local, &external] {
        assert!(h.images.accepts_password(&vault.container_path, &secret("p2")));
        assert!(!h.images.accepts_password(&vault.container_path, &secret("p1")));
    }
    let stored = h.credentials.load(DEFAULT_CREDENTIAL_NAME).unwrap().unwrap();
    assert_eq!(stored.expose_secret(), "p2");
}

#[tokio::test]
async fn test_failed_rotation_rolls_back_every_vault() {
    let h = Harness::new();
    let vaults = vec![
        h.local_vault("p1").await,
        h.external_vault("Photos", "p1").await,
        h.external_vault("Videos", "p1").await,
    ];
    h.images.fail_next_password_change(&vaults[2].container_path);

    let result = h
        .service
        .change_all_passwords(&secret("p1"), &secret("p2"))
        .await;
    assert!(matches!(result, Err(VaultError::DiskImage(_))));

    for vault in &vaults {
        assert!(
            h.images.accepts_password(&vault.container_path, &secret("p1")),
            "{} should still accept the old password",
            vault.name
        );
        assert!(!h.images.accepts_password(&vault.container_path, &secret("p2")));
    }
    // Two forward rotations and two reversals
    assert_eq!(h.images.password_changes(), 4);
    let stored = h.credentials.load(DEFAULT_CREDENTIAL_NAME).unwrap().unwrap();
    assert_eq!(stored.expose_secret(), "p1");
}

#[tokio::test]
async fn test_rotation_with_disconnected_drive_keeps_old_password() {
    let h = Harness::new();
    let local = h.local_vault("p1").await;
    let external = h.external_vault("External - Drive", "p1").await;
    h.eject_external_drive();

    let err = h
        .service
        .change_all_passwords(&secret("p1"), &secret("p2"))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::HostDriveUnavailable(_)));
    assert_eq!(err.category(), FailureCategory::DriveNotConnected);

    let mount_point = h.service.mount_vault(&local.id, &secret("p1")).await.unwrap();
    assert!(mount_point.is_dir());

    let states = h.service.vault_states().await.unwrap();
    let external_state = states
        .iter()
        .find(|(config, _)| config.id == external.id)
        .map(|(_, state)| state.clone());
    assert_eq!(external_state, Some(VaultState::HostDriveUnavailable));

    h.reconnect_external_drive();
    assert!(h.images.accepts_password(&external.container_path, &secret("p1")));
}

#[tokio::test]
async fn test_unmount_all_reports_busy_vaults() {
    let h = Harness::new();
    let local = h.local_vault(TEST_PASSWORD).await;
    let external = h.external_vault("Photos", TEST_PASSWORD).await;
    h.service
        .mount_vault(&local.id, &secret(TEST_PASSWORD))
        .await
        .unwrap();
    let busy = h
        .service
        .mount_vault(&external.id, &secret(TEST_PASSWORD))
        .await
        .unwrap();
    h.images.hold_open(&busy);

    let failures = h.service.unmount_all(false).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, external.id);
    assert!(matches!(failures[0].error, VaultError::DeviceBusy(_)));
    assert_eq!(h.images.attached_count(), 1);

    let failures = h.service.unmount_all(true).await.unwrap();
    assert!(failures.is_empty());
    assert_eq!(h.images.attached_count(), 0);
}

#[tokio::test]
async fn test_registration_failure_leaves_container_on_disk() {
    let h = Harness::new();
    // A directory where the lock file goes makes every manifest write fail
    std::fs::create_dir_all(h.service.context().manifest_path().with_extension("lock")).unwrap();

    let container = h.path("orphan.bundle");
    let err = h
        .service
        .create_vault(
            "Local Vault",
            &container,
            &secret(TEST_PASSWORD),
            slidr_vault::DriveType::Local,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::RegistryWriteFailed { .. }));
    assert!(container.exists());
}

#[tokio::test]
async fn test_resize_passes_through() {
    let h = Harness::new();
    let vault = h.local_vault(TEST_PASSWORD).await;

    h.service
        .resize_vault(&vault.id, &secret(TEST_PASSWORD), 512 * 1024 * 1024)
        .await
        .unwrap();
    let err = h
        .service
        .resize_vault(&vault.id, &secret("wrong"), 1024)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidCredential(_)));
}
