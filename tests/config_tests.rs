//! Tests for the admin configuration loader and directory resolution.

use std::path::PathBuf;

use tempfile::TempDir;

use squashrun::config::{AdminConfig, Directories, RamFilesystemType, UserIdentity};
use squashrun::error::ErrorKind;

// =============================================================================
// Fixtures
// =============================================================================

fn admin_document(temp_dir: &str) -> String {
    format!(
        r#"{{
            "OCIBundleDir": "/var/lib/squashrun/bundle",
            "rootfsFolder": "rootfs",
            "tempDir": "{temp_dir}",
            "ramFilesystemType": "tmpfs",
            "runcPath": "/usr/local/sbin/runc",
            "initPath": "/usr/local/bin/tini",
            "mksquashfsPath": "/usr/bin/mksquashfs",
            "prefixDir": "/opt/squashrun"
        }}"#
    )
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("squashrun.json");
    std::fs::write(&path, content).unwrap();
    path
}

// =============================================================================
// Loading and Validation
// =============================================================================

#[test]
fn test_load_minimal_document() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &admin_document("/tmp"));

    let admin = AdminConfig::load(&path).unwrap();
    assert_eq!(admin.oci_bundle_dir, PathBuf::from("/var/lib/squashrun/bundle"));
    assert_eq!(admin.rootfs_folder, "rootfs");
    assert_eq!(admin.ram_filesystem_type, RamFilesystemType::Tmpfs);
    assert!(admin.oci_hooks.is_none());
    assert!(!admin.enable_pmix_v3_support);
    assert!(admin.site_mounts.is_empty());
}

#[test]
fn test_load_optional_keys() {
    let dir = TempDir::new().unwrap();
    let document = r#"{
        "OCIBundleDir": "/var/lib/squashrun/bundle",
        "rootfsFolder": "rootfs",
        "tempDir": "/tmp",
        "ramFilesystemType": "ramfs",
        "runcPath": "/usr/local/sbin/runc",
        "initPath": "/usr/local/bin/tini",
        "mksquashfsPath": "/usr/bin/mksquashfs",
        "mksquashfsOptions": "-comp gzip",
        "prefixDir": "/opt/squashrun",
        "enablePMIxv3Support": true,
        "centralizedRepositoryDir": "/scratch/shared/squashrun",
        "siteMounts": ["/opt/site-libs:/opt/site-libs:ro"],
        "OCIHooks": {
            "prestart": [
                {"path": "/opt/hooks/nvidia", "env": ["NVIDIA_HOOK=1"]}
            ]
        }
    }"#;
    let path = write_config(&dir, document);

    let admin = AdminConfig::load(&path).unwrap();
    assert_eq!(admin.ram_filesystem_type, RamFilesystemType::Ramfs);
    assert!(admin.enable_pmix_v3_support);
    assert_eq!(
        admin.centralized_repository_dir,
        Some(PathBuf::from("/scratch/shared/squashrun"))
    );
    assert_eq!(admin.site_mounts.len(), 1);
    let hooks = admin.oci_hooks.unwrap();
    assert_eq!(hooks.prestart.len(), 1);
    assert_eq!(hooks.prestart[0].path, "/opt/hooks/nvidia");
}

#[test]
fn test_load_fails_on_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = AdminConfig::load(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
}

#[test]
fn test_load_fails_on_missing_required_key() {
    let dir = TempDir::new().unwrap();
    // No runcPath.
    let document = r#"{
        "OCIBundleDir": "/var/lib/squashrun/bundle",
        "rootfsFolder": "rootfs",
        "tempDir": "/tmp",
        "ramFilesystemType": "tmpfs",
        "initPath": "/usr/local/bin/tini",
        "mksquashfsPath": "/usr/bin/mksquashfs",
        "prefixDir": "/opt/squashrun"
    }"#;
    let path = write_config(&dir, document);

    let err = AdminConfig::load(&path).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
    assert!(err.to_string().contains("malformed"), "{err}");
}

#[test]
fn test_load_fails_on_unknown_filesystem_type() {
    let dir = TempDir::new().unwrap();
    let document = admin_document("/tmp").replace("tmpfs", "zramfs");
    let path = write_config(&dir, &document);

    let err = AdminConfig::load(&path).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
}

#[test]
fn test_validate_rejects_relative_paths() {
    let dir = TempDir::new().unwrap();
    let document = admin_document("/tmp").replace("/usr/local/sbin/runc", "bin/runc");
    let path = write_config(&dir, &document);

    let err = AdminConfig::load(&path).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
    assert!(err.to_string().contains("runcPath"), "{err}");
}

#[test]
fn test_validate_rejects_nested_rootfs_folder() {
    let dir = TempDir::new().unwrap();
    let document = admin_document("/tmp").replace("\"rootfsFolder\": \"rootfs\"", "\"rootfsFolder\": \"a/b\"");
    let path = write_config(&dir, &document);

    let err = AdminConfig::load(&path).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
}

// =============================================================================
// Directory Resolution
// =============================================================================

#[test]
fn test_centralized_repository_directories_are_created() {
    let repo = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let document = admin_document(temp.path().to_str().unwrap());
    let path = write_config(&dir, &document);

    let mut admin = AdminConfig::load(&path).unwrap();
    admin.centralized_repository_dir = Some(repo.path().to_path_buf());
    let identity = UserIdentity::current().unwrap();

    let directories = Directories::initialize(true, &admin, &identity, None).unwrap();
    assert_eq!(directories.repository, repo.path());
    assert_eq!(directories.images, repo.path().join("images"));
    assert!(directories.images.is_dir(), "images dir should be created");
    assert!(directories.cache.join("ociImages").is_dir());
    assert!(directories.cache.join("blobs").is_dir());
    assert_eq!(directories.temp, temp.path());
}

#[test]
fn test_centralized_repository_requires_configuration() {
    let temp = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &admin_document(temp.path().to_str().unwrap()));

    let admin = AdminConfig::load(&path).unwrap();
    let identity = UserIdentity::current().unwrap();

    let err = Directories::initialize(true, &admin, &identity, None).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
    assert!(err.to_string().contains("centralizedRepositoryDir"), "{err}");
}

#[test]
fn test_missing_temp_directory_is_invalid_config() {
    let repo = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &admin_document("/nonexistent-temp-dir-xyz"));

    let mut admin = AdminConfig::load(&path).unwrap();
    admin.centralized_repository_dir = Some(repo.path().to_path_buf());
    let identity = UserIdentity::current().unwrap();

    let err = Directories::initialize(true, &admin, &identity, None).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
    assert!(err.to_string().contains("temporary directory"), "{err}");
}

#[test]
fn test_cli_temp_dir_override_wins() {
    let repo = TempDir::new().unwrap();
    let configured_temp = TempDir::new().unwrap();
    let override_temp = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &admin_document(configured_temp.path().to_str().unwrap()));

    let mut admin = AdminConfig::load(&path).unwrap();
    admin.centralized_repository_dir = Some(repo.path().to_path_buf());
    let identity = UserIdentity::current().unwrap();

    let directories = Directories::initialize(
        true,
        &admin,
        &identity,
        Some(override_temp.path().to_path_buf()),
    )
    .unwrap();
    assert_eq!(directories.temp, override_temp.path());
}

// =============================================================================
// User Identity
// =============================================================================

#[test]
fn test_user_identity_captures_real_ids() {
    let identity = UserIdentity::current().unwrap();
    assert_eq!(identity.uid, nix::unistd::getuid());
    assert_eq!(identity.gid, nix::unistd::getgid());
}
