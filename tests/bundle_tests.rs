//! Tests for OCI bundle configuration generation.
//!
//! Validates the generated `config.json` document: process section from the
//! merged configuration, the fixed runtime-performed mounts, one device and
//! one cgroup whitelist entry per requested device, hooks with merged
//! environments, and the FD-handler annotations.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use nix::mount::MsFlags;
use tempfile::TempDir;

use squashrun::bundle::{BundleConfig, OciHook, OciHooks, OciSpec};
use squashrun::config::{
    AdminConfig, CommandRun, Config, Directories, RamFilesystemType, UserIdentity,
};
use squashrun::device::DeviceAccess;
use squashrun::image::{ImageMetadata, ImageReference};
use squashrun::mount::DeviceMount;

// =============================================================================
// Fixtures
// =============================================================================

fn admin_config() -> AdminConfig {
    AdminConfig {
        oci_bundle_dir: PathBuf::from("/var/lib/squashrun/bundle"),
        rootfs_folder: "rootfs".to_string(),
        temp_dir: PathBuf::from("/tmp"),
        ram_filesystem_type: RamFilesystemType::Tmpfs,
        runc_path: PathBuf::from("/usr/local/sbin/runc"),
        init_path: PathBuf::from("/usr/local/bin/tini"),
        mksquashfs_path: PathBuf::from("/usr/bin/mksquashfs"),
        mksquashfs_options: None,
        prefix_dir: PathBuf::from("/opt/squashrun"),
        oci_hooks: None,
        enable_pmix_v3_support: false,
        centralized_repository_dir: None,
        site_mounts: vec![],
    }
}

fn test_config(command_run: CommandRun) -> Config {
    Config {
        admin: admin_config(),
        user_identity: UserIdentity::current().unwrap(),
        image_reference: ImageReference::parse("alpine:3.18").unwrap(),
        directories: Directories {
            repository: PathBuf::from("/home/user/.squashrun"),
            images: PathBuf::from("/home/user/.squashrun/images"),
            cache: PathBuf::from("/home/user/.squashrun/cache"),
            temp: PathBuf::from("/tmp"),
        },
        command_run,
    }
}

fn device_mount(source: &str, access: &str) -> DeviceMount {
    DeviceMount {
        source: PathBuf::from(source),
        destination: PathBuf::from(source),
        flags: MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        access: DeviceAccess::parse(access).unwrap(),
    }
}

fn build_spec(config: &Config, metadata: &ImageMetadata) -> OciSpec {
    let annotations = BTreeMap::new();
    BundleConfig::new(config, &config.command_run, metadata, &annotations)
        .build_spec()
        .unwrap()
}

// =============================================================================
// Process Section
// =============================================================================

#[test]
fn test_process_args_env_and_cwd_come_from_the_merger() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/hostname".to_string()],
        workdir: Some(PathBuf::from("/work")),
        host_environment: HashMap::from([("HOST_KEY".to_string(), "1".to_string())]),
        ..Default::default()
    });
    let metadata = ImageMetadata {
        env: HashMap::from([("IMAGE_KEY".to_string(), "2".to_string())]),
        ..Default::default()
    };

    let spec = build_spec(&config, &metadata);
    assert_eq!(spec.process.args, vec!["/bin/hostname".to_string()]);
    assert_eq!(spec.process.cwd, "/work");
    assert!(spec.process.env.contains(&"HOST_KEY=1".to_string()));
    assert!(spec.process.env.contains(&"IMAGE_KEY=2".to_string()));
    assert!(!spec.process.terminal);
}

#[test]
fn test_process_runs_as_the_invoking_user() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    assert_eq!(spec.process.user.uid, nix::unistd::getuid().as_raw());
    assert_eq!(spec.process.user.gid, nix::unistd::getgid().as_raw());
}

#[test]
fn test_root_section_uses_the_configured_rootfs_folder() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    assert_eq!(spec.root.path, "rootfs");
    assert!(!spec.root.readonly, "overlay upper layer must stay writable");
}

// =============================================================================
// Devices
// =============================================================================

#[test]
fn test_one_whitelist_entry_per_device_mount() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        device_mounts: vec![
            device_mount("/dev/null", "rw"),
            device_mount("/dev/zero", "rwm"),
        ],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    let linux = spec.linux.expect("linux section");
    let resources = linux.resources.expect("resources section");
    assert_eq!(linux.devices.len(), 2);
    assert_eq!(resources.devices.len(), 2);
    assert!(resources.devices.iter().all(|rule| rule.allow));
}

#[test]
fn test_device_numbers_are_read_from_the_host() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        device_mounts: vec![device_mount("/dev/null", "rw")],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    let linux = spec.linux.expect("linux section");
    let device = &linux.devices[0];
    // /dev/null is char 1:3 on every Linux host.
    assert_eq!(device.device_type, "c");
    assert_eq!(device.major, 1);
    assert_eq!(device.minor, 3);
    assert_eq!(device.path, "/dev/null");

    let rule = &linux.resources.unwrap().devices[0];
    assert_eq!(rule.device_type, "c");
    assert_eq!(rule.major, 1);
    assert_eq!(rule.minor, 3);
    assert_eq!(rule.access, "rw");
}

#[test]
fn test_device_entry_generation_fails_for_non_device_sources() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        device_mounts: vec![device_mount("/etc/hosts", "rw")],
        ..Default::default()
    });
    let annotations = BTreeMap::new();
    let metadata = ImageMetadata::default();
    let result = BundleConfig::new(&config, &config.command_run, &metadata, &annotations)
        .build_spec();
    assert!(result.is_err(), "a regular file must not pass as a device");
}

// =============================================================================
// CPU Affinity
// =============================================================================

#[test]
fn test_recorded_affinity_becomes_a_cpuset() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        cpu_affinity: vec![0, 1, 2, 3, 7],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    let cpu = spec.linux.unwrap().resources.unwrap().cpu.unwrap();
    assert_eq!(cpu.cpus.as_deref(), Some("0-3,7"));
}

// =============================================================================
// Hooks and Annotations
// =============================================================================

#[test]
fn test_hooks_are_emitted_with_merged_environment() {
    let mut admin = admin_config();
    admin.oci_hooks = Some(OciHooks {
        prestart: vec![OciHook {
            path: "/opt/hooks/nvidia".to_string(),
            args: vec![],
            env: vec![],
        }],
        poststart: vec![],
        poststop: vec![],
    });

    let mut config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        hooks_environment: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
        ..Default::default()
    });
    config.admin = admin;

    let spec = build_spec(&config, &ImageMetadata::default());
    let hooks = spec.hooks.expect("hooks section");
    assert_eq!(hooks.prestart.len(), 1);
    assert_eq!(hooks.prestart[0].env, vec!["EXTRA=1".to_string()]);
}

#[test]
fn test_annotations_are_copied_into_the_document() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        ..Default::default()
    });
    let annotations = BTreeMap::from([(
        "com.hooks.logging.stdout_fd".to_string(),
        "3".to_string(),
    )]);
    let metadata = ImageMetadata::default();
    let spec = BundleConfig::new(&config, &config.command_run, &metadata, &annotations)
        .build_spec()
        .unwrap();

    assert_eq!(
        spec.annotations.get("com.hooks.logging.stdout_fd").map(String::as_str),
        Some("3")
    );
}

// =============================================================================
// Document Round Trip
// =============================================================================

#[test]
fn test_generated_document_reparses_with_device_cardinality() {
    let bundle_dir = TempDir::new().unwrap();
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        device_mounts: vec![
            device_mount("/dev/null", "r"),
            device_mount("/dev/zero", "rw"),
            device_mount("/dev/full", "rwm"),
        ],
        ..Default::default()
    });
    let annotations = BTreeMap::new();
    let metadata = ImageMetadata::default();

    BundleConfig::new(&config, &config.command_run, &metadata, &annotations)
        .generate(bundle_dir.path())
        .unwrap();

    let document = std::fs::read_to_string(bundle_dir.path().join("config.json")).unwrap();
    let reparsed: OciSpec = serde_json::from_str(&document).unwrap();

    assert_eq!(reparsed.oci_version, "1.0.2");
    let linux = reparsed.linux.expect("linux section");
    assert_eq!(
        linux.resources.expect("resources").devices.len(),
        config.command_run.device_mounts.len()
    );
}

#[test]
fn test_runtime_performed_mounts_are_in_application_order() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    let destinations: Vec<_> = spec
        .mounts
        .iter()
        .map(|mount| mount.destination.as_str())
        .collect();
    assert_eq!(
        destinations,
        vec!["/proc", "/sys", "/dev/pts", "/dev/shm", "/dev/mqueue"]
    );
    // Container-rooted destinations only, no host paths.
    assert!(destinations.iter().all(|dest| dest.starts_with('/')));
}

#[test]
fn test_namespaces_are_pid_and_mount() {
    let config = test_config(CommandRun {
        exec_args: vec!["/bin/true".to_string()],
        ..Default::default()
    });
    let spec = build_spec(&config, &ImageMetadata::default());

    let namespaces: Vec<_> = spec
        .linux
        .unwrap()
        .namespaces
        .iter()
        .map(|ns| ns.ns_type.clone())
        .collect();
    assert_eq!(namespaces, vec!["pid".to_string(), "mount".to_string()]);
}
