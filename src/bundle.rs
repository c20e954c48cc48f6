//! # OCI Bundle Configuration
//!
//! Serde model of the OCI runtime-spec `config.json` plus the generator
//! that fills it from the merged configuration. The generator only writes
//! the document; every mount except the runtime-performed defaults listed
//! in [`BundleConfig::default_mounts`] has already been carried out by the
//! orchestrator by the time `config.json` is produced.
//!
//! ## Devices
//!
//! For each requested device mount the document receives a pair of entries:
//! `linux.devices` (so the runtime creates the node) and a matching
//! `linux.resources.devices` whitelist rule. The whitelist is additive over
//! the runtime's defaults; no `allow: false` catch-all is written. Device
//! numbers are read fresh from the host at generation time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CommandRun, Config};
use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::error::{Context, Result};
use crate::image::ImageMetadata;
use crate::merger::Merger;
use crate::mount::DeviceMount;

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI runtime spec document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<OciHooks>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// OCI process credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// OCI lifecycle hooks, grouped by phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<OciHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<OciHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<OciHook>,
}

/// A single hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciHook {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<OciDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
}

/// OCI namespace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// OCI device node entry (`linux.devices`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciDevice {
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: i64,
    pub minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// OCI resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<OciDeviceCgroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
}

/// Devices-cgroup whitelist rule (`linux.resources.devices`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciDeviceCgroup {
    pub allow: bool,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: i64,
    pub minor: i64,
    pub access: String,
}

/// OCI CPU resource section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

// =============================================================================
// Generator
// =============================================================================

/// Builds and writes the bundle's `config.json`.
pub struct BundleConfig<'a> {
    config: &'a Config,
    command: &'a CommandRun,
    metadata: &'a ImageMetadata,
    annotations: &'a BTreeMap<String, String>,
}

impl<'a> BundleConfig<'a> {
    pub fn new(
        config: &'a Config,
        command: &'a CommandRun,
        metadata: &'a ImageMetadata,
        annotations: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            config,
            command,
            metadata,
            annotations,
        }
    }

    /// Writes `config.json` into `bundle_dir`.
    pub fn generate(&self, bundle_dir: &Path) -> Result<()> {
        debug!("generating bundle configuration");
        let spec = self.build_spec()?;
        let path = bundle_dir.join("config.json");
        let document = serde_json::to_string_pretty(&spec)
            .context("failed to serialize the bundle configuration")?;
        fs::write(&path, document)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("generated {}", path.display());
        Ok(())
    }

    /// Assembles the in-memory spec (exposed separately for inspection).
    pub fn build_spec(&self) -> Result<OciSpec> {
        let merger = Merger::new(self.command, self.metadata);

        let mut env: Vec<String> = merger
            .environment_in_container()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        env.sort();

        let (devices, device_rules) = self.device_entries()?;

        let cpu = if self.command.cpu_affinity.is_empty() {
            None
        } else {
            Some(OciCpu {
                cpus: Some(format_cpu_set(&self.command.cpu_affinity)),
            })
        };

        let resources = if device_rules.is_empty() && cpu.is_none() {
            None
        } else {
            Some(OciResources {
                devices: device_rules,
                cpu,
            })
        };

        Ok(OciSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            process: OciProcess {
                terminal: false,
                user: OciUser {
                    uid: self.config.user_identity.uid.as_raw(),
                    gid: self.config.user_identity.gid.as_raw(),
                    additional_gids: self
                        .config
                        .user_identity
                        .supplementary_gids
                        .iter()
                        .map(|gid| gid.as_raw())
                        .collect(),
                },
                args: merger.command_in_container()?,
                env,
                cwd: merger.cwd_in_container().display().to_string(),
            },
            root: OciRoot {
                path: self.config.admin.rootfs_folder.clone(),
                readonly: false,
            },
            mounts: Self::default_mounts(),
            hooks: self
                .config
                .admin
                .oci_hooks
                .as_ref()
                .map(|hooks| merger.hooks_in_container(hooks)),
            annotations: self.annotations.clone(),
            linux: Some(OciLinux {
                namespaces: vec![
                    OciNamespace {
                        ns_type: "pid".to_string(),
                        path: None,
                    },
                    OciNamespace {
                        ns_type: "mount".to_string(),
                        path: None,
                    },
                ],
                devices,
                resources,
            }),
        })
    }

    /// One `linux.devices` + `linux.resources.devices` pair per requested
    /// device, with numbers read fresh from the host.
    fn device_entries(&self) -> Result<(Vec<OciDevice>, Vec<OciDeviceCgroup>)> {
        let mut devices = Vec::with_capacity(self.command.device_mounts.len());
        let mut rules = Vec::with_capacity(self.command.device_mounts.len());

        for mount in &self.command.device_mounts {
            let (device, rule) = self.device_entry(mount)?;
            devices.push(device);
            rules.push(rule);
        }
        Ok((devices, rules))
    }

    fn device_entry(&self, mount: &DeviceMount) -> Result<(OciDevice, OciDeviceCgroup)> {
        let numbers = mount.numbers().with_context(|| {
            format!(
                "failed to resolve device numbers of {}",
                mount.source.display()
            )
        })?;
        let device_type = numbers.device_type.as_oci_str().to_string();

        let device = OciDevice {
            path: mount.destination.display().to_string(),
            device_type: device_type.clone(),
            major: numbers.major,
            minor: numbers.minor,
            uid: Some(self.config.user_identity.uid.as_raw()),
            gid: Some(self.config.user_identity.gid.as_raw()),
        };
        let rule = OciDeviceCgroup {
            allow: true,
            device_type,
            major: numbers.major,
            minor: numbers.minor,
            access: mount.access.to_string(),
        };
        Ok((device, rule))
    }

    /// Mounts delegated to the runtime, in application order. Everything
    /// else (rootfs overlay, `/dev`, custom, device and feature mounts) is
    /// performed by the orchestrator before the runtime starts.
    fn default_mounts() -> Vec<OciMount> {
        vec![
            OciMount {
                destination: "/proc".to_string(),
                mount_type: "proc".to_string(),
                source: "proc".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                ],
            },
            OciMount {
                destination: "/sys".to_string(),
                mount_type: "sysfs".to_string(),
                source: "sysfs".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                    "ro".to_string(),
                ],
            },
            OciMount {
                destination: "/dev/pts".to_string(),
                mount_type: "devpts".to_string(),
                source: "devpts".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "newinstance".to_string(),
                    "ptmxmode=0666".to_string(),
                    "mode=0620".to_string(),
                ],
            },
            OciMount {
                destination: "/dev/shm".to_string(),
                mount_type: "tmpfs".to_string(),
                source: "shm".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                    "mode=1777".to_string(),
                    "size=65536k".to_string(),
                ],
            },
            OciMount {
                destination: "/dev/mqueue".to_string(),
                mount_type: "mqueue".to_string(),
                source: "mqueue".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                ],
            },
        ]
    }
}

/// Compresses a sorted CPU id list into cpuset syntax (`0-3,7`).
fn format_cpu_set(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    ranges.join(",")
}
