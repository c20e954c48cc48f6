//! # Admin Configuration and Per-Invocation Config
//!
//! [`AdminConfig`] is the site administrator's JSON document, deserialized
//! and semantically validated at startup. [`Config`] bundles it with the
//! invoking user's identity, the parsed image reference, the resolved
//! repository directories and the per-invocation [`CommandRun`] request.
//!
//! `Config` is built once at entry and is read-only afterwards; the
//! orchestrator holds the single owner and hands out shared references.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, getgid, getgroups, getuid, Gid, Uid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::OciHooks;
use crate::constants::{CACHE_DIR, IMAGES_DIR, LOCAL_REPOSITORY_NAME};
use crate::error::{Context, Error, ErrorKind, Result};
use crate::image::ImageReference;
use crate::mount::{DeviceMount, MountDescriptor};

// =============================================================================
// Admin Configuration
// =============================================================================

/// RAM-backed filesystem used for the bundle and the container's `/dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RamFilesystemType {
    Tmpfs,
    Ramfs,
}

impl RamFilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tmpfs => "tmpfs",
            Self::Ramfs => "ramfs",
        }
    }
}

/// The site administrator's configuration document.
///
/// Typed deserialization is the structural validation layer; the semantic
/// checks (path absoluteness etc.) live in [`AdminConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Directory the bundle tmpfs is mounted on.
    #[serde(rename = "OCIBundleDir")]
    pub oci_bundle_dir: PathBuf,

    /// Name of the rootfs directory inside the bundle (relative).
    #[serde(rename = "rootfsFolder")]
    pub rootfs_folder: String,

    /// Scratch directory; must exist before the launcher runs.
    #[serde(rename = "tempDir")]
    pub temp_dir: PathBuf,

    /// Filesystem type backing the bundle and `/dev`.
    #[serde(rename = "ramFilesystemType")]
    pub ram_filesystem_type: RamFilesystemType,

    /// Absolute path of the external OCI runtime binary.
    #[serde(rename = "runcPath")]
    pub runc_path: PathBuf,

    /// Absolute path of the init binary bound at `/dev/init` for `--init`.
    #[serde(rename = "initPath")]
    pub init_path: PathBuf,

    /// Absolute path of the mksquashfs binary (used by the image manager;
    /// kept here because the two pipelines share one document).
    #[serde(rename = "mksquashfsPath")]
    pub mksquashfs_path: PathBuf,

    /// Extra options passed to mksquashfs by the image manager.
    #[serde(rename = "mksquashfsOptions", default)]
    pub mksquashfs_options: Option<String>,

    /// Installation prefix; `etc/` below it holds the container passwd,
    /// group and nsswitch templates.
    #[serde(rename = "prefixDir")]
    pub prefix_dir: PathBuf,

    /// Hooks entered into every generated bundle.
    #[serde(rename = "OCIHooks", default)]
    pub oci_hooks: Option<OciHooks>,

    /// Whether the PMIx v3 rendezvous directory is mounted automatically.
    #[serde(rename = "enablePMIxv3Support", default)]
    pub enable_pmix_v3_support: bool,

    /// Shared image repository used with `--centralized-repository`.
    #[serde(rename = "centralizedRepositoryDir", default)]
    pub centralized_repository_dir: Option<PathBuf>,

    /// Admin-defined bind mounts, same syntax as `--mount`, applied before
    /// any user mount.
    #[serde(rename = "siteMounts", default)]
    pub site_mounts: Vec<String>,
}

impl AdminConfig {
    /// Reads and validates the admin configuration document.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("loading admin configuration from {}", path.display());

        let content = fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::InvalidConfig(format!(
                "cannot read {}: {err}",
                path.display()
            )))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|err| {
            Error::new(ErrorKind::InvalidConfig(format!(
                "malformed admin configuration {}: {err}",
                path.display()
            )))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        let absolute = [
            ("OCIBundleDir", &self.oci_bundle_dir),
            ("tempDir", &self.temp_dir),
            ("runcPath", &self.runc_path),
            ("initPath", &self.init_path),
            ("mksquashfsPath", &self.mksquashfs_path),
            ("prefixDir", &self.prefix_dir),
        ];
        for (key, path) in absolute {
            if !path.is_absolute() {
                return Err(Error::new(ErrorKind::InvalidConfig(format!(
                    "'{key}' must be an absolute path, got '{}'",
                    path.display()
                ))));
            }
        }

        if self.rootfs_folder.is_empty() || self.rootfs_folder.contains('/') {
            return Err(Error::new(ErrorKind::InvalidConfig(format!(
                "'rootfsFolder' must be a plain directory name, got '{}'",
                self.rootfs_folder
            ))));
        }

        if let Some(dir) = &self.centralized_repository_dir {
            if !dir.is_absolute() {
                return Err(Error::new(ErrorKind::InvalidConfig(format!(
                    "'centralizedRepositoryDir' must be an absolute path, got '{}'",
                    dir.display()
                ))));
            }
        }

        Ok(())
    }
}

// =============================================================================
// User Identity
// =============================================================================

/// The invoking user, captured before any privileged operation.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
}

impl UserIdentity {
    /// Captures the real uid/gid and the supplementary groups.
    ///
    /// The real (not effective) ids are used: with a setuid launcher they
    /// name the invoking user, which is who the container runs as.
    pub fn current() -> Result<Self> {
        let supplementary_gids = getgroups()
            .map_err(|errno| {
                Error::new(ErrorKind::InvalidConfig(format!(
                    "cannot read supplementary groups: {errno}"
                )))
            })?;
        Ok(Self {
            uid: getuid(),
            gid: getgid(),
            supplementary_gids,
        })
    }
}

// =============================================================================
// Directories
// =============================================================================

/// Resolved repository directories.
#[derive(Debug, Clone)]
pub struct Directories {
    /// Image repository root (local per-user or centralized).
    pub repository: PathBuf,
    /// `<repository>/images` — squashfs images and metadata.
    pub images: PathBuf,
    /// `<repository>/cache` — image-manager cache (shared layout).
    pub cache: PathBuf,
    /// Scratch directory.
    pub temp: PathBuf,
}

impl Directories {
    /// Resolves the directories and creates the missing ones, owned by the
    /// invoking user. The temp directory is never created: it must already
    /// exist as a directory.
    pub fn initialize(
        use_centralized_repository: bool,
        admin: &AdminConfig,
        identity: &UserIdentity,
        temp_override: Option<PathBuf>,
    ) -> Result<Self> {
        let repository = if use_centralized_repository {
            debug!("initializing directories for the centralized repository");
            admin.centralized_repository_dir.clone().ok_or_else(|| {
                Error::new(ErrorKind::InvalidConfig(
                    "centralized repository requested but 'centralizedRepositoryDir' is not \
                     configured"
                        .to_string(),
                ))
            })?
        } else {
            debug!("initializing directories for the local repository");
            local_repository_directory()?
        };

        let images = repository.join(IMAGES_DIR);
        create_directories_as_user(&images, identity)?;

        let cache = repository.join(CACHE_DIR);
        create_directories_as_user(&cache.join("ociImages"), identity)?;
        create_directories_as_user(&cache.join("blobs"), identity)?;

        let temp = temp_override.unwrap_or_else(|| admin.temp_dir.clone());
        if !temp.is_dir() {
            return Err(Error::new(ErrorKind::InvalidConfig(format!(
                "invalid temporary directory {}",
                temp.display()
            ))));
        }

        Ok(Self {
            repository,
            images,
            cache,
            temp,
        })
    }
}

/// `$HOME/.squashrun`, preferring the HOME variable over the passwd entry.
fn local_repository_directory() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .ok_or_else(|| {
            Error::new(ErrorKind::InvalidConfig(
                "cannot determine the home directory for the local repository".to_string(),
            ))
        })?;
    Ok(home.join(LOCAL_REPOSITORY_NAME))
}

/// Creates every missing component of `path`, chown-ing what it creates to
/// the invoking user so the image manager can write there later.
fn create_directories_as_user(path: &Path, identity: &UserIdentity) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.exists() {
            continue;
        }
        fs::create_dir(&current)
            .with_context(|| format!("failed to create directory {}", current.display()))?;
        chown(&current, Some(identity.uid), Some(identity.gid)).map_err(|errno| {
            Error::new(ErrorKind::InvalidConfig(format!(
                "failed to chown {} to uid {}: {errno}",
                current.display(),
                identity.uid
            )))
        })?;
    }
    Ok(())
}

// =============================================================================
// Per-Invocation Request
// =============================================================================

/// Everything the CLI contributes to one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandRun {
    /// The host environment captured at entry.
    pub host_environment: HashMap<String, String>,
    /// Command argv from the CLI (replaces the image cmd when non-empty).
    pub exec_args: Vec<String>,
    /// Entrypoint override (replaces image entrypoint, discards image cmd).
    pub entrypoint: Option<Vec<String>>,
    /// Working-directory override.
    pub workdir: Option<PathBuf>,
    /// Custom bind mounts, site mounts first, in request order.
    pub mounts: Vec<MountDescriptor>,
    /// Device mounts in request order.
    pub device_mounts: Vec<DeviceMount>,
    /// Per-invocation overrides of hook environments.
    pub hooks_environment: HashMap<String, String>,
    /// Activate the MPI hook.
    pub use_mpi: bool,
    /// Activate the SSH and Slurm global-sync hooks.
    pub enable_ssh: bool,
    /// Bind the admin-configured init binary at `/dev/init`.
    pub add_init_process: bool,
    /// CPU affinity of the launcher, recorded during bundle setup.
    pub cpu_affinity: Vec<usize>,
}

// =============================================================================
// Config
// =============================================================================

/// Process-wide configuration, immutable after assembly.
#[derive(Debug)]
pub struct Config {
    pub admin: AdminConfig,
    pub user_identity: UserIdentity,
    pub image_reference: ImageReference,
    pub directories: Directories,
    pub command_run: CommandRun,
}

impl Config {
    /// Path of the squashfs image selected by this invocation.
    pub fn image_file(&self) -> PathBuf {
        self.image_reference.image_file(&self.directories.images)
    }

    /// Path of the metadata document of the selected image.
    pub fn metadata_file(&self) -> PathBuf {
        self.image_reference.metadata_file(&self.directories.images)
    }
}

/// Installation prefix derived from the running binary (`<prefix>/bin/…`).
pub fn installation_prefix() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine the running binary path")?;
    exe.parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            Error::new(ErrorKind::InvalidConfig(format!(
                "cannot derive the installation prefix from {}",
                exe.display()
            )))
        })
}
