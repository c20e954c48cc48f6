//! Constants for the bundle preparation pipeline.
//!
//! All environment keys, annotation keys, and fixed defaults live here so
//! the launcher and the site hooks agree on a single spelling.

// =============================================================================
// Image References
// =============================================================================

/// Registry server assumed when a reference does not name one.
pub const DEFAULT_REGISTRY_SERVER: &str = "docker.io";

/// Repository namespace assumed when a reference does not name one.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// Tag assumed when a reference carries neither tag nor digest.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// File suffix of squashfs images in the local repository.
pub const IMAGE_FILE_SUFFIX: &str = ".squashfs";

/// File suffix of the per-image metadata document.
pub const METADATA_FILE_SUFFIX: &str = ".meta";

// =============================================================================
// Repository Layout
// =============================================================================

/// Name of the per-user repository directory under `$HOME`.
pub const LOCAL_REPOSITORY_NAME: &str = ".squashrun";

/// Subdirectory of the repository holding squashfs images and metadata.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory of the repository used as the image-manager cache.
pub const CACHE_DIR: &str = "cache";

/// Admin configuration document, relative to the installation prefix.
pub const ADMIN_CONFIG_RELATIVE_PATH: &str = "etc/squashrun.json";

// =============================================================================
// Container Environment Keys
// =============================================================================

/// PMI file descriptor advertised by the MPI launcher on the host.
pub const PMI_FD_VAR: &str = "PMI_FD";

/// Host-side GPU selection set by the workload manager.
pub const CUDA_VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Sentinel the workload manager uses when no GPU is assigned.
pub const NO_DEV_FILES_SENTINEL: &str = "NoDevFiles";

/// GPU selection consumed by the Nvidia container hook.
pub const NVIDIA_VISIBLE_DEVICES_VAR: &str = "NVIDIA_VISIBLE_DEVICES";

/// Driver capability selection consumed by the Nvidia container hook.
pub const NVIDIA_DRIVER_CAPABILITIES_VAR: &str = "NVIDIA_DRIVER_CAPABILITIES";

/// Capabilities granted when the image does not restrict them.
pub const NVIDIA_DEFAULT_DRIVER_CAPABILITIES: &str = "all";

/// Flag key the MPI hook triggers on.
pub const MPI_HOOK_VAR: &str = "SARUS_MPI_HOOK";

/// Flag key the SSH hook triggers on.
pub const SSH_HOOK_VAR: &str = "SARUS_SSH_HOOK";

/// Flag key the Slurm global-sync hook triggers on.
pub const SLURM_GLOBAL_SYNC_HOOK_VAR: &str = "SARUS_SLURM_GLOBAL_SYNC_HOOK";

/// PMIx server rendezvous directory exported by the workload manager.
pub const PMIX_SERVER_TMPDIR_VAR: &str = "PMIX_SERVER_TMPDIR";

// =============================================================================
// Bundle Annotations
// =============================================================================

/// Annotation carrying the duplicated stdout descriptor for logging hooks.
pub const STDOUT_FD_ANNOTATION: &str = "com.hooks.logging.stdout_fd";

/// Annotation carrying the duplicated stderr descriptor for logging hooks.
pub const STDERR_FD_ANNOTATION: &str = "com.hooks.logging.stderr_fd";

// =============================================================================
// Orchestration Defaults
// =============================================================================

/// OCI Runtime Spec version written into generated bundles.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// The only PATH visible to the spawned OCI runtime.
pub const SANITIZED_PATH: &str = "/bin:/sbin:/usr/bin";

/// Mount options of the tmpfs backing the container's `/dev`.
pub const DEV_FILESYSTEM_OPTIONS: &str = "mode=755,size=65536k";

/// Working directory used when neither the CLI nor the image set one.
pub const DEFAULT_CONTAINER_CWD: &str = "/";

/// Length of the random suffix appended to generated container ids.
pub const CONTAINER_ID_RANDOM_LEN: usize = 16;
