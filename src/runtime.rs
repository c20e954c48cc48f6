//! # Runtime Orchestrator
//!
//! The central state machine of the launcher. [`Runtime::setup_bundle`]
//! executes a fixed sequence of namespace, mount and descriptor operations
//! that turns the squashfs image into an OCI bundle on a private tmpfs;
//! [`Runtime::execute_container`] then forks and execs the external OCI
//! runtime on that bundle and proxies signals until it exits.
//!
//! ## Step Order Is an Invariant
//!
//! The mount-namespace unshare must precede every mount, or the host mount
//! table is modified. The rootfs `MS_NOSUID` remount must follow every bind
//! mount into the rootfs, or the earlier mounts would be masked. Custom
//! mounts are performed in request order. Do not reorder the steps.
//!
//! ## Failure Semantics
//!
//! Any setup step failing aborts the invocation. There is no rollback: the
//! bundle tmpfs and every mount below it live in this process's private
//! mount namespace, which the kernel releases at process exit, and the loop
//! device is flagged autoclear. A nonzero exit of the runtime child is not
//! a setup error; it is propagated verbatim as the launcher's exit status.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sched::{sched_getaffinity, unshare, CloneFlags, CpuSet};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chown, execve, fork, getpid, getppid, ForkResult, Pid};
use tracing::{debug, info};

use crate::bundle::BundleConfig;
use crate::config::{CommandRun, Config, UserIdentity};
use crate::constants::{
    CONTAINER_ID_RANDOM_LEN, DEV_FILESYSTEM_OPTIONS, PMIX_SERVER_TMPDIR_VAR, SANITIZED_PATH,
};
use crate::error::{Context, Error, ErrorKind, Result};
use crate::fdhandler::FdHandler;
use crate::image::ImageMetadata;
use crate::mount::{
    bind_mount, loop_mount_squashfs, mount_ram_filesystem, remount, set_propagation, BindMount,
    MountDescriptor, OverlayMount,
};

/// Signals forwarded from the launcher to the runtime child.
const PROXIED_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// The runtime child, published for the signal-forwarding handler.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// One container invocation: owns the `Config` and the bundle being built.
pub struct Runtime {
    config: Arc<Config>,
    bundle_dir: PathBuf,
    rootfs_dir: PathBuf,
    /// Working copy of the run request: CPU affinity and the `PMI_FD`
    /// rewrite land here, keeping the shared `Config` immutable.
    command: CommandRun,
    metadata: ImageMetadata,
    annotations: BTreeMap<String, String>,
    fd_handler: FdHandler,
    /// The sanitized environment the OCI runtime is exec-ed with. Built
    /// once, never read back from the process environment.
    runtime_environment: Vec<(String, String)>,
}

impl Runtime {
    /// Prepares an invocation for the image selected in `config`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidRequest`] when the image is not present in the
    /// local repository.
    pub fn new(config: Config) -> Result<Self> {
        let image_file = config.image_file();
        if !image_file.is_file() {
            return Err(Error::new(ErrorKind::InvalidRequest(format!(
                "image {} is not available in the local repository; pull it first",
                config.image_reference
            ))));
        }

        let metadata_file = config.metadata_file();
        let metadata = if metadata_file.is_file() {
            ImageMetadata::load(&metadata_file)?
        } else {
            debug!(
                "no metadata document at {}, using empty image metadata",
                metadata_file.display()
            );
            ImageMetadata::default()
        };

        let bundle_dir = config.admin.oci_bundle_dir.clone();
        let rootfs_dir = bundle_dir.join(&config.admin.rootfs_folder);
        let command = config.command_run.clone();

        Ok(Self {
            config: Arc::new(config),
            bundle_dir,
            rootfs_dir,
            command,
            metadata,
            annotations: BTreeMap::new(),
            fd_handler: FdHandler::new(),
            runtime_environment: Vec::new(),
        })
    }

    /// The bundle directory of this invocation.
    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    // =========================================================================
    // Bundle Setup
    // =========================================================================

    /// Builds the OCI bundle. The step order is a hard invariant.
    pub fn setup_bundle(&mut self) -> Result<()> {
        info!("setting up OCI bundle");

        self.sanitize_environment();
        self.record_cpu_affinity()?;
        self.setup_mount_isolation()?;
        self.setup_ram_filesystem()?;
        self.mount_image_into_rootfs()?;
        self.setup_dev_filesystem()?;
        self.copy_etc_files_into_rootfs()?;
        self.mount_init_program_if_necessary()?;
        self.perform_custom_mounts()?;
        self.perform_extra_mounts()?;
        self.perform_device_mounts()?;
        self.remount_rootfs_with_nosuid()?;
        self.setup_file_descriptors()?;
        self.generate_bundle_config()?;

        info!("successfully set up OCI bundle");
        Ok(())
    }

    /// Step 1: the runtime gets a minimal, explicitly constructed
    /// environment instead of whatever the caller exported.
    fn sanitize_environment(&mut self) {
        self.runtime_environment =
            vec![("PATH".to_string(), SANITIZED_PATH.to_string())];
    }

    /// Step 2: the launcher's CPU affinity is recorded so the bundle can
    /// pin the container to the CPUs the workload manager assigned.
    fn record_cpu_affinity(&mut self) -> Result<()> {
        let set = sched_getaffinity(Pid::from_raw(0))
            .map_err(|errno| errno_error(errno))
            .context("failed to read CPU affinity")?;
        self.command.cpu_affinity = (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect();
        debug!("recorded CPU affinity {:?}", self.command.cpu_affinity);
        Ok(())
    }

    /// Step 3: private mount namespace, with propagation to the host cut.
    fn setup_mount_isolation(&self) -> Result<()> {
        info!("setting up mount isolation");
        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|errno| errno_error(errno))
            .context("failed to unshare the mount namespace")?;

        // Without this, MS_SHARED mounts inherited from the host would leak
        // every following mount back out of the new namespace.
        set_propagation(Path::new("/"), MsFlags::MS_SLAVE | MsFlags::MS_REC)
            .context("failed to remount \"/\" with MS_SLAVE")?;
        Ok(())
    }

    /// Step 4: RAM-backed bundle directory, slave propagation, 0755.
    fn setup_ram_filesystem(&self) -> Result<()> {
        info!("setting up RAM filesystem");
        let fstype = self.config.admin.ram_filesystem_type.as_str();

        fs::create_dir_all(&self.bundle_dir).with_context(|| {
            format!(
                "failed to create bundle directory {}",
                self.bundle_dir.display()
            )
        })?;
        mount_ram_filesystem(
            &self.bundle_dir,
            fstype,
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None,
        )?;
        // The mount may come up shared depending on the parent; force slave.
        set_propagation(&self.bundle_dir, MsFlags::MS_SLAVE | MsFlags::MS_REC)?;

        // An explicit permission change works for ramfs too, which has no
        // mode= mount option.
        fs::set_permissions(&self.bundle_dir, fs::Permissions::from_mode(0o755))
            .with_context(|| {
                format!(
                    "failed to set permissions on {}",
                    self.bundle_dir.display()
                )
            })?;
        Ok(())
    }

    /// Step 5: squashfs lower layer + user-writable upper, merged onto the
    /// rootfs directory.
    fn mount_image_into_rootfs(&self) -> Result<()> {
        info!("mounting image into bundle rootfs");
        let overlay = self.bundle_dir.join("overlay");
        let lower = overlay.join("rootfs-lower");
        let upper = overlay.join("rootfs-upper");
        let work = overlay.join("rootfs-work");

        for dir in [&self.rootfs_dir, &lower, &work] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        create_directory_as_user(&upper, &self.config.user_identity)?;

        loop_mount_squashfs(&self.config.image_file(), &lower)?;
        MountDescriptor::Overlay(OverlayMount {
            lower,
            upper,
            work,
            merged: self.rootfs_dir.clone(),
        })
        .perform(&self.rootfs_dir)?;
        Ok(())
    }

    /// Step 6: tmpfs on `<rootfs>/dev`.
    fn setup_dev_filesystem(&self) -> Result<()> {
        info!("setting up /dev filesystem");
        let dev = self.rootfs_dir.join("dev");
        fs::create_dir_all(&dev)
            .with_context(|| format!("failed to create {}", dev.display()))?;
        mount_ram_filesystem(
            &dev,
            self.config.admin.ram_filesystem_type.as_str(),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some(DEV_FILESYSTEM_OPTIONS),
        )?;
        Ok(())
    }

    /// Step 7: name resolution and identity files.
    fn copy_etc_files_into_rootfs(&self) -> Result<()> {
        info!("copying /etc files into rootfs");
        let prefix = &self.config.admin.prefix_dir;
        let identity = &self.config.user_identity;

        copy_file_as_user(
            Path::new("/etc/hosts"),
            &self.rootfs_dir.join("etc/hosts"),
            identity,
        )?;
        copy_file_as_user(
            Path::new("/etc/resolv.conf"),
            &self.rootfs_dir.join("etc/resolv.conf"),
            identity,
        )?;
        copy_file_as_user(
            &prefix.join("etc/container/nsswitch.conf"),
            &self.rootfs_dir.join("etc/nsswitch.conf"),
            identity,
        )?;
        copy_file_as_user(
            &prefix.join("etc/passwd"),
            &self.rootfs_dir.join("etc/passwd"),
            identity,
        )?;
        copy_file_as_user(
            &prefix.join("etc/group"),
            &self.rootfs_dir.join("etc/group"),
            identity,
        )?;
        Ok(())
    }

    /// Step 8: the init binary lands at `/dev/init` when `--init` is given.
    fn mount_init_program_if_necessary(&self) -> Result<()> {
        if !self.command.add_init_process {
            return Ok(());
        }
        info!("mounting init program into rootfs");
        bind_mount(
            &self.config.admin.init_path,
            &self.rootfs_dir.join("dev/init"),
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        )
        .context("failed to mount the init program")?;
        Ok(())
    }

    /// Step 9: site and user mounts, in request order.
    fn perform_custom_mounts(&self) -> Result<()> {
        info!("performing custom mounts");
        for mount in &self.command.mounts {
            mount.perform(&self.rootfs_dir)?;
        }
        Ok(())
    }

    /// Step 10: feature-dependent mounts that happen without an explicit
    /// request. Currently: the PMIx v3 rendezvous directory.
    fn perform_extra_mounts(&self) -> Result<()> {
        info!("performing extra mounts");
        if !self.config.admin.enable_pmix_v3_support {
            return Ok(());
        }
        let Some(pmix_dir) = self.command.host_environment.get(PMIX_SERVER_TMPDIR_VAR) else {
            debug!("{} not set, skipping PMIx mount", PMIX_SERVER_TMPDIR_VAR);
            return Ok(());
        };
        MountDescriptor::Bind(BindMount {
            source: PathBuf::from(pmix_dir),
            destination: PathBuf::from(pmix_dir),
            flags: MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            read_only: false,
        })
        .perform(&self.rootfs_dir)
        .context("failed to mount the PMIx server directory")?;
        Ok(())
    }

    /// Step 11: requested device nodes, bind-mounted one by one. Their
    /// cgroup whitelist entries are written by the bundle generator.
    fn perform_device_mounts(&self) -> Result<()> {
        info!("performing device mounts");
        for device in &self.command.device_mounts {
            device.perform(&self.rootfs_dir)?;
        }
        Ok(())
    }

    /// Step 12: late `nosuid` on the whole rootfs. Must come after every
    /// bind mount into the rootfs, or those mounts would be masked.
    fn remount_rootfs_with_nosuid(&self) -> Result<()> {
        info!("remounting rootfs with MS_NOSUID");
        remount(&self.rootfs_dir, Some("overlay"), MsFlags::MS_NOSUID)
    }

    /// Step 13: descriptor plumbing for PMI and the logging hooks.
    fn setup_file_descriptors(&mut self) -> Result<()> {
        info!("setting up preserved file descriptors");
        self.fd_handler
            .preserve_pmi_fd_if_any(&self.command.host_environment);
        self.fd_handler.pass_stdout_and_stderr_to_hooks();
        self.fd_handler
            .apply(&mut self.command.host_environment, &mut self.annotations)?;
        Ok(())
    }

    /// Step 14: `config.json`.
    fn generate_bundle_config(&self) -> Result<()> {
        BundleConfig::new(
            self.config.as_ref(),
            &self.command,
            &self.metadata,
            &self.annotations,
        )
        .generate(&self.bundle_dir)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Spawns the OCI runtime on the prepared bundle and waits for it.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::RuntimeFailure`] carrying the child's exit status when
    /// the runtime exits nonzero (the caller propagates it verbatim);
    /// [`ErrorKind::OsSpawn`] when the child cannot be spawned at all.
    pub fn execute_container(&self) -> Result<()> {
        let container_id = format!("container-{}", random_suffix(CONTAINER_ID_RANDOM_LEN));
        info!("executing {}", container_id);

        chdir(&self.bundle_dir)
            .map_err(|errno| {
                Error::new(ErrorKind::OsSpawn(format!(
                    "failed to chdir to {}: {errno}",
                    self.bundle_dir.display()
                )))
            })?;

        let argv = self.runtime_argv(&container_id)?;
        let envp = self.runtime_envp()?;

        let parent = getpid();
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Between fork and exec only async-signal-safe calls.
                child_exec(&argv, &envp, parent);
            }
            Ok(ForkResult::Parent { child }) => {
                install_signal_proxy(child)?;
                let status = wait_for_runtime(child)?;
                if status != 0 {
                    info!("OCI runtime exited with code {}", status);
                    return Err(Error::new(ErrorKind::RuntimeFailure(status)));
                }
                info!("successfully executed {}", container_id);
                Ok(())
            }
            Err(errno) => Err(Error::new(ErrorKind::OsSpawn(format!(
                "failed to fork the OCI runtime process: {errno}"
            )))),
        }
    }

    fn runtime_argv(&self, container_id: &str) -> Result<Vec<CString>> {
        let runc = self.config.admin.runc_path.display().to_string();
        [
            runc.as_str(),
            "run",
            "--preserve-fds",
            &self.fd_handler.extra_fd_count().to_string(),
            container_id,
        ]
        .iter()
        .map(|arg| cstring(arg))
        .collect()
    }

    fn runtime_envp(&self) -> Result<Vec<CString>> {
        self.runtime_environment
            .iter()
            .map(|(key, value)| cstring(&format!("{key}={value}")))
            .collect()
    }
}

// =============================================================================
// Child-Side Exec
// =============================================================================

/// Pre-exec setup and exec of the runtime. Never returns.
fn child_exec(argv: &[CString], envp: &[CString], parent: Pid) -> ! {
    // Ask for SIGHUP should the launcher die, so the container is torn
    // down instead of leaking.
    if set_pdeathsig(Signal::SIGHUP).is_err() {
        unsafe { libc::_exit(126) };
    }
    // The launcher may have died between fork and prctl; in that case no
    // death signal will ever arrive, so bail out instead of exec-ing an
    // orphan.
    if getppid() != parent {
        unsafe { libc::_exit(126) };
    }
    // The child must not inherit an unusual SIGPIPE disposition.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }

    let _ = execve(&argv[0], argv, envp);
    unsafe { libc::_exit(127) };
}

// =============================================================================
// Parent-Side Signal Proxy and Wait
// =============================================================================

extern "C" fn forward_signal(signo: libc::c_int) {
    let child = CHILD_PID.load(Ordering::Relaxed);
    if child > 0 {
        unsafe {
            libc::kill(child, signo);
        }
    }
}

/// Forwards job-control signals received by the launcher to the child.
fn install_signal_proxy(child: Pid) -> Result<()> {
    CHILD_PID.store(child.as_raw(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for proxied in PROXIED_SIGNALS {
        unsafe { sigaction(proxied, &action) }.map_err(|errno| {
            Error::new(ErrorKind::OsSpawn(format!(
                "failed to install the {proxied} proxy handler: {errno}"
            )))
        })?;
    }
    Ok(())
}

/// Reaps the runtime child, translating a signal death to `128 + signo`.
fn wait_for_runtime(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signo, _)) => return Ok(128 + signo as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(Error::new(ErrorKind::OsSpawn(format!(
                    "failed to wait for the OCI runtime process: {errno}"
                ))));
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn errno_error(errno: Errno) -> Error {
    Error::from(std::io::Error::from_raw_os_error(errno as i32))
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| {
        Error::new(ErrorKind::OsSpawn(format!(
            "argument contains an interior NUL byte: {value:?}"
        )))
    })
}

fn create_directory_as_user(path: &Path, identity: &UserIdentity) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    chown(path, Some(identity.uid), Some(identity.gid))
        .map_err(|errno| errno_error(errno))
        .with_context(|| format!("failed to chown {}", path.display()))
}

fn copy_file_as_user(source: &Path, destination: &Path, identity: &UserIdentity) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    chown(destination, Some(identity.uid), Some(identity.gid))
        .map_err(|errno| errno_error(errno))
        .with_context(|| format!("failed to chown {}", destination.display()))
}

/// Random alphanumeric suffix for container ids.
fn random_suffix(len: usize) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..len.min(id.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_has_requested_length() {
        assert_eq!(random_suffix(16).len(), 16);
        assert!(random_suffix(16).chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn signal_death_maps_above_128() {
        // Mirrors the shell convention the workload manager expects.
        assert_eq!(128 + Signal::SIGKILL as i32, 137);
        assert_eq!(128 + Signal::SIGTERM as i32, 143);
    }
}
