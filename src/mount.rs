//! # Mount Primitives and Mount Descriptors
//!
//! Thin, validated contracts over the kernel `mount(2)` call, plus the
//! [`MountDescriptor`] tagged union the orchestrator drives. Every primitive
//! is synchronous, logs a debug line on entry and on success, and surfaces a
//! kernel failure as [`ErrorKind::OsMount`] with the errno preserved.
//!
//! The primitives assume the caller already unshared the mount namespace;
//! they never adjust propagation on their own except through
//! [`set_propagation`].

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::sys::stat::{major, minor, stat, SFlag};
use tracing::debug;

use crate::device::DeviceAccess;
use crate::error::{Context, Error, ErrorKind, Result};

// =============================================================================
// Primitives
// =============================================================================

/// Makes `source` visible at `destination` via a recursive bind mount.
///
/// Both paths must name the same kind of object (file onto file, directory
/// onto directory); a missing destination of the right kind is created. A
/// destination that is already a mountpoint is not an error: the new mount
/// simply stacks on top. Passing `MS_RDONLY` in `flags` triggers the
/// read-only remount pass the kernel requires for bind mounts.
pub fn bind_mount(source: &Path, destination: &Path, flags: MsFlags) -> Result<()> {
    debug!("bind mounting {} at {}", source.display(), destination.display());

    let metadata = fs::metadata(source).map_err(|err| {
        Error::new(ErrorKind::PathKind {
            path: source.to_path_buf(),
            detail: format!("bind mount source is not accessible: {err}"),
        })
    })?;
    if metadata.is_dir() {
        ensure_directory(destination)?;
    } else {
        ensure_file(destination)?;
    }

    let bind_flags = (flags - MsFlags::MS_RDONLY) | MsFlags::MS_BIND | MsFlags::MS_REC;
    mount(
        Some(source),
        destination,
        None::<&str>,
        bind_flags,
        None::<&str>,
    )
    .map_err(|errno| mount_error(destination, errno))?;

    // MS_RDONLY is ignored by the initial bind; it takes effect on a
    // follow-up remount of the new mountpoint.
    if flags.contains(MsFlags::MS_RDONLY) {
        mount(
            None::<&str>,
            destination,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|errno| mount_error(destination, errno))
        .context("failed to remount bind mount read-only")?;
    }

    debug!("bind mounted {} at {}", source.display(), destination.display());
    Ok(())
}

/// Loop-mounts a squashfs image file, read-only, at `mountpoint`.
///
/// A free loop device is taken from `/dev/loop-control`; the device is
/// flagged `AUTOCLEAR`, so it detaches itself when the mount namespace
/// holding the mount is released.
pub fn loop_mount_squashfs(image_file: &Path, mountpoint: &Path) -> Result<()> {
    debug!(
        "loop mounting {} at {}",
        image_file.display(),
        mountpoint.display()
    );
    ensure_directory(mountpoint)?;

    let image = File::open(image_file).map_err(|err| {
        Error::new(ErrorKind::PathKind {
            path: image_file.to_path_buf(),
            detail: format!("squashfs image is not accessible: {err}"),
        })
    })?;

    let device_path = attach_loop_device(&image)
        .with_context(|| format!("failed to attach {} to a loop device", image_file.display()))?;

    mount(
        Some(&device_path),
        mountpoint,
        Some("squashfs"),
        MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|errno| mount_error(mountpoint, errno))
    .with_context(|| format!("failed to mount squashfs device {}", device_path.display()))?;

    debug!(
        "loop mounted {} at {} via {}",
        image_file.display(),
        mountpoint.display(),
        device_path.display()
    );
    Ok(())
}

/// Mounts an overlayfs with one lower and one upper layer at `merged`.
pub fn mount_overlay(lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    debug!(
        "mounting overlayfs at {} (lower {}, upper {})",
        merged.display(),
        lower.display(),
        upper.display()
    );

    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|errno| mount_error(merged, errno))?;

    debug!("mounted overlayfs at {}", merged.display());
    Ok(())
}

/// Mounts a RAM-backed filesystem (`tmpfs` or `ramfs`) at `mountpoint`.
///
/// `options` takes the usual tmpfs data string (`mode=`, `size=`); ramfs
/// ignores what it does not understand.
pub fn mount_ram_filesystem(
    mountpoint: &Path,
    fstype: &str,
    flags: MsFlags,
    options: Option<&str>,
) -> Result<()> {
    debug!("mounting {} at {}", fstype, mountpoint.display());
    mount(None::<&str>, mountpoint, Some(fstype), flags, options)
        .map_err(|errno| mount_error(mountpoint, errno))?;
    debug!("mounted {} at {}", fstype, mountpoint.display());
    Ok(())
}

/// Changes the propagation type of an existing mount (e.g. `SLAVE|REC`).
pub fn set_propagation(target: &Path, flags: MsFlags) -> Result<()> {
    debug!("setting propagation {:?} on {}", flags, target.display());
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
        .map_err(|errno| mount_error(target, errno))?;
    debug!("set propagation {:?} on {}", flags, target.display());
    Ok(())
}

/// Remounts `target` in place, adding `flags` (used to apply `MS_NOSUID`
/// after the fact, once all bind mounts below the target are in place).
pub fn remount(target: &Path, fstype: Option<&str>, flags: MsFlags) -> Result<()> {
    debug!("remounting {} with {:?}", target.display(), flags);
    mount(
        Some(target),
        target,
        fstype,
        MsFlags::MS_REMOUNT | flags,
        None::<&str>,
    )
    .map_err(|errno| mount_error(target, errno))?;
    debug!("remounted {} with {:?}", target.display(), flags);
    Ok(())
}

fn mount_error(target: &Path, errno: nix::Error) -> Error {
    Error::new(ErrorKind::OsMount {
        target: target.to_path_buf(),
        errno,
    })
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::new(ErrorKind::PathKind {
                path: path.to_path_buf(),
                detail: "expected a directory".to_string(),
            }));
        }
        return Ok(());
    }
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

fn ensure_file(path: &Path) -> Result<()> {
    if path.exists() {
        if path.is_dir() {
            return Err(Error::new(ErrorKind::PathKind {
                path: path.to_path_buf(),
                detail: "expected a file, found a directory".to_string(),
            }));
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    File::create(path)
        .map(|_| ())
        .with_context(|| format!("failed to create file {}", path.display()))
}

// =============================================================================
// Loop Devices
// =============================================================================

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// `struct loop_info64` from `<linux/loop.h>` (not exposed by libc).
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

/// Attaches `image` to a free loop device and returns the device path.
fn attach_loop_device(image: &File) -> Result<PathBuf> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")
        .context("failed to open /dev/loop-control")?;

    let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
    if index < 0 {
        return Err(Error::from(std::io::Error::last_os_error())
            .context("LOOP_CTL_GET_FREE failed"));
    }

    let device_path = PathBuf::from(format!("/dev/loop{index}"));
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .with_context(|| format!("failed to open {}", device_path.display()))?;

    if unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, image.as_raw_fd()) } < 0 {
        return Err(Error::from(std::io::Error::last_os_error())
            .context(format!("LOOP_SET_FD failed on {}", device_path.display())));
    }

    let mut info: LoopInfo64 = unsafe { std::mem::zeroed() };
    info.lo_flags = LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR;
    if unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            &info as *const LoopInfo64,
        )
    } < 0
    {
        let errno = std::io::Error::last_os_error();
        unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        return Err(Error::from(errno)
            .context(format!("LOOP_SET_STATUS64 failed on {}", device_path.display())));
    }

    Ok(device_path)
}

// =============================================================================
// Mount Descriptors
// =============================================================================

/// A single mount the orchestrator will perform inside the bundle.
///
/// Tagged union rather than trait objects: each variant maps onto exactly
/// one primitive above, and the generator needs to pattern-match devices to
/// emit their cgroup whitelist entries.
#[derive(Debug, Clone)]
pub enum MountDescriptor {
    Bind(BindMount),
    Device(DeviceMount),
    Overlay(OverlayMount),
}

impl MountDescriptor {
    /// Performs the mount, resolving container destinations under `rootfs`.
    pub fn perform(&self, rootfs: &Path) -> Result<()> {
        match self {
            Self::Bind(bind) => bind.perform(rootfs),
            Self::Device(device) => device.perform(rootfs),
            Self::Overlay(overlay) => overlay.perform(),
        }
    }
}

/// A user- or admin-requested bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Absolute host path.
    pub source: PathBuf,
    /// Absolute container path, resolved under the future rootfs.
    pub destination: PathBuf,
    /// Extra mount flags (propagation etc.); `MS_BIND|MS_REC` is implied.
    pub flags: MsFlags,
    /// Whether the mount is remounted read-only after binding.
    pub read_only: bool,
}

impl BindMount {
    pub fn perform(&self, rootfs: &Path) -> Result<()> {
        let target = container_target(rootfs, &self.destination);
        let mut flags = self.flags;
        if self.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        bind_mount(&self.source, &target, flags).with_context(|| {
            format!(
                "failed to perform bind mount of {} at {}",
                self.source.display(),
                self.destination.display()
            )
        })
    }
}

/// The device node classes a [`DeviceMount`] may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Character,
    Block,
}

impl DeviceType {
    /// The single-letter spelling used by the OCI runtime spec.
    pub fn as_oci_str(&self) -> &'static str {
        match self {
            Self::Character => "c",
            Self::Block => "b",
        }
    }
}

/// Device numbers read from a fresh `stat` of the host node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    pub device_type: DeviceType,
    pub major: i64,
    pub minor: i64,
}

/// A bind mount of a host device node plus its cgroup whitelist data.
///
/// The device numbers are never cached: [`DeviceMount::numbers`] stats the
/// host node each time so the generated bundle always reflects the current
/// host state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMount {
    /// Absolute host device path.
    pub source: PathBuf,
    /// Absolute container path.
    pub destination: PathBuf,
    /// Extra mount flags; `MS_BIND|MS_REC` is implied.
    pub flags: MsFlags,
    /// Access granted in the devices cgroup.
    pub access: DeviceAccess,
}

impl DeviceMount {
    /// Resolves type, major and minor from a fresh `stat` of the source.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::PathKind`] when the source cannot be stat-ed or is not a
    /// character or block device node.
    pub fn numbers(&self) -> Result<DeviceNumbers> {
        let st = stat(&self.source).map_err(|errno| {
            Error::new(ErrorKind::PathKind {
                path: self.source.clone(),
                detail: format!("cannot stat device file: {errno}"),
            })
        })?;

        let file_type = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        let device_type = if file_type == SFlag::S_IFCHR {
            DeviceType::Character
        } else if file_type == SFlag::S_IFBLK {
            DeviceType::Block
        } else {
            return Err(Error::new(ErrorKind::PathKind {
                path: self.source.clone(),
                detail: "must be a character or block device file".to_string(),
            }));
        };

        Ok(DeviceNumbers {
            device_type,
            major: major(st.st_rdev) as i64,
            minor: minor(st.st_rdev) as i64,
        })
    }

    pub fn perform(&self, rootfs: &Path) -> Result<()> {
        // Validates the node kind before anything touches the rootfs.
        self.numbers()?;
        let target = container_target(rootfs, &self.destination);
        bind_mount(&self.source, &target, self.flags).with_context(|| {
            format!(
                "failed to perform device mount of {} at {}",
                self.source.display(),
                self.destination.display()
            )
        })
    }
}

/// The overlayfs stacking that forms the container rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayMount {
    pub fn perform(&self) -> Result<()> {
        mount_overlay(&self.lower, &self.upper, &self.work, &self.merged)
            .with_context(|| format!("failed to assemble rootfs at {}", self.merged.display()))
    }
}

/// Resolves an absolute container path below the rootfs directory.
fn container_target(rootfs: &Path, destination: &Path) -> PathBuf {
    match destination.strip_prefix("/") {
        Ok(relative) => rootfs.join(relative),
        Err(_) => rootfs.join(destination),
    }
}
