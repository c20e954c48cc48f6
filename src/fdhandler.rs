//! # Preserved File Descriptors
//!
//! The OCI runtime is told with `--preserve-fds N` to leave fds `3..=N+2`
//! open across its own exec, which is how descriptors reach the hooks: the
//! PMI socket of the MPI launcher, and the launcher's stdout/stderr for the
//! logging hooks.
//!
//! Nothing here relies on language-default close-on-exec behaviour. On
//! [`FdHandler::apply`] every retained descriptor is duplicated to the
//! lowest free slot at or above 3 and gets `FD_CLOEXEC` cleared; every
//! other descriptor at or above 3 gets `FD_CLOEXEC` set, so exactly the
//! retained set survives the exec boundary.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::fd::RawFd;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::{debug, warn};

use crate::constants::{PMI_FD_VAR, STDERR_FD_ANNOTATION, STDOUT_FD_ANNOTATION};
use crate::error::{Error, ErrorKind, Result};

/// First descriptor slot the OCI runtime preserves (right above stderr).
const FIRST_PRESERVED_SLOT: RawFd = 3;

/// Why a descriptor is kept across the exec boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdPurpose {
    /// The PMI socket advertised by the host MPI launcher via `PMI_FD`.
    Pmi,
    /// The launcher's stdout, handed to the logging hooks.
    HookStdout,
    /// The launcher's stderr, handed to the logging hooks.
    HookStderr,
}

#[derive(Debug)]
struct PreservedFd {
    source: RawFd,
    purpose: FdPurpose,
    slot: Option<RawFd>,
}

/// Ordered set of descriptors that must survive the exec into the runtime.
#[derive(Debug, Default)]
pub struct FdHandler {
    preserved: Vec<PreservedFd>,
}

impl FdHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the PMI descriptor when the host environment carries one.
    ///
    /// No-op when `PMI_FD` is absent; an unparsable value is ignored with a
    /// warning since the container can still run without PMI.
    pub fn preserve_pmi_fd_if_any(&mut self, environment: &HashMap<String, String>) {
        let Some(value) = environment.get(PMI_FD_VAR) else {
            return;
        };
        match value.parse::<RawFd>() {
            Ok(fd) if fd >= 0 => {
                debug!("preserving PMI fd {}", fd);
                self.preserved.push(PreservedFd {
                    source: fd,
                    purpose: FdPurpose::Pmi,
                    slot: None,
                });
            }
            _ => warn!("ignoring unparsable {} value '{}'", PMI_FD_VAR, value),
        }
    }

    /// Registers stdout and stderr for the logging-hook annotations.
    pub fn pass_stdout_and_stderr_to_hooks(&mut self) {
        debug!("passing stdout and stderr to hooks");
        self.preserved.push(PreservedFd {
            source: libc::STDOUT_FILENO,
            purpose: FdPurpose::HookStdout,
            slot: None,
        });
        self.preserved.push(PreservedFd {
            source: libc::STDERR_FILENO,
            purpose: FdPurpose::HookStderr,
            slot: None,
        });
    }

    /// Commits the descriptor plumbing.
    ///
    /// Duplicates every registered descriptor to the lowest free slot at or
    /// above 3, rewrites `PMI_FD` in the launch environment to its new slot,
    /// records the stdio slots as bundle annotations, then fixes
    /// `FD_CLOEXEC` on every descriptor of the process.
    pub fn apply(
        &mut self,
        environment: &mut HashMap<String, String>,
        annotations: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        for preserved in &mut self.preserved {
            let slot = fcntl(
                preserved.source,
                FcntlArg::F_DUPFD(FIRST_PRESERVED_SLOT),
            )
            .map_err(|errno| {
                Error::new(ErrorKind::OsSpawn(format!(
                    "failed to duplicate fd {}: {errno}",
                    preserved.source
                )))
            })?;
            preserved.slot = Some(slot);
            debug!("duplicated fd {} to slot {}", preserved.source, slot);

            match preserved.purpose {
                FdPurpose::Pmi => {
                    environment.insert(PMI_FD_VAR.to_string(), slot.to_string());
                }
                FdPurpose::HookStdout => {
                    annotations.insert(STDOUT_FD_ANNOTATION.to_string(), slot.to_string());
                }
                FdPurpose::HookStderr => {
                    annotations.insert(STDERR_FD_ANNOTATION.to_string(), slot.to_string());
                }
            }
        }

        self.commit_cloexec_flags()
    }

    /// The value handed to the runtime as `--preserve-fds`.
    ///
    /// Slots are allocated lowest-free-first, so the count is the highest
    /// retained slot minus the three stdio descriptors.
    pub fn extra_fd_count(&self) -> i32 {
        self.preserved
            .iter()
            .filter_map(|preserved| preserved.slot)
            .max()
            .map(|highest| highest - 2)
            .unwrap_or(0)
    }

    /// Clears `FD_CLOEXEC` on retained slots, sets it everywhere else ≥ 3.
    fn commit_cloexec_flags(&self) -> Result<()> {
        let retained: Vec<RawFd> = self
            .preserved
            .iter()
            .filter_map(|preserved| preserved.slot)
            .collect();

        let entries = fs::read_dir("/proc/self/fd").map_err(|err| {
            Error::new(ErrorKind::OsSpawn(format!(
                "failed to enumerate open file descriptors: {err}"
            )))
        })?;

        for entry in entries.flatten() {
            let Some(fd) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RawFd>().ok())
            else {
                continue;
            };
            if fd < FIRST_PRESERVED_SLOT {
                continue;
            }

            let keep_open = retained.contains(&fd);
            let flags = if keep_open {
                FdFlag::empty()
            } else {
                FdFlag::FD_CLOEXEC
            };
            // The fd backing the directory iteration shows up here too;
            // marking it close-on-exec is harmless.
            if let Err(errno) = fcntl(fd, FcntlArg::F_SETFD(flags)) {
                // The iteration fd may already be gone by the time we touch it.
                debug!("failed to set FD_CLOEXEC state on fd {}: {}", fd, errno);
            }
        }
        Ok(())
    }
}
