//! # CLI Mount and Device Request Parsing
//!
//! Turns `--mount=` and `--device=` option values of the form `A[:B[:C]]`
//! into validated [`BindMount`]/[`DeviceMount`] descriptors. Parsing is
//! pure: the filesystem is never touched, so a request for a device that
//! does not exist parses fine and fails later, at mount time.
//!
//! ## Token Disambiguation
//!
//! | tokens | source | destination | access/options |
//! |--------|--------|-------------|----------------|
//! | 1      | A      | A           | default        |
//! | 2      | A      | B if B is absolute, else A | B if B is relative |
//! | 3      | A      | B           | C              |
//!
//! The two-token rule means a relative second token is always taken as an
//! access/options string, never as a container path; the error messages
//! below spell that out when the token then fails validation.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::debug;

use crate::device::DeviceAccess;
use crate::error::{Error, ErrorKind, Result};
use crate::mount::{BindMount, DeviceMount};

/// Mount flags applied to every CLI-requested mount.
const REQUEST_MOUNT_FLAGS: MsFlags = MsFlags::MS_REC.union(MsFlags::MS_PRIVATE);

// =============================================================================
// Device Requests
// =============================================================================

/// Parses a `--device=host[:container[:access]]` request.
pub fn parse_device_request(request: &str) -> Result<DeviceMount> {
    debug!("parsing device request '{}'", request);

    let tokens = split_request(request, "device")?;

    let source = tokens[0];
    let mut destination = source;
    let mut access_token: Option<&str> = None;

    match tokens.len() {
        1 => {}
        2 => {
            // A relative second token cannot be a container path, so it is
            // taken as the access string.
            if Path::new(tokens[1]).is_absolute() {
                destination = tokens[1];
            } else {
                access_token = Some(tokens[1]);
            }
        }
        _ => {
            destination = tokens[1];
            access_token = Some(tokens[2]);
        }
    }

    validate_request_path(source, "host device", request, "device")?;
    validate_request_path(destination, "container device", request, "device")?;

    let access = match access_token {
        None => DeviceAccess::full(),
        Some(token) => DeviceAccess::parse(token).map_err(|err| {
            let hint = if tokens.len() == 2 {
                format!(
                    "invalid device request '{request}': '{token}' was taken as an access string \
                     because it is not an absolute container path, but it is not a valid access \
                     either. Device access must be a combination of 'rwm' characters, with no \
                     repetitions"
                )
            } else {
                format!(
                    "invalid device request '{request}': device access must be a combination of \
                     'rwm' characters, with no repetitions"
                )
            };
            err.context(hint)
        })?,
    };

    Ok(DeviceMount {
        source: PathBuf::from(source),
        destination: PathBuf::from(destination),
        flags: REQUEST_MOUNT_FLAGS,
        access,
    })
}

// =============================================================================
// Mount Requests
// =============================================================================

/// Parses a `--mount=src[:dst[:opts]]` request.
///
/// Options are a comma-separated list over `bind` (the implied default),
/// `ro` and `rw`; anything else is rejected.
pub fn parse_mount_request(request: &str) -> Result<BindMount> {
    debug!("parsing mount request '{}'", request);

    let tokens = split_request(request, "mount")?;

    let source = tokens[0];
    let mut destination = source;
    let mut options_token: Option<&str> = None;

    match tokens.len() {
        1 => {}
        2 => {
            if Path::new(tokens[1]).is_absolute() {
                destination = tokens[1];
            } else {
                options_token = Some(tokens[1]);
            }
        }
        _ => {
            destination = tokens[1];
            options_token = Some(tokens[2]);
        }
    }

    validate_request_path(source, "host", request, "mount")?;
    validate_request_path(destination, "container", request, "mount")?;

    let read_only = match options_token {
        None => false,
        Some(token) => parse_mount_options(token, request, tokens.len() == 2)?,
    };

    Ok(BindMount {
        source: PathBuf::from(source),
        destination: PathBuf::from(destination),
        flags: REQUEST_MOUNT_FLAGS,
        read_only,
    })
}

/// Returns whether the options make the mount read-only.
fn parse_mount_options(token: &str, request: &str, disambiguated: bool) -> Result<bool> {
    let mut read_only = false;
    for option in token.split(',') {
        match option {
            "bind" | "rw" => read_only = false,
            "ro" => read_only = true,
            other => {
                let message = if disambiguated {
                    format!(
                        "invalid mount request '{request}': '{token}' was taken as an options \
                         string because it is not an absolute container path, but '{other}' is \
                         not a valid mount option. Supported options are 'bind', 'ro' and 'rw'"
                    )
                } else {
                    format!(
                        "invalid mount request '{request}': unknown mount option '{other}'. \
                         Supported options are 'bind', 'ro' and 'rw'"
                    )
                };
                return Err(Error::new(ErrorKind::InvalidRequest(message)));
            }
        }
    }
    Ok(read_only)
}

// =============================================================================
// Shared Validation
// =============================================================================

/// Splits on `:` and enforces the 1..=3 token arity.
fn split_request<'a>(request: &'a str, what: &str) -> Result<Vec<&'a str>> {
    if request.is_empty() {
        return Err(Error::new(ErrorKind::InvalidRequest(format!(
            "invalid {what} request: no values provided"
        ))));
    }

    let tokens: Vec<&str> = request.split(':').collect();
    if tokens.len() > 3 {
        return Err(Error::new(ErrorKind::InvalidRequest(format!(
            "invalid {what} request '{request}': too many tokens provided. The format of the \
             option value must be at most '<host path>:<container path>:<{what} options>'"
        ))));
    }
    Ok(tokens)
}

fn validate_request_path(path: &str, role: &str, request: &str, what: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::new(ErrorKind::InvalidRequest(format!(
            "invalid {what} request '{request}': detected empty {role} path"
        ))));
    }
    if !Path::new(path).is_absolute() {
        return Err(Error::new(ErrorKind::InvalidRequest(format!(
            "invalid {what} request '{request}': {role} path '{path}' must be absolute"
        ))));
    }
    Ok(())
}
