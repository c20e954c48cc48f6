//! Device access modes for device mounts and cgroup whitelist entries.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// Canonical set of access modes over `{r, w, m}`.
///
/// Parsed from CLI device requests and rendered both into the devices-cgroup
/// whitelist of the generated bundle and into log lines. Two accesses are
/// equal iff their letter sets are equal; rendering always orders `r` before
/// `w` before `m`, so `parse("mrw")` displays as `"rwm"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAccess {
    read: bool,
    write: bool,
    mknod: bool,
}

impl DeviceAccess {
    /// Parses an access string such as `rwm`, `rw` or `m`.
    ///
    /// Letters must be drawn from `{r, w, m}` with no repetitions; the empty
    /// string is rejected.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(Error::new(ErrorKind::InvalidRequest(
                "device access must not be empty; enter a combination of 'rwm' characters"
                    .to_string(),
            )));
        }

        let mut access = Self {
            read: false,
            write: false,
            mknod: false,
        };
        for ch in input.chars() {
            let flag = match ch {
                'r' => &mut access.read,
                'w' => &mut access.write,
                'm' => &mut access.mknod,
                other => {
                    return Err(Error::new(ErrorKind::InvalidRequest(format!(
                        "'{input}' is not a valid device access: unexpected character '{other}'. \
                         Device access must be a combination of 'rwm' characters, with no repetitions"
                    ))));
                }
            };
            if *flag {
                return Err(Error::new(ErrorKind::InvalidRequest(format!(
                    "'{input}' is not a valid device access: repeated character '{ch}'. \
                     Device access must be a combination of 'rwm' characters, with no repetitions"
                ))));
            }
            *flag = true;
        }
        Ok(access)
    }

    /// Full access, the default for device requests without an access token.
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            mknod: true,
        }
    }

    pub fn read(&self) -> bool {
        self.read
    }

    pub fn write(&self) -> bool {
        self.write
    }

    pub fn mknod(&self) -> bool {
        self.mknod
    }
}

impl fmt::Display for DeviceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.mknod {
            f.write_str("m")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceAccess {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
