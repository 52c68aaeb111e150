//! Root privileges for firewall commands
//!
//! `iptables`, `firewall-cmd`, `systemctl` and `sysctl` all need root. A
//! non-root caller gets each command line prefixed with `sudo -n`: the line
//! runs under `bash -c` with no terminal attached, so sudo has to be
//! passwordless for the caller or fail at once instead of hanging on a prompt.
//!
//! `FWGATE_ELEVATION_METHOD` (`sudo` or `none`) overrides the choice. `none`
//! suits a service unit or wrapper that already grants `CAP_NET_ADMIN`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const METHOD_ENV: &str = "FWGATE_ELEVATION_METHOD";

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("Not running as root and sudo is not installed")]
    SudoMissing,

    #[error("Invalid FWGATE_ELEVATION_METHOD '{0}'. Valid options: sudo, none")]
    InvalidMethod(String),
}

/// How a command line obtains root
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Elevation {
    /// Run the line as given
    #[strum(serialize = "none")]
    Direct,
    #[strum(serialize = "sudo")]
    Sudo,
}

impl Elevation {
    /// Picks the method for this process from `FWGATE_ELEVATION_METHOD`, the
    /// effective uid and whether sudo is installed.
    ///
    /// # Errors
    ///
    /// Returns `Err` for an unknown method name, or when elevation is needed
    /// and sudo is missing.
    pub fn resolve() -> Result<Self, ElevationError> {
        let requested = match std::env::var(METHOD_ENV) {
            Ok(value) if !value.trim().is_empty() => {
                let method = value.trim();
                Some(
                    method
                        .parse::<Elevation>()
                        .map_err(|_| ElevationError::InvalidMethod(method.to_string()))?,
                )
            }
            _ => None,
        };
        Self::choose(requested, nix::unistd::geteuid().is_root(), || {
            find_in_path("sudo").is_some()
        })
    }

    fn choose(
        requested: Option<Self>,
        is_root: bool,
        has_sudo: impl FnOnce() -> bool,
    ) -> Result<Self, ElevationError> {
        match requested {
            Some(Elevation::Direct) => Ok(Elevation::Direct),
            _ if is_root => Ok(Elevation::Direct),
            _ if has_sudo() => Ok(Elevation::Sudo),
            _ => Err(ElevationError::SudoMissing),
        }
    }

    pub fn apply(self, command_line: &str) -> String {
        match self {
            Elevation::Direct => command_line.to_string(),
            Elevation::Sudo => format!("sudo -n {command_line}"),
        }
    }
}

/// Full path of the first executable named `name` on PATH
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}
