//! Command execution seam
//!
//! Every backend talks to the system through a [`CommandRunner`]: one shell
//! command line in, stdout out. Production code uses [`ShellRunner`]; tests
//! substitute a scripted runner so no host firewall is touched.

use crate::core::error::{Error, Result};
use crate::elevation::{self, Elevation};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs a shell command line with a timeout
pub trait CommandRunner: Send + Sync {
    /// Runs `command` and returns its stdout.
    ///
    /// # Errors
    ///
    /// Non-zero exit is [`Error::Command`] carrying stdout and stderr verbatim;
    /// exceeding `timeout` is [`Error::Timeout`].
    fn run(&self, command: &str, timeout: Duration) -> impl Future<Output = Result<String>> + Send;

    /// Whether `name` is an executable on PATH
    fn binary_exists(&self, name: &str) -> bool {
        elevation::find_in_path(name).is_some()
    }
}

/// Spawns `bash -c <line>`, elevated with sudo when needed
#[derive(Debug, Clone, Copy)]
pub struct ShellRunner {
    elevate: bool,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub const fn new() -> Self {
        Self { elevate: true }
    }

    /// Runs command lines exactly as given, never through sudo
    pub const fn unprivileged() -> Self {
        Self { elevate: false }
    }
}

impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<String> {
        let line = if self.elevate {
            Elevation::resolve()
                .map_err(|e| Error::Internal(format!("Privilege escalation unavailable: {e}")))?
                .apply(command)
        } else {
            command.to_string()
        };
        debug!("exec: {line}");

        let child = Command::new("bash")
            .arg("-c")
            .arg(&line)
            // Tool diagnostics are matched on their English text
            .env("LANGUAGE", "en_US:en")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Ok(output) = tokio::time::timeout(timeout, child.wait_with_output()).await else {
            warn!("Command timed out after {}s: {command}", timeout.as_secs());
            return Err(Error::Timeout {
                command: command.to_string(),
                secs: timeout.as_secs(),
            });
        };
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Command {
            command: command.to_string(),
            output: format!("{stdout}{stderr}"),
            exit_code: output.status.code(),
        })
    }
}
