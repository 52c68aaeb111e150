//! Directory layout and file helpers
//!
//! Follows the XDG Base Directory specification for the per-user case; the
//! chain rule files fall back to `/var/lib/fwgate/firewall` when no home
//! directory can be resolved (system services).
//!
//! - Config: `~/.config/fwgate/config.json`
//! - State: `~/.local/state/fwgate/firewall/` (chain rule files, audit log)

use directories::ProjectDirs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Used when XDG directories are unavailable; packagers may pin it at build time
pub const SYSTEM_STATE_DIR: &str = match option_env!("FWGATE_SYSTEM_STATE_DIR") {
    Some(dir) => dir,
    None => "/var/lib/fwgate",
};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwgate", "fwgate")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Directory holding the per-chain rule files
pub fn default_firewall_state_dir() -> PathBuf {
    get_state_dir()
        .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
        .join("firewall")
}

/// `$FWGATE_CONFIG`, else the XDG config path
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("FWGATE_CONFIG") {
        return PathBuf::from(path);
    }
    get_config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc/fwgate"))
        .join("config.json")
}

/// Creates `dir` and its parents with mode 0700.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Replaces `path` with `contents` atomically.
///
/// 1. Writes a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Renames it over the target.
///
/// Readers see either the old or the new file, never a partial one.
pub async fn write_atomic(path: &Path, contents: String) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, contents.as_bytes()))
        .await
        .map_err(std::io::Error::other)?
}

fn write_atomic_blocking(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}
