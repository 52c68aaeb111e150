use crate::core::iptables::IptablesOptions;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, read from `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the per-chain rule files
    #[serde(default = "utils::default_firewall_state_dir")]
    pub state_dir: PathBuf,
    /// Per-command timeout; a timed out command leaves the host in an unknown state
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// firewalld zone every change targets
    #[serde(default = "default_zone")]
    pub zone: String,
    /// TCP ports accepted ahead of user rules on iptables hosts
    #[serde(default = "default_management_ports")]
    pub management_ports: Vec<String>,
    #[serde(default)]
    pub default_drop: bool,
    /// JSON-lines audit trail; disabled when unset
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: utils::default_firewall_state_dir(),
            command_timeout_secs: default_command_timeout(),
            zone: default_zone(),
            management_ports: default_management_ports(),
            default_drop: false,
            audit_log: None,
        }
    }
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn iptables_options(&self) -> IptablesOptions {
        IptablesOptions {
            management_ports: self.management_ports.clone(),
            default_drop: self.default_drop,
        }
    }
}

fn default_command_timeout() -> u64 {
    20
}

fn default_zone() -> String {
    "public".to_string()
}

fn default_management_ports() -> Vec<String> {
    vec!["22".to_string()]
}

/// Saves the config to `path` with an atomic write (temp file, mode 0600, rename).
pub async fn save_config(path: &Path, config: &Config) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    utils::write_atomic(path, json).await
}

/// Loads the config from `path`, or returns defaults if it is missing or unreadable.
pub async fn load_config(path: &Path) -> Config {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<Config>(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring malformed config {}: {e}", path.display());
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).await;
        assert_eq!(config, Config::default());
        assert_eq!(config.command_timeout(), Duration::from_secs(20));
        assert_eq!(config.zone, "public");
    }

    #[tokio::test]
    async fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_config(&path).await, Config::default());
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"zone":"trusted","default_drop":true}"#).unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.zone, "trusted");
        assert!(config.default_drop);
        assert_eq!(config.management_ports, vec!["22"]);
        assert!(config.audit_log.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            state_dir: dir.path().join("state"),
            command_timeout_secs: 5,
            management_ports: vec!["22".into(), "2222".into()],
            audit_log: Some(dir.path().join("audit.log")),
            ..Config::default()
        };

        save_config(&path, &config).await.unwrap();
        assert_eq!(load_config(&path).await, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config {
            command_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.command_timeout(), Duration::from_secs(1));
    }
}
