//! Configuration loading and persistence.
//!
//! Reads `config.json` from the opsdeck config directory and applies
//! environment overrides. Credentials are not part of this file; they live in
//! the keyring via [`crate::credentials`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::deployment::dedup::{DEFAULT_CAPACITY, DEFAULT_RETAIN};
use crate::env::Environment;
use crate::terminal::transcript::DEFAULT_SCROLLBACK_BYTES;

/// Configuration for the opsdeck client core.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the opsdeck API server.
    pub server_url: String,
    /// First reconnect delay of the shared connection, in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Upper bound for the reconnect backoff, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Interval of the idle deployment status reconciliation pass.
    pub status_reconcile_secs: u64,
    /// Fallback poll interval for process listings.
    pub process_poll_secs: u64,
    /// Dedup window size that triggers a trim.
    pub dedup_capacity: usize,
    /// Number of keys kept after a trim.
    pub dedup_retain: usize,
    /// Per-session terminal transcript capacity in bytes.
    pub scrollback_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: Environment::current().default_server_url().to_string(),
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            status_reconcile_secs: 10,
            process_poll_secs: 30,
            dedup_capacity: DEFAULT_CAPACITY,
            dedup_retain: DEFAULT_RETAIN,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `OPSDECK_CONFIG_DIR` env var
    /// 2. Unit tests and `OPSDECK_ENV=test|system_test`: `tmp/opsdeck-test` in the repo
    /// 3. Platform config dir (`~/.config/opsdeck` on Linux)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("OPSDECK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if cfg!(test) || Environment::current().is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/opsdeck-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("opsdeck")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory with env overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config ({e:#})");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("OPSDECK_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(max_ms) = std::env::var("OPSDECK_RECONNECT_MAX_MS") {
            if let Ok(max_ms) = max_ms.parse::<u64>() {
                self.reconnect_max_ms = max_ms;
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Server URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Initial reconnect delay.
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    /// Maximum reconnect delay.
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1))
    }

    /// Period of the idle status reconciliation pass.
    pub fn status_reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.status_reconcile_secs.max(1))
    }

    /// Period of the process listing fallback poll.
    pub fn process_poll_interval(&self) -> Duration {
        Duration::from_secs(self.process_poll_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.status_reconcile_secs, 10);
        assert_eq!(config.process_poll_secs, 30);
        assert_eq!(config.dedup_capacity, 5000);
        assert_eq!(config.dedup_retain, 2000);
        assert_eq!(config.reconnect_initial(), Duration::from_secs(1));
        assert_eq!(config.reconnect_max(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"server_url": "https://ops.example.com/"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server_url, "https://ops.example.com/");
        assert_eq!(config.base_url(), "https://ops.example.com");
        assert_eq!(config.dedup_capacity, 5000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_reconnect_max_never_below_initial() {
        let config = Config {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 100,
            ..Config::default()
        };
        assert_eq!(config.reconnect_max(), Duration::from_secs(5));
    }
}
