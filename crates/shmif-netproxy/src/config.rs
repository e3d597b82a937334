// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy configuration. Supports both programmatic and file-based
//! configuration, matching `hdds_router::config::RouterConfig` — the
//! flag-only invocation remains the common case; `--config <file>` TOML
//! loading is an addition on top of it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Proxy-wide settings that are not tied to a single invocation's mode
/// flags (`-s`/`-S`/`-l`) — those remain CLI-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `-t`: serve one connection at a time instead of forking.
    #[serde(default)]
    pub single_client: bool,

    /// `-r N` / `--retry N`. Negative means retry forever.
    #[serde(default = "default_retry_count")]
    pub retry_count: i64,

    /// `-X`: disable exit-redirect to `ARCAN_CONNPATH`.
    #[serde(default)]
    pub disable_exit_redirect: bool,

    /// Keystore directory. Defaults to `ARCAN_STATEPATH` when unset.
    #[serde(default)]
    pub statepath: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retry_count() -> i64 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            single_client: false,
            retry_count: default_retry_count(),
            disable_exit_redirect: false,
            statepath: None,
        }
    }
}

impl ProxyConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.is_empty() {
            return Err(ConfigError::Invalid("log_level must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve the keystore directory: explicit config value, else
    /// `ARCAN_STATEPATH`, else `None` (keystore operations then fail with
    /// a usage error).
    pub fn resolve_statepath(&self) -> Option<String> {
        self.statepath
            .clone()
            .or_else(|| std::env::var("ARCAN_STATEPATH").ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(&path, "log_level = \"debug\"\nretry_count = -1\n").unwrap();
        let config = ProxyConfig::from_file(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry_count, -1);
        assert!(!config.single_client);
    }

    #[test]
    fn statepath_falls_back_to_env() {
        let config = ProxyConfig::default();
        std::env::set_var("ARCAN_STATEPATH", "/tmp/arcan-state-test");
        assert_eq!(config.resolve_statepath().as_deref(), Some("/tmp/arcan-state-test"));
        std::env::remove_var("ARCAN_STATEPATH");
    }
}
