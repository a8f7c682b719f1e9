//! Tool settings.
//!
//! Defaults can be changed in `config.toml` under the platform config
//! directory, then overridden per process with `DATABASER_*` environment
//! variables. Command-line flags take precedence over both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ssh::DEFAULT_SSH_PORT;

pub const ENV_SSH_KEY: &str = "DATABASER_SSH_KEY";
pub const ENV_SSH_PORT: &str = "DATABASER_SSH_PORT";
pub const ENV_CONNECT_TIMEOUT: &str = "DATABASER_CONNECT_TIMEOUT";

/// Private key used when none is configured, relative to the home directory.
pub const DEFAULT_SSH_KEY: &str = ".ssh/id_rsa";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value \"{value}\" for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Private key file; relative paths are resolved against the home directory.
    pub ssh_key: PathBuf,
    pub ssh_port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_key: PathBuf::from(DEFAULT_SSH_KEY),
            ssh_port: DEFAULT_SSH_PORT,
            connect_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Settings file location, if the platform has a config directory.
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "databaser", "databaser")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Settings file (when present) with environment overrides applied.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = match Self::config_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        settings.with_env(|key| dotenvy::var(key).ok())
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DATABASER_*` overrides found through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(key) = lookup(ENV_SSH_KEY).filter(|v| !v.is_empty()) {
            self.ssh_key = PathBuf::from(key);
        }
        if let Some(port) = lookup(ENV_SSH_PORT) {
            self.ssh_port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_SSH_PORT,
                value: port.clone(),
            })?;
        }
        if let Some(timeout) = lookup(ENV_CONNECT_TIMEOUT) {
            self.connect_timeout_secs =
                timeout.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_CONNECT_TIMEOUT,
                    value: timeout.clone(),
                })?;
        }
        Ok(self)
    }

    /// Absolute private key path.
    pub fn key_path(&self) -> PathBuf {
        resolve_key_path(&self.ssh_key)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Resolve a key path given relative to the home directory.
pub fn resolve_key_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match dirs::home_dir() {
        Some(home) => home.join(path),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load_from(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.ssh_port, 22);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "ssh_port = 2222\n").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.ssh_port, 2222);
        assert_eq!(settings.ssh_key, PathBuf::from(DEFAULT_SSH_KEY));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "ssh_port = \"many\"\n").unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let settings = Settings::default()
            .with_env(env(&[
                (ENV_SSH_KEY, "/keys/deploy"),
                (ENV_SSH_PORT, "2200"),
                (ENV_CONNECT_TIMEOUT, "3"),
            ]))
            .unwrap();
        assert_eq!(settings.key_path(), PathBuf::from("/keys/deploy"));
        assert_eq!(settings.ssh_port, 2200);
        assert_eq!(settings.connect_timeout_secs, 3);
    }

    #[test]
    fn invalid_environment_port_is_rejected() {
        let err = Settings::default()
            .with_env(env(&[(ENV_SSH_PORT, "ssh")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: ENV_SSH_PORT, .. }));
    }

    #[test]
    fn relative_keys_resolve_against_home() {
        let resolved = resolve_key_path(Path::new(DEFAULT_SSH_KEY));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join(".ssh/id_rsa"));
        }
    }
}
