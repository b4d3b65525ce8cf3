//! Configuration module for driftsync.
//!
//! Provides the typed configuration struct that maps to the daemon's YAML
//! configuration file, with loading, validation, defaults, and a builder for
//! programmatic use (mainly tests).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreError;

/// Top-level configuration for the driftsync daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database, credentials file and auth.json.
    pub config_dir: PathBuf,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub delta: DeltaConfig,
    pub logging: LoggingConfig,
}

/// Database / credentials file names inside the config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Configuration database file name.
    pub db_file: String,
    /// Backend credentials file name.
    pub credentials_file: String,
}

/// Task engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Milliseconds between progress samples.
    pub progress_interval_ms: u64,
    /// Bounded progress channel capacity per task.
    pub progress_channel_capacity: usize,
}

/// Delta engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Seconds between change-notification polls.
    pub poll_interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            config_dir: default_config_dir(),
            database: DatabaseConfig {
                db_file: "driftsync.db".into(),
                credentials_file: "rclone.conf".into(),
            },
            engine: EngineConfig {
                progress_interval_ms: 500,
                progress_channel_capacity: 64,
            },
            delta: DeltaConfig {
                poll_interval_secs: 60,
            },
            logging: LoggingConfig {
                level: "info".into(),
            },
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("driftsync")
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.yaml")
    }

    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Checks the configuration invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.engine.progress_interval_ms == 0 {
            return Err(CoreError::Validation(
                "engine.progress_interval_ms must be positive".into(),
            ));
        }
        if self.engine.progress_channel_capacity == 0 {
            return Err(CoreError::Validation(
                "engine.progress_channel_capacity must be positive".into(),
            ));
        }
        if self.delta.poll_interval_secs == 0 {
            return Err(CoreError::Validation(
                "delta.poll_interval_secs must be positive".into(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(CoreError::Validation(format!(
                    "unknown log level: {other}"
                )))
            }
        }
        Ok(())
    }

    /// Full path of the configuration database.
    pub fn db_path(&self) -> PathBuf {
        self.config_dir.join(&self.database.db_file)
    }

    /// Full path of the backend credentials file.
    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join(&self.database.credentials_file)
    }

    /// Full path of the plaintext auth metadata file.
    pub fn auth_path(&self) -> PathBuf {
        self.config_dir.join("auth.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.engine.progress_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_derive_from_config_dir() {
        let mut config = Config::default();
        config.config_dir = PathBuf::from("/tmp/ds");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/ds/driftsync.db"));
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/tmp/ds/rclone.conf")
        );
        assert_eq!(config.auth_path(), PathBuf::from("/tmp/ds/auth.json"));
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.logging.level = "debug".into();
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.logging.level, "debug");
        assert_eq!(loaded.engine.progress_interval_ms, 500);
    }
}
