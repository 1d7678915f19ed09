//! Runtime configuration.
//!
//! # Responsibility
//! - Describe database, retry and logging settings as serde data.
//! - Reject unusable settings before any connection is opened.
//!
//! # Invariants
//! - Every field has a default except the database path.

use crate::error::{CrudError, CrudResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Connection settings applied to every persistence context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,
}

/// File logging settings consumed by `init_logging`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: PathBuf,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_foreign_keys() -> bool {
    true
}

fn default_log_level() -> String {
    crate::logging::default_log_level().to_string()
}

impl DatabaseConfig {
    /// Settings for `path` with default timeouts and pragmas.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            foreign_keys: default_foreign_keys(),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> CrudResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(CrudError::Config("database.path cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl CoreConfig {
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            retry: RetryPolicy::default(),
            logging: None,
        }
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> CrudResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| CrudError::Config(format!("invalid config json: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> CrudResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            CrudError::Config(format!("failed to read config `{}`: {err}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> CrudResult<()> {
        self.database.validate()?;
        self.retry.validate()?;
        if let Some(logging) = &self.logging {
            if !logging.log_dir.is_absolute() {
                return Err(CrudError::Config(format!(
                    "logging.log_dir must be an absolute path, got `{}`",
                    logging.log_dir.display()
                )));
            }
        }
        Ok(())
    }
}
