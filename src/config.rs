//! Configuration for flockd
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FlockdError, Result};

/// Main configuration for a flockd database
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the database. Also the directory of the root table.
    /// Internal structure:
    ///   {root}/
    ///     ├── {key}.kv           (root table records)
    ///     └── {name}.tbl/        (named tables)
    ///         └── {key}.kv
    pub root: PathBuf,

    /// Maximum time to poll for a shared or exclusive lock before failing
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./flockd.db"),
            lock_timeout: Duration::from_millis(10),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the config describes a usable database.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(FlockdError::InvalidTimeout(self.lock_timeout));
        }
        if self.root.as_os_str().is_empty() {
            return Err(FlockdError::Config("root path is empty".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the database root directory
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root = path.into();
        self
    }

    /// Set the lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the lock timeout (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout = Duration::from_millis(ms);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
