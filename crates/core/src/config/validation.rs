//! Configuration validation rules.
//!
//! This module provides validation logic for `BuildConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::{BuildConfig, Driver};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl BuildConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `connection` or `database` is empty
    /// - `storage_dir` is empty while snapshots are on or the driver is SQLite
    /// - `remote_build_url` is not an http(s) URL
    /// - `remote_timeout_ms` is less than 100ms or exceeds 30 minutes
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "connection".into(), reason: "must not be empty".into() });
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "database".into(), reason: "must not be empty".into() });
        }

        if self.storage_dir.as_os_str().is_empty() && (self.snapshots.enabled() || self.driver == Driver::Sqlite) {
            return Err(ConfigError::Missing {
                field: "storage_dir".into(),
                hint: "Set SCENARIODB_STORAGE_DIR; snapshots and SQLite databases live there".into(),
            });
        }

        if let Some(raw) = &self.remote_build_url {
            let reason = match url::Url::parse(raw) {
                Ok(parsed) if !matches!(parsed.scheme(), "http" | "https") => {
                    Some(format!("\"{raw}\" is not an http(s) URL"))
                }
                Ok(parsed) if parsed.host_str().is_none_or(str::is_empty) => Some(format!("\"{raw}\" has no host")),
                Ok(_) => None,
                Err(e) => Some(format!("\"{raw}\" is not a valid URL: {e}")),
            };
            if let Some(reason) = reason {
                return Err(ConfigError::Invalid { field: "remote_build_url".into(), reason });
            }
        }

        if self.remote_timeout_ms < 100 {
            return Err(ConfigError::Invalid {
                field: "remote_timeout_ms".into(),
                reason: "must be at least 100ms".into(),
            });
        }
        if self.remote_timeout_ms > 1_800_000 {
            return Err(ConfigError::Invalid {
                field: "remote_timeout_ms".into(),
                reason: "must not exceed 30 minutes (1800000ms)".into(),
            });
        }

        if !self.run_migrations && !self.seeders.is_empty() {
            tracing::warn!(
                connection = %self.connection,
                seeder_count = self.seeders.len(),
                "Seeders are configured but migrations are off; seeders will not run"
            );
        }

        Ok(())
    }
}
