//! Configuration management

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/stowage";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Import Configuration Constants
// ============================================================================

/// Rows per insert transaction (further capped by the bind-parameter limit).
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Largest accepted file (100 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 4;

/// Wall-clock limit for one upload (30 minutes).
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 1800;

/// How long finished uploads stay queryable in memory (1 hour).
pub const DEFAULT_RESULT_RETENTION_SECS: u64 = 3600;

/// Keys per upload checked against the table before checks stop.
pub const DEFAULT_EXISTENCE_CHECK_LIMIT: usize = 100_000;

pub const DEFAULT_FIELD_COUNT_TOLERANCE: usize = 0;

pub const DEFAULT_DELIMITER: u8 = b',';

/// Rows between progress snapshots while reading.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 500;

/// Failed and skipped rows listed in a report; counters stay exact.
pub const DEFAULT_MAX_REPORTED_ROWS: usize = 1000;

pub const DEFAULT_CATALOG_PATH: &str = "config/tables.toml";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub import: ImportSettings,
    pub catalog_path: PathBuf,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Tunables of the import pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub max_upload_bytes: u64,
    pub max_concurrent_uploads: usize,
    pub upload_timeout: Duration,
    pub result_retention: Duration,
    /// `None` checks every key
    pub existence_check_limit: Option<usize>,
    pub field_count_tolerance: usize,
    pub delimiter: u8,
    pub progress_interval: u64,
    pub max_reported_rows: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            result_retention: Duration::from_secs(DEFAULT_RESULT_RETENTION_SECS),
            existence_check_limit: Some(DEFAULT_EXISTENCE_CHECK_LIMIT),
            field_count_tolerance: DEFAULT_FIELD_COUNT_TOLERANCE,
            delimiter: DEFAULT_DELIMITER,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_reported_rows: DEFAULT_MAX_REPORTED_ROWS,
        }
    }
}

impl ImportSettings {
    /// Defaults overridden by `STOWAGE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let existence_check_limit = match std::env::var("STOWAGE_EXISTENCE_CHECK_LIMIT") {
            Ok(v) if v.trim().eq_ignore_ascii_case("unlimited") => None,
            Ok(v) => Some(
                v.trim()
                    .parse()
                    .context("STOWAGE_EXISTENCE_CHECK_LIMIT must be a number or 'unlimited'")?,
            ),
            Err(_) => defaults.existence_check_limit,
        };

        let delimiter = match std::env::var("STOWAGE_DELIMITER") {
            Ok(v) => parse_delimiter(&v)?,
            Err(_) => defaults.delimiter,
        };

        Ok(Self {
            batch_size: env_or("STOWAGE_BATCH_SIZE", defaults.batch_size)?,
            max_upload_bytes: env_or("STOWAGE_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            max_concurrent_uploads: env_or(
                "STOWAGE_MAX_CONCURRENT_UPLOADS",
                defaults.max_concurrent_uploads,
            )?,
            upload_timeout: Duration::from_secs(env_or(
                "STOWAGE_UPLOAD_TIMEOUT_SECS",
                DEFAULT_UPLOAD_TIMEOUT_SECS,
            )?),
            result_retention: Duration::from_secs(env_or(
                "STOWAGE_RESULT_RETENTION_SECS",
                DEFAULT_RESULT_RETENTION_SECS,
            )?),
            existence_check_limit,
            field_count_tolerance: env_or(
                "STOWAGE_FIELD_COUNT_TOLERANCE",
                defaults.field_count_tolerance,
            )?,
            delimiter,
            progress_interval: env_or("STOWAGE_PROGRESS_INTERVAL", defaults.progress_interval)?,
            max_reported_rows: env_or("STOWAGE_MAX_REPORTED_ROWS", defaults.max_reported_rows)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }
        if self.max_upload_bytes == 0 {
            anyhow::bail!("Max upload size must be greater than 0");
        }
        if self.max_concurrent_uploads == 0 {
            anyhow::bail!("Max concurrent uploads must be greater than 0");
        }
        if self.upload_timeout.is_zero() {
            anyhow::bail!("Upload timeout must be greater than 0");
        }
        if self.progress_interval == 0 {
            anyhow::bail!("Progress interval must be greater than 0");
        }
        if matches!(self.delimiter, b'"' | b'\n' | b'\r') {
            anyhow::bail!("Delimiter cannot be a quote or line break");
        }
        Ok(())
    }
}

/// Accepts a single ASCII character or the words `tab`, `comma`,
/// `semicolon`, `pipe`.
pub fn parse_delimiter(value: &str) -> anyhow::Result<u8> {
    match value.to_lowercase().as_str() {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "comma" => Ok(b','),
        "semicolon" => Ok(b';'),
        "pipe" => Ok(b'|'),
        other if other.len() == 1 && other.is_ascii() => Ok(other.as_bytes()[0]),
        other => anyhow::bail!("Invalid delimiter '{}': expected one ASCII character", other),
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )?,
            },
            import: ImportSettings::from_env()?,
            catalog_path: std::env::var("STOWAGE_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CATALOG_PATH)),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        // Each running upload holds a connection while committing.
        if self.import.max_concurrent_uploads as u32 > self.database.max_connections {
            tracing::warn!(
                uploads = self.import.max_concurrent_uploads,
                connections = self.database.max_connections,
                "More concurrent uploads than pooled connections; uploads will queue on the pool"
            );
        }

        self.import.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            import: ImportSettings::default(),
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const IMPORT_VARS: [&str; 4] = [
        "STOWAGE_BATCH_SIZE",
        "STOWAGE_EXISTENCE_CHECK_LIMIT",
        "STOWAGE_DELIMITER",
        "STOWAGE_UPLOAD_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in IMPORT_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.import.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert_eq!(parse_delimiter("Pipe").unwrap(), b'|');
        assert!(parse_delimiter("::").is_err());
    }

    #[test]
    #[serial]
    fn test_import_settings_from_env() {
        clear_env();
        std::env::set_var("STOWAGE_BATCH_SIZE", "250");
        std::env::set_var("STOWAGE_EXISTENCE_CHECK_LIMIT", "unlimited");
        std::env::set_var("STOWAGE_DELIMITER", "semicolon");

        let settings = ImportSettings::from_env().unwrap();
        assert_eq!(settings.batch_size, 250);
        assert_eq!(settings.existence_check_limit, None);
        assert_eq!(settings.delimiter, b';');
        assert_eq!(settings.upload_timeout, Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_an_error() {
        clear_env();
        std::env::set_var("STOWAGE_BATCH_SIZE", "lots");
        assert!(ImportSettings::from_env().is_err());
        clear_env();
    }
}
