//! Layered configuration for the job runtime and key rotation worker.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub job_processor: JobProcessorConfig,

    #[serde(default)]
    pub key_rotation: KeyRotationConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment: `JOB_RUNTIME_CONFIG` if set,
    /// else one of a few default search paths, else built-in defaults.
    pub fn from_env() -> Result<Self, crate::Error> {
        if let Ok(config_path) = std::env::var("JOB_RUNTIME_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/forgequeue/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.database.pool_size == 0 {
            return Err(Error::Config("database pool size must be > 0".to_string()));
        }
        if self.key_rotation.batch_size == 0 {
            return Err(Error::Config("key rotation batch_size must be > 0".to_string()));
        }
        if self.job_processor.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "job_processor.max_consecutive_failures must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Database backend selection and connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_kind")]
    pub kind: DatabaseKind,

    /// Postgres connection string, or a file path for SQLite.
    #[serde(default = "default_connection_string")]
    pub connection_string: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_db_kind(),
            connection_string: default_connection_string(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Postgres,
    Sqlite,
}

fn default_db_kind() -> DatabaseKind {
    DatabaseKind::Sqlite
}

fn default_connection_string() -> String {
    "forgequeue.db".to_string()
}

fn default_pool_size() -> u32 {
    10
}

/// Logging/tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `RUST_LOG`-style directive, e.g. "info" or "forgequeue_core=debug,warn".
    #[serde(default = "default_log_directive")]
    pub directive: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: default_log_directive(),
            format: default_log_format(),
        }
    }
}

fn default_log_directive() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

/// Job processor tuning: poll cadence, shutdown grace period, and the
/// consecutive-failure guard that trips a worker into a paused state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProcessorConfig {
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for JobProcessorConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl JobProcessorConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_polling_interval_secs() -> u64 {
    5
}

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

/// Key rotation cadence, batching, and the table list subject to
/// re-encryption during a rotation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationConfig {
    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_batch_sleep_ms")]
    pub batch_sleep_ms: u64,

    /// Path to the on-disk key record file.
    #[serde(default = "default_key_file_path")]
    pub key_file_path: String,

    /// Tables carrying a `value` column that needs re-encryption, each
    /// optionally gated behind an `is_encrypted` flag column.
    #[serde(default)]
    pub tables: Vec<RotationTableConfig>,

    /// How often the worker binary enqueues a `key_rotation` check job.
    /// The job itself is cheap when nothing is due, so this can run far
    /// more often than `rotation_interval_days` without doing real work.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: default_rotation_interval_days(),
            batch_size: default_batch_size(),
            batch_sleep_ms: default_batch_sleep_ms(),
            key_file_path: default_key_file_path(),
            tables: Vec::new(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl KeyRotationConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_days * 86_400)
    }

    pub fn batch_sleep(&self) -> Duration {
        Duration::from_millis(self.batch_sleep_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationTableConfig {
    pub table: String,
    pub value_column: String,
    #[serde(default)]
    pub encrypted_flag_column: Option<String>,
}

fn default_rotation_interval_days() -> u64 {
    90
}

fn default_batch_size() -> u32 {
    100
}

fn default_batch_sleep_ms() -> u64 {
    100
}

fn default_key_file_path() -> String {
    "keys.json".to_string()
}

fn default_check_interval_secs() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.job_processor.max_consecutive_failures, 5);
        assert_eq!(config.key_rotation.rotation_interval_days, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rotation_interval_conversion() {
        let config = KeyRotationConfig::default();
        assert_eq!(config.rotation_interval(), Duration::from_secs(90 * 86_400));
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            kind = "postgres"
            connection_string = "postgres://localhost/forgequeue"
            pool_size = 5

            [job_processor]
            polling_interval_secs = 2
            "#,
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.database.pool_size, 5);
        assert_eq!(config.job_processor.polling_interval_secs, 2);
        // untouched sections fall back to defaults
        assert_eq!(config.key_rotation.batch_size, 100);
    }
}
