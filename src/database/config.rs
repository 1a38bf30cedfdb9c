use crate::core::{DbError, Result};
use std::time::Duration;

pub const ENV_SCHEMA_VERSION: &str = "RUSTENTITYDB_SCHEMA_VERSION";
pub const ENV_BATCH_RETRY_MS: &str = "RUSTENTITYDB_BATCH_RETRY_MS";
pub const ENV_BATCH_TIMEOUT_MS: &str = "RUSTENTITYDB_BATCH_TIMEOUT_MS";
pub const ENV_REFERENCE_RETRY_MS: &str = "RUSTENTITYDB_REFERENCE_RETRY_MS";
pub const ENV_REFERENCE_TIMEOUT_MS: &str = "RUSTENTITYDB_REFERENCE_TIMEOUT_MS";

/// Database configuration
///
/// Shared by every cache and batch created from one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Schema version stamped on every entity the database's caches construct
    pub schema_version: u32,

    /// Wait between attempts of a failed batch write
    pub batch_retry_interval: Duration,

    /// Overall retry time limit of one entity inside a batch commit
    pub batch_timeout: Duration,

    /// Wait between attempts of a failed reference resolution
    pub reference_retry_interval: Duration,

    /// Overall retry time limit of one reference resolution
    pub reference_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            batch_retry_interval: Duration::from_secs(1),
            batch_timeout: Duration::from_secs(60),
            reference_retry_interval: Duration::from_secs(1),
            reference_timeout: Duration::from_secs(60),
        }
    }

    /// Set the schema version
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Set the batch retry interval
    pub fn batch_retry_interval(mut self, interval: Duration) -> Self {
        self.batch_retry_interval = interval;
        self
    }

    /// Set the batch timeout
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Set the reference retry interval
    pub fn reference_retry_interval(mut self, interval: Duration) -> Self {
        self.reference_retry_interval = interval;
        self
    }

    /// Set the reference timeout
    pub fn reference_timeout(mut self, timeout: Duration) -> Self {
        self.reference_timeout = timeout;
        self
    }

    /// Overlay values found in the process environment
    ///
    /// Reads `RUSTENTITYDB_SCHEMA_VERSION` and the `*_MS` duration variables.
    /// Unset variables keep their current value.
    pub fn from_env() -> Result<Self> {
        Self::new().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SCHEMA_VERSION) {
            self.schema_version = parse_number(ENV_SCHEMA_VERSION, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BATCH_RETRY_MS) {
            self.batch_retry_interval = parse_millis(ENV_BATCH_RETRY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BATCH_TIMEOUT_MS) {
            self.batch_timeout = parse_millis(ENV_BATCH_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REFERENCE_RETRY_MS) {
            self.reference_retry_interval = parse_millis(ENV_REFERENCE_RETRY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REFERENCE_TIMEOUT_MS) {
            self.reference_timeout = parse_millis(ENV_REFERENCE_TIMEOUT_MS, &raw)?;
        }
        self.validate().map_err(DbError::Config)?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema_version == 0 {
            return Err("schema_version must be >= 1".to_string());
        }

        if self.batch_retry_interval.is_zero() {
            return Err("batch_retry_interval must be > 0".to_string());
        }

        if self.reference_retry_interval.is_zero() {
            return Err("reference_retry_interval must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u32> {
    raw.trim()
        .parse()
        .map_err(|_| DbError::Config(format!("{} must be an unsigned integer, got '{}'", name, raw)))
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| DbError::Config(format!("{} must be milliseconds, got '{}'", name, raw)))
}

/// Retry discipline of one batch commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub retry_interval: Duration,
    pub timeout: Duration,
}

impl From<&DatabaseConfig> for BatchPolicy {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            retry_interval: config.batch_retry_interval,
            timeout: config.batch_timeout,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.schema_version, 1);
        assert_eq!(config.batch_retry_interval, Duration::from_secs(1));
        assert_eq!(config.batch_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = DatabaseConfig::new()
            .schema_version(3)
            .batch_retry_interval(Duration::from_millis(5))
            .batch_timeout(Duration::from_millis(50))
            .reference_retry_interval(Duration::from_millis(7))
            .reference_timeout(Duration::from_millis(70));

        assert_eq!(config.schema_version, 3);
        assert_eq!(config.batch_retry_interval, Duration::from_millis(5));
        assert_eq!(config.reference_timeout, Duration::from_millis(70));

        let policy = BatchPolicy::from(&config);
        assert_eq!(policy.retry_interval, Duration::from_millis(5));
        assert_eq!(policy.timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SCHEMA_VERSION, "4"),
            (ENV_BATCH_RETRY_MS, "250"),
            (ENV_REFERENCE_TIMEOUT_MS, " 900 "),
        ]
        .into_iter()
        .collect();

        let config = DatabaseConfig::new()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.schema_version, 4);
        assert_eq!(config.batch_retry_interval, Duration::from_millis(250));
        assert_eq!(config.reference_timeout, Duration::from_millis(900));
        assert_eq!(config.batch_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_overrides() {
        let result = DatabaseConfig::new()
            .with_overrides(|name| (name == ENV_BATCH_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(matches!(result, Err(DbError::Config(_))));

        let result = DatabaseConfig::new()
            .with_overrides(|name| (name == ENV_SCHEMA_VERSION).then(|| "0".to_string()));
        assert!(matches!(result, Err(DbError::Config(_))));
    }
}
