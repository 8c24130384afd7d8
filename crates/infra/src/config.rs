//! Service configuration and its environment loading.

use std::time::Duration;

use anyhow::{Context, Result};

use stockledger_concurrency::RetryPolicy;

pub const ENV_MAX_CONCURRENT: &str = "STOCKLEDGER_MAX_CONCURRENT";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "STOCKLEDGER_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "STOCKLEDGER_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "STOCKLEDGER_RETRY_MAX_DELAY_MS";
pub const ENV_OPERATION_TIMEOUT_MS: &str = "STOCKLEDGER_OPERATION_TIMEOUT_MS";
pub const ENV_KEYED_MUTEX: &str = "STOCKLEDGER_KEYED_MUTEX";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Settings for composing a [`StockDomainService`](crate::service::StockDomainService).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Admission limiter capacity.
    pub max_concurrent: u32,
    /// Retry policy for conflicting or rejected cycles.
    pub retry: RetryPolicy,
    /// Upper bound on each service call; a caller deadline that is earlier wins.
    pub operation_timeout: Duration,
    /// Serialize same-product operations in-process before the optimistic check.
    pub use_keyed_mutex: bool,
    /// Postgres URL; `None` selects the in-memory repository
    /// (see [`open_repository`](crate::repository::open_repository)).
    pub database_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_millis(5000),
            use_keyed_mutex: true,
            database_url: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_MAX_CONCURRENT) {
            let max: u32 = parse(ENV_MAX_CONCURRENT, &v)?;
            anyhow::ensure!(max > 0, "{ENV_MAX_CONCURRENT} must be at least 1");
            config.max_concurrent = max;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_ATTEMPTS) {
            let attempts: u32 = parse(ENV_RETRY_MAX_ATTEMPTS, &v)?;
            anyhow::ensure!(attempts > 0, "{ENV_RETRY_MAX_ATTEMPTS} must be at least 1");
            config.retry.max_attempts = attempts;
        }
        if let Some(v) = lookup(ENV_RETRY_BASE_DELAY_MS) {
            config.retry.base_delay = Duration::from_millis(parse(ENV_RETRY_BASE_DELAY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_DELAY_MS) {
            config.retry.max_delay = Duration::from_millis(parse(ENV_RETRY_MAX_DELAY_MS, &v)?);
        }
        anyhow::ensure!(
            config.retry.max_delay >= config.retry.base_delay,
            "{ENV_RETRY_MAX_DELAY_MS} must not be below {ENV_RETRY_BASE_DELAY_MS}"
        );
        if let Some(v) = lookup(ENV_OPERATION_TIMEOUT_MS) {
            let ms: u64 = parse(ENV_OPERATION_TIMEOUT_MS, &v)?;
            anyhow::ensure!(ms > 0, "{ENV_OPERATION_TIMEOUT_MS} must be positive");
            config.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup(ENV_KEYED_MUTEX) {
            config.use_keyed_mutex = parse_bool(&v)
                .with_context(|| format!("invalid {ENV_KEYED_MUTEX}"))?;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_keyed_mutex(mut self, enabled: bool) -> Self {
        self.use_keyed_mutex = enabled;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid {key}: {value:?}"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.max_concurrent, 64);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert!(config.use_keyed_mutex);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ServiceConfig::from_lookup(lookup(&[
            (ENV_MAX_CONCURRENT, "8"),
            (ENV_RETRY_MAX_ATTEMPTS, "5"),
            (ENV_RETRY_BASE_DELAY_MS, "2"),
            (ENV_RETRY_MAX_DELAY_MS, "50"),
            (ENV_OPERATION_TIMEOUT_MS, "250"),
            (ENV_KEYED_MUTEX, "off"),
            (ENV_DATABASE_URL, "postgres://localhost/stock"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(2));
        assert_eq!(config.retry.max_delay, Duration::from_millis(50));
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert!(!config.use_keyed_mutex);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/stock"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ServiceConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT, "lots")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[(ENV_MAX_CONCURRENT, "0")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[(ENV_KEYED_MUTEX, "maybe")])).is_err());
        assert!(
            ServiceConfig::from_lookup(lookup(&[
                (ENV_RETRY_BASE_DELAY_MS, "100"),
                (ENV_RETRY_MAX_DELAY_MS, "10"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let config = ServiceConfig::from_lookup(lookup(&[(ENV_DATABASE_URL, " ")])).unwrap();
        assert!(config.database_url.is_none());
    }
}
