//! Gate configuration
//!
//! A [`GateConfig`] can be built in code, deserialized with serde, or read
//! from environment variables:
//!
//! | Variable                          | Field                  |
//! |-----------------------------------|------------------------|
//! | `<PREFIX>_DRIVER`                 | `driver`               |
//! | `<PREFIX>_URL`                    | `connection.url`       |
//! | `<PREFIX>_MAX_CONNECTIONS`        | `max_connections`      |
//! | `<PREFIX>_RESERVED_CONNECTIONS`   | `reserved_connections` |
//! | `<PREFIX>_ACQUIRE_TIMEOUT_MS`     | `acquire_timeout_ms`   |

use serde::Deserialize;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::handle::HandleConfig;

/// Admission gate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Driver identifier resolved through a [`DriverRegistry`](crate::driver::DriverRegistry)
    pub driver: String,
    /// Connection settings passed to the driver
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Physical connection reuse settings
    #[serde(default)]
    pub handle: HandleConfig,
    /// Server connection limit (the server's `max_connections`)
    pub max_connections: i64,
    /// Overrides the driver's reserved connection count
    #[serde(default)]
    pub reserved_connections: Option<u32>,
    /// Maximum wait for capacity in milliseconds (`None` waits forever)
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl GateConfig {
    /// Create a configuration from the three construction inputs
    pub fn new(driver: impl Into<String>, url: impl Into<String>, max_connections: i64) -> Self {
        Self {
            driver: driver.into(),
            connection: ConnectionConfig::new(url),
            handle: HandleConfig::default(),
            max_connections,
            reserved_connections: None,
            acquire_timeout_ms: None,
        }
    }

    /// Read configuration from `<PREFIX>_*` environment variables
    pub fn from_env(prefix: &str) -> Result<Self> {
        let driver = required_var(prefix, "DRIVER")?;
        let url = required_var(prefix, "URL")?;
        let raw_limit = required_var(prefix, "MAX_CONNECTIONS")?;
        let max_connections = parse_var(prefix, "MAX_CONNECTIONS", &raw_limit)?;

        let mut config = Self::new(driver, url, max_connections);
        if let Some(raw) = optional_var(prefix, "RESERVED_CONNECTIONS") {
            config.reserved_connections =
                Some(parse_var(prefix, "RESERVED_CONNECTIONS", &raw)?);
        }
        if let Some(raw) = optional_var(prefix, "ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout_ms = Some(parse_var(prefix, "ACQUIRE_TIMEOUT_MS", &raw)?);
        }
        Ok(config)
    }

    /// Set connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set physical connection reuse settings
    pub fn with_handle(mut self, handle: HandleConfig) -> Self {
        self.handle = handle;
        self
    }

    /// Override the driver's reserved connection count
    pub fn with_reserved_connections(mut self, reserved: u32) -> Self {
        self.reserved_connections = Some(reserved);
        self
    }

    /// Bound every wait for capacity
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Configured acquire timeout
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration before anything is opened
    pub fn validate(&self) -> Result<()> {
        if self.max_connections < 1 {
            return Err(Error::config(format!(
                "max_connections must be at least 1, got {}",
                self.max_connections
            )));
        }
        if self.driver.trim().is_empty() {
            return Err(Error::config("driver must not be empty"));
        }
        if self.connection.url.trim().is_empty() {
            return Err(Error::config("connection url must not be empty"));
        }
        if self.handle.max_idle < self.handle.min_idle {
            return Err(Error::config(format!(
                "handle max_idle ({}) must not be below min_idle ({})",
                self.handle.max_idle, self.handle.min_idle
            )));
        }
        Ok(())
    }
}

fn var_name(prefix: &str, key: &str) -> String {
    format!("{}_{}", prefix, key)
}

fn optional_var(prefix: &str, key: &str) -> Option<String> {
    std::env::var(var_name(prefix, key))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn required_var(prefix: &str, key: &str) -> Result<String> {
    optional_var(prefix, key)
        .ok_or_else(|| Error::config(format!("{} is not set", var_name(prefix, key))))
}

fn parse_var<T: std::str::FromStr>(prefix: &str, key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        Error::config(format!(
            "invalid {}='{}': {}",
            var_name(prefix, key),
            raw,
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_new_defaults() {
        let config = GateConfig::new("postgres", "postgres://localhost/db", 4);

        assert_eq!(config.driver, "postgres");
        assert_eq!(config.connection.url, "postgres://localhost/db");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.reserved_connections, None);
        assert_eq!(config.acquire_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_positive_limit() {
        for limit in [0, -1, i64::MIN] {
            let err = GateConfig::new("postgres", "postgres://localhost/db", limit)
                .validate()
                .unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Configuration);
        }
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let err = GateConfig::new("postgres", "  ", 4).validate().unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_validate_rejects_inverted_idle_bounds() {
        let config = GateConfig::new("postgres", "postgres://localhost/db", 4)
            .with_handle(HandleConfig::default().with_min_idle(3).with_max_idle(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = GateConfig::new("mysql", "mysql://localhost/db", 10)
            .with_reserved_connections(0)
            .with_acquire_timeout(Duration::from_millis(250));

        assert_eq!(config.reserved_connections, Some(0));
        assert_eq!(config.acquire_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_deserialize() {
        let config: GateConfig = serde_json::from_value(serde_json::json!({
            "driver": "postgres",
            "connection": { "url": "postgres://localhost/db", "connect_timeout_ms": 500 },
            "handle": { "max_idle": 4 },
            "max_connections": 20,
            "acquire_timeout_ms": 1000
        }))
        .unwrap();

        assert_eq!(config.connection.connect_timeout_ms, 500);
        assert_eq!(config.connection.application_name, Some("sqlgate".into()));
        assert_eq!(config.handle.max_idle, 4);
        assert_eq!(config.handle.min_idle, 1);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.acquire_timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("SQLGATE_CFGTEST_DRIVER", "postgres");
        std::env::set_var("SQLGATE_CFGTEST_URL", "postgres://localhost/db");
        std::env::set_var("SQLGATE_CFGTEST_MAX_CONNECTIONS", "12");
        std::env::set_var("SQLGATE_CFGTEST_ACQUIRE_TIMEOUT_MS", "300");

        let config = GateConfig::from_env("SQLGATE_CFGTEST").unwrap();
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.acquire_timeout(), Some(Duration::from_millis(300)));
        assert_eq!(config.reserved_connections, None);

        std::env::set_var("SQLGATE_CFGTEST_MAX_CONNECTIONS", "many");
        let err = GateConfig::from_env("SQLGATE_CFGTEST").unwrap_err();
        assert!(err.to_string().contains("SQLGATE_CFGTEST_MAX_CONNECTIONS"));
    }

    #[test]
    fn test_from_env_missing() {
        let err = GateConfig::from_env("SQLGATE_CFGTEST_UNSET").unwrap_err();
        assert!(err.to_string().contains("SQLGATE_CFGTEST_UNSET_DRIVER"));
    }
}
