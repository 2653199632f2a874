//! Pool and connection configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transaction::IsolationLevel;

/// Default maximum number of connections in a pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;

/// Default time a connection may stay idle before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default period of the idle reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Smallest accepted idle timeout.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections allowed.
    pub max_connections: u32,

    /// Time a connection can be idle before being closed.
    pub idle_timeout: Duration,

    /// Period of the idle reaper.
    pub reap_interval: Duration,

    /// Isolation level used by
    /// [`ConnectionPool::begin_transaction`](crate::ConnectionPool::begin_transaction).
    pub transaction_isolation: IsolationLevel,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            transaction_isolation: IsolationLevel::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the idle reaper period.
    #[must_use]
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the default transaction isolation level.
    #[must_use]
    pub fn transaction_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.transaction_isolation = isolation;
        self
    }

    /// Idle timeout applied to cached prepared statements: a tenth of the
    /// connection idle timeout, but never below [`MIN_IDLE_TIMEOUT`].
    #[must_use]
    pub fn statement_idle_timeout(&self) -> Duration {
        (self.idle_timeout / 10).max(MIN_IDLE_TIMEOUT)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Configuration(
                "pool must contain at least one connection".into(),
            ));
        }
        if self.idle_timeout < MIN_IDLE_TIMEOUT {
            return Err(Error::Configuration(
                "the idle timeout must be 1 second or greater".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(Error::Configuration(
                "reap_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Connection parameters handed unchanged to the connector on every
/// connect attempt.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database name.
    pub database: Option<String>,
    /// Driver-specific options not covered by the fields above.
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Create a configuration for the given server.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
            database: None,
            options: BTreeMap::new(),
        }
    }

    /// Set the user name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set a driver-specific option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// `host:port`, as used in connection error messages.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a connection string of `key=value` pairs separated by
    /// whitespace or semicolons.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sqlpool::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::from_connection_string(
    ///     "host=localhost port=5432 user=app dbname=orders sslmode=disable",
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(config.target(), "localhost:5432");
    /// assert_eq!(config.database.as_deref(), Some("orders"));
    /// assert_eq!(config.options["sslmode"], "disable");
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut host = None;
        let mut port = None;
        let mut config = Self::new("", 0);

        for part in conn_str
            .split(|c: char| c == ';' || c.is_whitespace())
            .filter(|part| !part.is_empty())
        {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("expected key=value pair, got '{part}'"))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            match key.as_str() {
                "host" | "server" => host = Some(value),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        Error::Configuration(format!("invalid port '{value}'"))
                    })?)
                }
                "user" | "username" => config.user = Some(value),
                "password" | "pass" => config.password = Some(value),
                "database" | "dbname" | "db" => config.database = Some(value),
                _ => {
                    config.options.insert(key, value);
                }
            }
        }

        config.host = host.ok_or_else(|| {
            Error::Configuration("connection string must specify a host".into())
        })?;
        config.port = port.ok_or_else(|| {
            Error::Configuration("connection string must specify a port".into())
        })?;

        Ok(config)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.transaction_isolation, IsolationLevel::ReadCommitted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .max_connections(50)
            .idle_timeout(Duration::from_secs(120))
            .reap_interval(Duration::from_millis(500))
            .transaction_isolation(IsolationLevel::Serializable);

        assert_eq!(config.max_connections, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.reap_interval, Duration::from_millis(500));
        assert_eq!(config.transaction_isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn test_config_validation_zero_max() {
        let result = PoolConfig::new().max_connections(0).validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("pool must contain at least one connection")
        );
    }

    #[test]
    fn test_config_validation_short_idle_timeout() {
        let result = PoolConfig::new()
            .idle_timeout(Duration::from_millis(999))
            .validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("the idle timeout must be 1 second or greater")
        );
    }

    #[test]
    fn test_statement_idle_timeout() {
        let config = PoolConfig::new().idle_timeout(Duration::from_secs(60));
        assert_eq!(config.statement_idle_timeout(), Duration::from_secs(6));

        let config = PoolConfig::new().idle_timeout(Duration::from_secs(5));
        assert_eq!(config.statement_idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_connection_string() {
        let config = ConnectionConfig::from_connection_string(
            "host=db.internal;port=3306;username=app;pass=secret;db=shop;charset=utf8mb4",
        )
        .unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 3306);
        assert_eq!(config.user.as_deref(), Some("app"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert_eq!(config.options.get("charset").map(String::as_str), Some("utf8mb4"));
    }

    #[test]
    fn test_connection_string_requires_host_and_port() {
        assert!(ConnectionConfig::from_connection_string("port=5432").is_err());
        assert!(ConnectionConfig::from_connection_string("host=localhost").is_err());
        assert!(ConnectionConfig::from_connection_string("host=localhost port=x").is_err());
        assert!(ConnectionConfig::from_connection_string("host").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::new("localhost", 5432)
            .user("app")
            .password("hunter2");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
