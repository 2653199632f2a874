//! Connection retry.

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::driver::{Connector, Driver};
use crate::error::{CompositeError, Error, Result};

/// Default number of connection attempts.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Wraps another connector and retries connection failures.
///
/// Only connection-class errors ([`Error::is_connection_error`]) are
/// retried; anything else is returned immediately. Once every attempt has
/// failed, the errors are returned together in
/// [`Error::ConnectRetriesExhausted`].
///
/// # Example
///
/// ```rust,ignore
/// let connector = RetryConnector::new(PgConnector::default(), 5)?;
/// let pool = ConnectionPool::new(config, PoolConfig::new(), connector)?;
/// ```
pub struct RetryConnector<D: Driver, C: Connector<D>> {
    connector: C,
    max_tries: u32,
    _driver: PhantomData<fn() -> D>,
}

impl<D: Driver, C: Connector<D>> RetryConnector<D, C> {
    /// Wrap `connector`, making at most `max_tries` attempts per connect.
    pub fn new(connector: C, max_tries: u32) -> Result<Self> {
        if max_tries == 0 {
            return Err(Error::Configuration(
                "the number of tries must be 1 or greater".into(),
            ));
        }
        Ok(Self {
            connector,
            max_tries,
            _driver: PhantomData,
        })
    }

    /// Wrap `connector` with [`DEFAULT_MAX_TRIES`] attempts.
    pub fn with_default_tries(connector: C) -> Self {
        Self {
            connector,
            max_tries: DEFAULT_MAX_TRIES,
            _driver: PhantomData,
        }
    }

    /// Maximum number of attempts per connect.
    #[must_use]
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// The wrapped connector.
    pub fn inner(&self) -> &C {
        &self.connector
    }
}

#[async_trait]
impl<D: Driver, C: Connector<D>> Connector<D> for RetryConnector<D, C> {
    async fn connect(&self, config: &ConnectionConfig) -> Result<D::Connection> {
        let mut attempts = Vec::new();

        for attempt in 1..=self.max_tries {
            match self.connector.connect(config).await {
                Ok(connection) => return Ok(connection),
                Err(err) if err.is_connection_error() => {
                    tracing::debug!(
                        server = %config.target(),
                        attempt,
                        max_tries = self.max_tries,
                        error = %err,
                        "connection attempt failed"
                    );
                    attempts.push(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::ConnectRetriesExhausted {
            target: config.target(),
            tries: self.max_tries,
            attempts: CompositeError::new(attempts),
        })
    }
}
