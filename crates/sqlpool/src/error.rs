//! Pool error types.

use std::fmt;

use thiserror::Error;

/// Boxed error type drivers may use to report failures the taxonomy below
/// does not name.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool, statement and transaction operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A connector failed to establish a session.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Every connection attempt made by a [`RetryConnector`](crate::RetryConnector) failed.
    #[error("could not connect to database server at {target} after {tries} tries: {attempts}")]
    ConnectRetriesExhausted {
        /// `host:port` of the server that was tried.
        target: String,
        /// Number of attempts made.
        tries: u32,
        /// Every attempt's error, in order.
        #[source]
        attempts: CompositeError,
    },

    /// The pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The statement (or statement pool) has been closed.
    #[error("the statement has been closed")]
    StatementClosed,

    /// The driver reported a failure while running a statement.
    #[error("query error: {0}")]
    Query(String),

    /// The transaction has been committed or rolled back.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid pool, connector or connection configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Any other driver failure.
    #[error("driver error: {0}")]
    Driver(#[source] BoxError),
}

impl Error {
    /// Wrap an arbitrary driver error.
    pub fn driver(err: impl Into<BoxError>) -> Self {
        Self::Driver(err.into())
    }

    /// Check if this error was raised while establishing a connection.
    ///
    /// These are the only errors a [`RetryConnector`](crate::RetryConnector)
    /// retries.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectRetriesExhausted { .. }
        )
    }

    /// Check if this error was raised because a pool or statement is closed.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::PoolClosed | Self::StatementClosed)
    }

    /// Check if this error was raised by an operation on a finished transaction.
    #[must_use]
    pub fn is_transaction_state(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.is_connection_error()
    }
}

/// The errors of several failed attempts, kept in the order they occurred.
#[derive(Debug, Default)]
pub struct CompositeError(Vec<Error>);

impl CompositeError {
    /// Create a composite from the given errors.
    pub fn new(errors: Vec<Error>) -> Self {
        Self(errors)
    }

    /// The individual errors.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Number of errors collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no error was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the composite, returning the individual errors.
    pub fn into_inner(self) -> Vec<Error> {
        self.0
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "{} [{}] {}", if i == 0 { ":" } else { ";" }, i + 1, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .last()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Connection("refused".into()).is_connection_error());
        assert!(Error::Connection("refused".into()).is_transient());
        assert!(Error::PoolClosed.is_operational());
        assert!(Error::StatementClosed.is_operational());
        assert!(Error::Transaction("done".into()).is_transaction_state());
        assert!(!Error::Query("syntax".into()).is_connection_error());
        assert!(!Error::Query("syntax".into()).is_operational());
    }

    #[test]
    fn test_composite_error_display() {
        let composite = CompositeError::new(vec![
            Error::Connection("refused".into()),
            Error::Connection("timed out".into()),
        ]);

        assert_eq!(composite.len(), 2);
        assert_eq!(
            composite.to_string(),
            "2 error(s): [1] connection failed: refused; [2] connection failed: timed out"
        );
    }

    #[test]
    fn test_retries_exhausted_keeps_attempts() {
        let err = Error::ConnectRetriesExhausted {
            target: "localhost:5432".into(),
            tries: 1,
            attempts: CompositeError::new(vec![Error::Connection("refused".into())]),
        };

        assert!(err.is_connection_error());
        assert!(err.to_string().contains("localhost:5432 after 1 tries"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_driver_error_keeps_source() {
        let io = std::io::Error::other("broken pipe");
        let err = Error::driver(io);
        assert_eq!(err.to_string(), "driver error: broken pipe");
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_transient());
    }
}
