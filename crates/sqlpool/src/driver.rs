//! Driver capability traits.
//!
//! A concrete driver (MySQL, Postgres, SQLite, ...) implements these traits
//! for its own connection, result set, statement and transaction types and
//! ties them together with a [`Driver`] marker. Everything else in this crate
//! is generic over that marker.
//!
//! The traits use `#[async_trait]` so connectors can be boxed and every
//! returned future is `Send`.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::transaction::IsolationLevel;

/// Bundles the concrete types of one driver.
pub trait Driver: Send + Sync + Sized + 'static {
    /// Statement parameters.
    type Params: Send + 'static;
    /// A materialized row, typically a mapping of column name to value.
    type Row: Send + 'static;
    /// Result set of a query or statement execution.
    type ResultSet: ResultSet<Row = Self::Row>;
    /// Prepared statement.
    type Statement: Statement<Self>;
    /// Open transaction on a connection.
    type Transaction: TransactionExecutor<Self>;
    /// Live database session.
    type Connection: Connection<Self>;
}

/// Establishes new connections.
#[async_trait]
pub trait Connector<D: Driver>: Send + Sync + 'static {
    /// Open a new session.
    ///
    /// Failures to reach the server must be reported as
    /// [`Error::Connection`](crate::Error::Connection); other errors are
    /// never retried.
    async fn connect(&self, config: &ConnectionConfig) -> Result<D::Connection>;
}

/// A live database session.
#[async_trait]
pub trait Connection<D: Driver>: Send + Sync + 'static {
    /// Run a query without parameters.
    async fn query(&self, sql: &str) -> Result<D::ResultSet>;

    /// Run a query with parameters.
    async fn execute(&self, sql: &str, params: D::Params) -> Result<D::ResultSet>;

    /// Prepare a statement bound to this connection.
    async fn prepare(&self, sql: &str) -> Result<D::Statement>;

    /// Start a transaction at the given isolation level.
    async fn begin_transaction(&self, isolation: IsolationLevel) -> Result<D::Transaction>;

    /// Close the session.
    async fn close(&self);

    /// Whether the session has been closed or has died.
    fn is_closed(&self) -> bool;

    /// When the session last ran anything.
    fn last_used_at(&self) -> Instant;

    /// Register a callback invoked once the session closes.
    ///
    /// The pool stops counting a connection towards its limit as soon as
    /// this fires, including when the server drops the session.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send>);
}

/// A lazily consumed result set, possibly followed by further result sets.
#[async_trait]
pub trait ResultSet: Send + Sized + 'static {
    /// Row type.
    type Row: Send + 'static;

    /// Fetch the next row, or `None` once this result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Self::Row>>;

    /// Rows returned or affected, if known.
    fn row_count(&self) -> Option<u64>;

    /// Number of columns, if this result set returns rows.
    fn column_count(&self) -> Option<usize>;

    /// Move to the next result set of a multi-statement execution.
    ///
    /// Unread rows of the current result set are discarded.
    async fn next_result(&mut self) -> Result<Option<Self>>;
}

/// A prepared statement bound to one connection.
#[async_trait]
pub trait Statement<D: Driver>: Send + Sync + 'static {
    /// Execute with the given parameters.
    async fn execute(&self, params: D::Params) -> Result<D::ResultSet>;

    /// SQL text the statement was prepared from.
    fn query(&self) -> &str;

    /// Whether the statement (or its connection) has been closed.
    fn is_closed(&self) -> bool;

    /// Deallocate the statement.
    async fn close(&self);

    /// When the statement was last executed.
    fn last_used_at(&self) -> Instant;
}

/// An open transaction that supports savepoints.
///
/// Nested transactions share one executor and address their savepoints by
/// identifier.
#[async_trait]
pub trait TransactionExecutor<D: Driver>: Send + Sync + 'static {
    /// Run a query without parameters.
    async fn query(&self, sql: &str) -> Result<D::ResultSet>;

    /// Run a query with parameters.
    async fn execute(&self, sql: &str, params: D::Params) -> Result<D::ResultSet>;

    /// Prepare a statement inside the transaction.
    async fn prepare(&self, sql: &str) -> Result<D::Statement>;

    /// Commit the transaction.
    async fn commit(&self) -> Result<()>;

    /// Roll back the transaction.
    async fn rollback(&self) -> Result<()>;

    /// Create a savepoint.
    async fn create_savepoint(&self, identifier: &str) -> Result<()>;

    /// Roll back to a savepoint, keeping the transaction open.
    async fn rollback_to(&self, identifier: &str) -> Result<()>;

    /// Release a savepoint, keeping its effects.
    async fn release_savepoint(&self, identifier: &str) -> Result<()>;

    /// Whether the transaction is still open.
    fn is_active(&self) -> bool;

    /// Whether the underlying connection has been closed.
    fn is_closed(&self) -> bool;

    /// Isolation level the transaction was started with.
    fn isolation(&self) -> IsolationLevel;

    /// When the transaction last ran anything.
    fn last_used_at(&self) -> Instant;
}
