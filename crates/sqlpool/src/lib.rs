//! # sqlpool
//!
//! Driver-agnostic connection pooling and transaction lifecycle for async
//! SQL clients.
//!
//! A driver only supplies the raw capabilities in [`driver`]: connecting,
//! running queries, preparing statements and opening transactions with
//! savepoints. This crate adds everything around them.
//!
//! ## Features
//!
//! - **Bounded pooling**: connections are opened on demand up to a limit;
//!   beyond it, callers wait for a connection to be released
//! - **Idle reaping**: connections unused for the idle timeout are closed
//! - **Retrying connects**: [`RetryConnector`] retries connection failures
//!   and reports every attempt
//! - **Deferred release**: results, statements and transactions keep their
//!   connection checked out until they and everything derived from them are
//!   finished
//! - **Multi-result streaming**: [`PooledResult`] walks chains of result sets
//! - **Pool-wide statements**: [`StatementPool`] reuses prepared statements
//!   across connections
//! - **Nested transactions**: [`NestedTransaction`] is emulated with
//!   savepoints; a transaction with an open child waits for it
//!
//! ## Release model
//!
//! ```text
//! pool.query()            -> PooledResult ---------- next_result() --> PooledResult -> released
//! pool.begin_transaction() -> PooledTransaction -> begin_transaction() -> NestedTransaction
//!                              |                                       (parent busy until closed)
//!                              +-> commit()/rollback() -> released once derived results are done
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::{ConnectionConfig, ConnectionPool, PoolConfig, RetryConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sqlpool::Error> {
//!     let config = ConnectionConfig::from_connection_string(
//!         "host=localhost port=5432 user=app password=secret db=shop",
//!     )?;
//!
//!     let pool = ConnectionPool::new(
//!         config,
//!         PoolConfig::new().max_connections(20),
//!         RetryConnector::new(PgConnector::default(), 3)?,
//!     )?;
//!
//!     let mut result = pool.query("SELECT id FROM orders").await?;
//!     while let Some(row) = result.next_row().await? {
//!         println!("{row:?}");
//!     }
//!
//!     let mut tx = pool.begin_transaction().await?;
//!     tx.execute("INSERT INTO orders (customer_id) VALUES (?)", params).await?;
//!     tx.commit().await?;
//!
//!     pool.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod pool;
pub mod release;
pub mod result;
pub mod signal;
pub mod statement;
pub mod transaction;

pub use config::{ConnectionConfig, PoolConfig};
pub use connector::RetryConnector;
pub use driver::{Connection, Connector, Driver, ResultSet, Statement, TransactionExecutor};
pub use error::{CompositeError, Error, Result};
pub use pool::{ConnectionPool, PoolStatus};
pub use release::ReleaseHandle;
pub use result::PooledResult;
pub use signal::Signal;
pub use statement::{PooledStatement, StatementPool};
pub use transaction::{IsolationLevel, NestedTransaction, PooledTransaction, TransactionState};
