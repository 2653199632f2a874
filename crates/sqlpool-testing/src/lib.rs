//! # sqlpool-testing
//!
//! Test infrastructure for sqlpool.
//!
//! This crate provides an in-memory stub driver that answers queries from a
//! script, so the pool, result, statement and transaction machinery can be
//! exercised without a database server. The behavioural test-suite of the
//! workspace lives in this crate's `tests/` directory.
//!
//! ## Features
//!
//! - Scripted responses per SQL text, including multi result set chains
//! - Configurable query latency and connect delay (pair with a paused Tokio
//!   clock for deterministic timing)
//! - Scripted connection failures
//! - An [`EventLog`] recording every connect, query, savepoint, commit,
//!   rollback and close
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::{ConnectionConfig, ConnectionPool, PoolConfig};
//! use sqlpool_testing::{StubConnector, StubResponse};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_query() {
//!     let connector = StubConnector::builder()
//!         .with_response("SELECT 1", StubResponse::scalar(1))
//!         .build();
//!     let pool = ConnectionPool::new(
//!         ConnectionConfig::new("localhost", 5432),
//!         PoolConfig::new(),
//!         connector.clone(),
//!     )
//!     .unwrap();
//!
//!     let rows = pool.query("SELECT 1").await.unwrap().collect_all().await.unwrap();
//!     assert_eq!(rows.len(), 1);
//!     assert_eq!(connector.connect_count(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod connector;
pub mod events;
pub mod response;

pub use connection::{StubConnection, StubStatement, StubTransaction};
pub use connector::{ConnectFailure, StubConnector, StubConnectorBuilder};
pub use events::{ConnectionId, Event, EventLog};
pub use response::{ScalarValue, StubParams, StubResponse, StubResultSet, StubRow};

/// The stub driver: binds the stub types to the `sqlpool` driver traits.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubDriver;

impl sqlpool::Driver for StubDriver {
    type Params = StubParams;
    type Row = StubRow;
    type ResultSet = StubResultSet;
    type Statement = StubStatement;
    type Transaction = StubTransaction;
    type Connection = StubConnection;
}
