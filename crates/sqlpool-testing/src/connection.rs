//! Stub connection, statement and transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlpool::{
    Connection, Error, IsolationLevel, Result, Signal, Statement, TransactionExecutor,
};
use tokio::time::Instant;

use crate::StubDriver;
use crate::connector::ServerState;
use crate::events::{ConnectionId, Event};
use crate::response::{StubParams, StubResponse, StubResultSet};

/// State shared by a connection and the statements and transaction opened
/// on it.
pub(crate) struct ConnectionShared {
    id: ConnectionId,
    server: Arc<ServerState>,
    closed: AtomicBool,
    last_used: Mutex<Instant>,
    on_close: Signal,
}

impl ConnectionShared {
    pub(crate) fn new(id: ConnectionId, server: Arc<ServerState>) -> Arc<Self> {
        Arc::new(Self {
            id,
            server,
            closed: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
            on_close: Signal::new(),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn kill(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.on_close.complete();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("the connection has been closed".into()));
        }
        Ok(())
    }

    fn record(&self, event: Event) {
        self.server.events.record(event);
    }

    /// Run `sql` against the scripted responses.
    async fn run(&self, sql: &str, params: StubParams) -> Result<StubResultSet> {
        self.ensure_open()?;

        if !self.server.query_latency.is_zero() {
            tokio::time::sleep(self.server.query_latency).await;
        }
        *self.last_used.lock() = Instant::now();

        StubResultSet::from_response(self.server.response_for(sql), sql, &params)
    }

    async fn prepare(self: &Arc<Self>, sql: &str) -> Result<StubStatement> {
        self.ensure_open()?;
        self.record(Event::Prepare(self.id, sql.to_owned()));
        *self.last_used.lock() = Instant::now();

        if let StubResponse::Error(message) = self.server.response_for(sql) {
            return Err(Error::Query(message));
        }

        Ok(StubStatement {
            sql: sql.to_owned(),
            connection: self.clone(),
            closed: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        })
    }
}

/// An in-memory connection answering from the connector's script.
pub struct StubConnection {
    shared: Arc<ConnectionShared>,
}

impl StubConnection {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// Identifier of this connection, in connect order.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }
}

impl std::fmt::Debug for StubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubConnection")
            .field("id", &self.shared.id)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection<StubDriver> for StubConnection {
    async fn query(&self, sql: &str) -> Result<StubResultSet> {
        self.shared.record(Event::Query(self.shared.id, sql.to_owned()));
        self.shared.run(sql, Vec::new()).await
    }

    async fn execute(&self, sql: &str, params: StubParams) -> Result<StubResultSet> {
        self.shared.record(Event::Query(self.shared.id, sql.to_owned()));
        self.shared.run(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<StubStatement> {
        self.shared.prepare(sql).await
    }

    async fn begin_transaction(&self, isolation: IsolationLevel) -> Result<StubTransaction> {
        self.shared.ensure_open()?;
        self.shared.record(Event::Begin(self.shared.id, isolation));
        *self.shared.last_used.lock() = Instant::now();

        Ok(StubTransaction {
            connection: self.shared.clone(),
            isolation,
            active: AtomicBool::new(true),
        })
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.record(Event::Close(self.shared.id));
            self.shared.on_close.complete();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn last_used_at(&self) -> Instant {
        *self.shared.last_used.lock()
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        self.shared.on_close.subscribe(callback);
    }
}

/// A statement prepared on a [`StubConnection`].
pub struct StubStatement {
    sql: String,
    connection: Arc<ConnectionShared>,
    closed: AtomicBool,
    last_used: Mutex<Instant>,
}

impl std::fmt::Debug for StubStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubStatement")
            .field("sql", &self.sql)
            .field("connection", &self.connection.id)
            .finish()
    }
}

#[async_trait]
impl Statement<StubDriver> for StubStatement {
    async fn execute(&self, params: StubParams) -> Result<StubResultSet> {
        if self.is_closed() {
            return Err(Error::StatementClosed);
        }
        self.connection
            .record(Event::Execute(self.connection.id, self.sql.clone()));
        *self.last_used.lock() = Instant::now();
        self.connection.run(&self.sql, params).await
    }

    fn query(&self) -> &str {
        &self.sql
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.is_closed()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connection
                .record(Event::CloseStatement(self.connection.id, self.sql.clone()));
        }
    }

    fn last_used_at(&self) -> Instant {
        *self.last_used.lock()
    }
}

/// A transaction opened on a [`StubConnection`].
pub struct StubTransaction {
    connection: Arc<ConnectionShared>,
    isolation: IsolationLevel,
    active: AtomicBool,
}

impl StubTransaction {
    fn ensure_active(&self) -> Result<()> {
        self.connection.ensure_open()?;
        if !self.active.load(Ordering::SeqCst) {
            return Err(Error::Transaction("no transaction in progress".into()));
        }
        Ok(())
    }

    fn finish(&self, event: Event) -> Result<()> {
        self.ensure_active()?;
        self.active.store(false, Ordering::SeqCst);
        self.connection.record(event);
        Ok(())
    }

    fn savepoint_op(&self, event: Event) -> Result<()> {
        self.ensure_active()?;
        self.connection.record(event);
        Ok(())
    }
}

impl std::fmt::Debug for StubTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubTransaction")
            .field("connection", &self.connection.id)
            .field("isolation", &self.isolation)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl TransactionExecutor<StubDriver> for StubTransaction {
    async fn query(&self, sql: &str) -> Result<StubResultSet> {
        self.ensure_active()?;
        self.connection
            .record(Event::Query(self.connection.id, sql.to_owned()));
        self.connection.run(sql, Vec::new()).await
    }

    async fn execute(&self, sql: &str, params: StubParams) -> Result<StubResultSet> {
        self.ensure_active()?;
        self.connection
            .record(Event::Query(self.connection.id, sql.to_owned()));
        self.connection.run(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<StubStatement> {
        self.ensure_active()?;
        self.connection.prepare(sql).await
    }

    async fn commit(&self) -> Result<()> {
        self.finish(Event::Commit(self.connection.id))
    }

    async fn rollback(&self) -> Result<()> {
        self.finish(Event::Rollback(self.connection.id))
    }

    async fn create_savepoint(&self, identifier: &str) -> Result<()> {
        self.savepoint_op(Event::Savepoint(self.connection.id, identifier.to_owned()))
    }

    async fn rollback_to(&self, identifier: &str) -> Result<()> {
        self.savepoint_op(Event::RollbackTo(self.connection.id, identifier.to_owned()))
    }

    async fn release_savepoint(&self, identifier: &str) -> Result<()> {
        self.savepoint_op(Event::ReleaseSavepoint(
            self.connection.id,
            identifier.to_owned(),
        ))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.connection.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn last_used_at(&self) -> Instant {
        *self.connection.last_used.lock()
    }
}
