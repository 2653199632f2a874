//! Connection pool implementation.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::{ConnectionConfig, PoolConfig};
use crate::driver::{Connection, Connector, Driver};
use crate::error::{Error, Result};
use crate::release::ReleaseHandle;
use crate::result::PooledResult;
use crate::signal::Signal;
use crate::statement::{PooledStatement, StatementPool, StatementSource};
use crate::transaction::{IsolationLevel, PooledTransaction};

type ConnectionId = u64;

struct PoolState<D: Driver> {
    connections: HashMap<ConnectionId, Arc<D::Connection>>,
    // Oldest release first.
    idle: VecDeque<(ConnectionId, Arc<D::Connection>)>,
    waiter: Option<oneshot::Sender<Result<()>>>,
    closed: bool,
}

enum Acquire<D: Driver> {
    Ready(ConnectionId, Arc<D::Connection>),
    Connect,
    Wait(oneshot::Receiver<Result<()>>),
}

struct PoolInner<D: Driver> {
    connector: Box<dyn Connector<D>>,
    connection_config: ConnectionConfig,
    config: PoolConfig,
    isolation: Mutex<IsolationLevel>,
    state: Mutex<PoolState<D>>,
    // Single-flight gate for "connect or wait".
    acquire: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    on_close: Signal,
    reaper: Mutex<Option<AbortHandle>>,
}

impl<D: Driver> PoolInner<D> {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn pop(self: &Arc<Self>) -> Result<(ConnectionId, Arc<D::Connection>)> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let _gate = self.acquire.lock().await;

        loop {
            let next: Acquire<D> = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }

                match state.idle.pop_front() {
                    Some((id, connection)) if !connection.is_closed() => {
                        Acquire::Ready(id, connection)
                    }
                    Some((id, _)) => {
                        state.connections.remove(&id);
                        tracing::debug!(connection = id, "discarding dead idle connection");
                        continue;
                    }
                    None if state.connections.len() < self.config.max_connections as usize => {
                        Acquire::Connect
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiter = Some(tx);
                        Acquire::Wait(rx)
                    }
                }
            };

            match next {
                Acquire::Ready(id, connection) => {
                    tracing::trace!(connection = id, "acquired idle connection");
                    return Ok((id, connection));
                }
                Acquire::Connect => return self.connect().await,
                Acquire::Wait(rx) => {
                    tracing::trace!("all connections busy, waiting for release");
                    match rx.await {
                        Ok(Ok(())) => continue,
                        Ok(Err(err)) => return Err(err),
                        Err(_) => return Err(Error::PoolClosed),
                    }
                }
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(ConnectionId, Arc<D::Connection>)> {
        tracing::debug!(server = %self.connection_config.target(), "opening new connection");
        let connection = Arc::new(self.connector.connect(&self.connection_config).await?);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let added = {
            let mut state = self.state.lock();
            if !state.closed {
                state.connections.insert(id, connection.clone());
                tracing::debug!(
                    connection = id,
                    total = state.connections.len(),
                    "connection added to pool"
                );
            }
            !state.closed
        };

        if !added {
            connection.close().await;
            return Err(Error::PoolClosed);
        }

        let pool = Arc::downgrade(self);
        connection.on_close(Box::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.forget(id);
            }
        }));

        Ok((id, connection))
    }

    /// Stop tracking a connection that closed, freeing its slot.
    fn forget(&self, id: ConnectionId) {
        let waiter = {
            let mut state = self.state.lock();
            if state.connections.remove(&id).is_none() {
                return;
            }
            state.idle.retain(|(idle, _)| *idle != id);
            tracing::debug!(
                connection = id,
                total = state.connections.len(),
                "closed connection removed from pool"
            );
            state.waiter.take()
        };

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    fn push(&self, id: ConnectionId, connection: Arc<D::Connection>) {
        let waiter = {
            let mut state = self.state.lock();
            if !state.connections.contains_key(&id) {
                tracing::trace!(connection = id, "released connection is no longer tracked");
                return;
            }

            if state.closed || connection.is_closed() {
                state.connections.remove(&id);
                tracing::trace!(connection = id, "released connection removed from pool");
            } else {
                state.idle.push_back((id, connection));
                tracing::trace!(connection = id, "connection returned to pool");
            }

            state.waiter.take()
        };

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Release obligation returning `connection` to the pool.
    fn checkout(
        self: &Arc<Self>,
        id: ConnectionId,
        connection: Arc<D::Connection>,
    ) -> ReleaseHandle {
        let pool = Arc::downgrade(self);
        ReleaseHandle::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.push(id, connection);
            }
        })
    }

    fn close(&self) {
        let (connections, waiter) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let connections: Vec<_> = state.connections.values().cloned().collect();
            for (id, _) in std::mem::take(&mut state.idle) {
                state.connections.remove(&id);
            }
            (connections, state.waiter.take())
        };

        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(Error::PoolClosed));
        }

        tracing::info!(closing = connections.len(), "connection pool closed");
        close_connections::<D>(connections);

        self.on_close.complete();
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let total = state.connections.len();
        let available = state.idle.len();
        PoolStatus {
            available: available as u32,
            in_use: total.saturating_sub(available) as u32,
            total: total as u32,
            max: self.config.max_connections,
        }
    }

    /// Evict idle connections unused for `idle_timeout`, oldest first.
    fn evict_idle(&self, now: Instant) -> Vec<Arc<D::Connection>> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();

        while let Some((id, connection)) = state.idle.front() {
            if connection.last_used_at() + self.config.idle_timeout > now {
                break;
            }
            let id = *id;
            state.idle.pop_front();
            if let Some(connection) = state.connections.remove(&id) {
                tracing::debug!(connection = id, "evicting idle connection");
                evicted.push(connection);
            }
        }

        evicted
    }
}

#[async_trait]
impl<D: Driver> StatementSource<D> for PoolInner<D> {
    async fn prepare_statement(self: Arc<Self>, sql: &str) -> Result<PooledStatement<D>> {
        let (id, connection) = self.pop().await?;
        let release = self.checkout(id, connection.clone());
        let statement = connection.prepare(sql).await?;
        Ok(PooledStatement::new(statement, release))
    }

    fn max_connections(&self) -> usize {
        self.config.max_connections as usize
    }

    fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    fn idle_connection_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn statement_idle_timeout(&self) -> Duration {
        self.config.statement_idle_timeout()
    }

    fn reap_interval(&self) -> Duration {
        self.config.reap_interval
    }
}

fn close_connections<D: Driver>(connections: Vec<Arc<D::Connection>>) {
    if connections.is_empty() {
        return;
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for connection in connections {
                    connection.close().await;
                }
            });
        }
        Err(_) => {
            tracing::warn!(
                count = connections.len(),
                "Tokio runtime unavailable; dropping pooled connections without closing them"
            );
        }
    }
}

async fn reap_idle_connections<D: Driver>(pool: Weak<PoolInner<D>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }

        let evicted = inner.evict_idle(Instant::now());
        drop(inner);

        for connection in evicted {
            connection.close().await;
        }
    }
}

/// A bounded pool of database connections.
///
/// Every operation checks a connection out of the pool, runs on it, and
/// hands back a wrapper ([`PooledResult`], [`StatementPool`],
/// [`PooledTransaction`]) that returns the connection once it and everything
/// derived from it is finished.
///
/// New connections are opened on demand up to
/// [`PoolConfig::max_connections`]; beyond that, callers wait for a
/// connection to be released. Connections idle for longer than
/// [`PoolConfig::idle_timeout`] are closed by a background reaper.
///
/// Dropping the pool closes it.
///
/// # Example
///
/// ```rust,ignore
/// use sqlpool::{ConnectionConfig, ConnectionPool, PoolConfig};
///
/// let pool = ConnectionPool::new(
///     ConnectionConfig::new("localhost", 5432).user("app"),
///     PoolConfig::new().max_connections(20),
///     PgConnector::default(),
/// )?;
///
/// let mut result = pool.query("SELECT id, name FROM users").await?;
/// while let Some(row) = result.next_row().await? {
///     println!("{row:?}");
/// }
/// ```
pub struct ConnectionPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> ConnectionPool<D> {
    /// Create a pool.
    ///
    /// No connection is opened until the first operation. Must be called
    /// from within a Tokio runtime, which runs the idle reaper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid or no Tokio
    /// runtime is available.
    pub fn new(
        connection_config: ConnectionConfig,
        config: PoolConfig,
        connector: impl Connector<D>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Configuration("a Tokio runtime is required to run the connection pool".into())
        })?;

        let inner = Arc::new(PoolInner {
            connector: Box::new(connector),
            connection_config,
            isolation: Mutex::new(config.transaction_isolation),
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                idle: VecDeque::new(),
                waiter: None,
                closed: false,
            }),
            acquire: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            on_close: Signal::new(),
            reaper: Mutex::new(None),
            config,
        });

        let reaper = runtime
            .spawn(reap_idle_connections(
                Arc::downgrade(&inner),
                inner.config.reap_interval,
            ))
            .abort_handle();
        *inner.reaper.lock() = Some(reaper);

        tracing::debug!(
            max_connections = inner.config.max_connections,
            idle_timeout = ?inner.config.idle_timeout,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Run a query on a pooled connection.
    ///
    /// The connection is returned to the pool once the result chain has been
    /// consumed or dropped. Errors are returned unchanged after the
    /// connection has been released.
    pub async fn query(&self, sql: &str) -> Result<PooledResult<D>> {
        let (id, connection) = self.inner.pop().await?;
        let release = self.inner.checkout(id, connection.clone());
        let result = connection.query(sql).await?;
        Ok(PooledResult::new(result, release))
    }

    /// Run a parameterized query on a pooled connection.
    pub async fn execute(&self, sql: &str, params: D::Params) -> Result<PooledResult<D>> {
        let (id, connection) = self.inner.pop().await?;
        let release = self.inner.checkout(id, connection.clone());
        let result = connection.execute(sql, params).await?;
        Ok(PooledResult::new(result, release))
    }

    /// Prepare a statement usable on any connection of the pool.
    ///
    /// The SQL is prepared once right away so that errors surface here;
    /// later executions reuse cached copies or prepare new ones as needed.
    pub async fn prepare(&self, sql: &str) -> Result<StatementPool<D>> {
        let seed = self.inner.clone().prepare_statement(sql).await?;
        let source: Arc<dyn StatementSource<D>> = self.inner.clone();
        Ok(StatementPool::new(
            source,
            sql.to_owned(),
            seed,
            &self.inner.on_close,
        ))
    }

    /// Start a transaction at the pool's current isolation level.
    ///
    /// The connection stays checked out until the transaction is committed
    /// or rolled back.
    pub async fn begin_transaction(&self) -> Result<PooledTransaction<D>> {
        let isolation = self.transaction_isolation();
        let (id, connection) = self.inner.pop().await?;
        let release = self.inner.checkout(id, connection.clone());
        let transaction = connection.begin_transaction(isolation).await?;
        Ok(PooledTransaction::new(transaction, release))
    }

    /// Remove a connection from the pool and hand it to the caller.
    ///
    /// The connection no longer counts towards the pool's limit and is not
    /// closed when the pool closes.
    pub async fn extract_connection(&self) -> Result<Arc<D::Connection>> {
        let (id, connection) = self.inner.pop().await?;
        self.inner.state.lock().connections.remove(&id);
        tracing::debug!(connection = id, "connection extracted from pool");
        Ok(connection)
    }

    /// Close the pool.
    ///
    /// Every connection is closed in the background, pending waiters fail
    /// with [`Error::PoolClosed`] and so does every later operation.
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Register a callback run when the pool closes.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.on_close.subscribe(callback);
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Number of connections the pool currently tracks.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_connection_count(&self) -> usize {
        self.inner.idle_connection_count()
    }

    /// Maximum number of connections.
    #[must_use]
    pub fn connection_limit(&self) -> u32 {
        self.inner.config.max_connections
    }

    /// Time a connection may stay idle before it is closed.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout
    }

    /// Most recent use of any connection, if the pool has any.
    #[must_use]
    pub fn last_used_at(&self) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .connections
            .values()
            .map(|connection| connection.last_used_at())
            .max()
    }

    /// Isolation level used by [`begin_transaction`](Self::begin_transaction).
    #[must_use]
    pub fn transaction_isolation(&self) -> IsolationLevel {
        *self.inner.isolation.lock()
    }

    /// Change the isolation level used by later transactions.
    pub fn set_transaction_isolation(&self, isolation: IsolationLevel) {
        *self.inner.isolation.lock() = isolation;
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Parameters passed to the connector.
    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.inner.connection_config
    }
}

impl<D: Driver> Drop for ConnectionPool<D> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<D: Driver> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server", &self.inner.connection_config.target())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}
