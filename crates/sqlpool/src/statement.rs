//! Pooled prepared statements.
//!
//! [`PooledStatement`] is a statement bound to one borrowed connection.
//! [`StatementPool`] is what [`ConnectionPool::prepare`](crate::ConnectionPool::prepare)
//! hands out: a pool-wide statement for one SQL text that executes on
//! whichever connection has a live prepared copy, preparing a new one when
//! none is cached.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::driver::{Driver, Statement};
use crate::error::{Error, Result};
use crate::release::ReleaseHandle;
use crate::result::PooledResult;
use crate::signal::Signal;

/// A prepared statement running on a borrowed connection.
///
/// The connection stays checked out until the statement is closed or
/// dropped *and* every result it produced has been consumed.
pub struct PooledStatement<D: Driver> {
    statement: D::Statement,
    release: Mutex<Option<ReleaseHandle>>,
    // Transaction busy gate, for statements prepared inside a transaction.
    busy: Option<Arc<tokio::sync::Mutex<()>>>,
    on_close: Signal,
}

impl<D: Driver> PooledStatement<D> {
    /// Wrap a driver statement together with the release obligation of the
    /// connection it was prepared on.
    pub fn new(statement: D::Statement, release: ReleaseHandle) -> Self {
        Self {
            statement,
            release: Mutex::new(Some(release)),
            busy: None,
            on_close: Signal::new(),
        }
    }

    pub(crate) fn with_busy_gate(
        statement: D::Statement,
        release: ReleaseHandle,
        busy: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            statement,
            release: Mutex::new(Some(release)),
            busy: Some(busy),
            on_close: Signal::new(),
        }
    }

    /// Execute the statement.
    ///
    /// Fails with [`Error::StatementClosed`] after [`close`](Self::close).
    pub async fn execute(&self, params: D::Params) -> Result<PooledResult<D>> {
        let (result, release) = self.execute_raw(params).await?;
        Ok(PooledResult::new(result, release))
    }

    pub(crate) async fn execute_raw(
        &self,
        params: D::Params,
    ) -> Result<(D::ResultSet, ReleaseHandle)> {
        let release = self.release.lock().clone().ok_or(Error::StatementClosed)?;

        if let Some(busy) = &self.busy {
            drop(busy.lock().await);
        }

        let result = self.statement.execute(params).await?;
        Ok((result, release))
    }

    /// Close the statement.
    ///
    /// Results already produced keep the connection until they are consumed.
    pub async fn close(&self) {
        drop(self.release.lock().take());
        self.statement.close().await;
        self.on_close.complete();
    }

    /// Whether the statement has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.release.lock().is_none() || self.statement.is_closed()
    }

    /// SQL text the statement was prepared from.
    #[must_use]
    pub fn query(&self) -> &str {
        self.statement.query()
    }

    /// When the statement was last executed.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.statement.last_used_at()
    }

    /// Register a callback run when the statement is closed or dropped.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.on_close.subscribe(callback);
    }
}

impl<D: Driver> Drop for PooledStatement<D> {
    fn drop(&mut self) {
        drop(self.release.get_mut().take());
        self.on_close.complete();
    }
}

impl<D: Driver> fmt::Debug for PooledStatement<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStatement")
            .field("query", &self.query())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What a [`StatementPool`] needs from the connection pool that owns it.
#[async_trait]
pub(crate) trait StatementSource<D: Driver>: Send + Sync + 'static {
    /// Prepare `sql` on a connection checked out of the pool.
    async fn prepare_statement(self: Arc<Self>, sql: &str) -> Result<PooledStatement<D>>;

    fn max_connections(&self) -> usize;

    fn connection_count(&self) -> usize;

    fn idle_connection_count(&self) -> usize;

    /// Idle time after which cached statements are dropped.
    fn statement_idle_timeout(&self) -> Duration;

    fn reap_interval(&self) -> Duration;
}

struct Shared<D: Driver> {
    sql: String,
    source: Arc<dyn StatementSource<D>>,
    statements: Mutex<VecDeque<PooledStatement<D>>>,
    last_used_at: Mutex<Instant>,
    closed: Signal,
}

impl<D: Driver> Shared<D> {
    async fn pop(&self) -> Result<PooledStatement<D>> {
        loop {
            let next = self.statements.lock().pop_front();
            match next {
                Some(statement) if !statement.is_closed() => return Ok(statement),
                Some(closed) => drop(closed),
                None => break,
            }
        }

        self.source.clone().prepare_statement(&self.sql).await
    }

    /// Cache `statement` for reuse, unless this SQL text already holds
    /// more than a tenth of the pool or the pool has no connection to spare.
    fn push(&self, statement: PooledStatement<D>) {
        if self.closed.is_complete() || statement.is_closed() {
            return;
        }

        let max = self.source.max_connections();
        let mut statements = self.statements.lock();

        if statements.len() > max / 10 {
            return;
        }

        if self.source.connection_count() == max && self.source.idle_connection_count() == 0 {
            return;
        }

        statements.push_back(statement);
    }

    fn evict_idle(&self, now: Instant, timeout: Duration) -> Vec<PooledStatement<D>> {
        let mut statements = self.statements.lock();
        let mut evicted = Vec::new();

        while let Some(statement) = statements.front() {
            if statement.last_used_at() + timeout > now {
                break;
            }
            if let Some(statement) = statements.pop_front() {
                evicted.push(statement);
            }
        }

        evicted
    }

    fn clear(&self) {
        let statements = std::mem::take(&mut *self.statements.lock());
        drop(statements);
    }
}

/// A prepared statement that lives as long as the pool it came from.
///
/// Each execution runs on a cached prepared copy if one is available, or
/// prepares the SQL on a connection from the pool otherwise. Copies are
/// cached only while they take up a small share of the pool, and are
/// dropped after a tenth of the pool's idle timeout (at least one second)
/// without use.
///
/// The statement closes when the pool closes.
pub struct StatementPool<D: Driver> {
    shared: Arc<Shared<D>>,
    reaper: AbortHandle,
}

impl<D: Driver> StatementPool<D> {
    pub(crate) fn new(
        source: Arc<dyn StatementSource<D>>,
        sql: String,
        seed: PooledStatement<D>,
        pool_closed: &Signal,
    ) -> Self {
        let period = source.reap_interval();
        let shared = Arc::new(Shared {
            sql,
            source,
            statements: Mutex::new(VecDeque::new()),
            last_used_at: Mutex::new(Instant::now()),
            closed: Signal::new(),
        });

        let reaper =
            tokio::spawn(reap_idle_statements(Arc::downgrade(&shared), period)).abort_handle();

        {
            let reaper = reaper.clone();
            let weak = Arc::downgrade(&shared);
            shared.closed.subscribe(move || {
                reaper.abort();
                if let Some(shared) = weak.upgrade() {
                    shared.clear();
                }
            });
        }

        pool_closed.forward_to(&shared.closed);
        shared.push(seed);

        Self { shared, reaper }
    }

    /// Execute the statement on any connection of the pool.
    ///
    /// Fails with [`Error::StatementClosed`] once the statement or its pool
    /// has been closed.
    pub async fn execute(&self, params: D::Params) -> Result<PooledResult<D>> {
        if self.is_closed() {
            return Err(Error::StatementClosed);
        }

        *self.shared.last_used_at.lock() = Instant::now();

        let statement = self.shared.pop().await?;
        let (result, statement_release) = match statement.execute_raw(params).await {
            Ok(executed) => executed,
            Err(err) => {
                self.shared.push(statement);
                return Err(err);
            }
        };

        let shared = Arc::downgrade(&self.shared);
        let release = ReleaseHandle::new(move || {
            drop(statement_release);
            if let Some(shared) = shared.upgrade() {
                shared.push(statement);
            }
        });

        Ok(PooledResult::new(result, release))
    }

    /// Close the statement and drop every cached copy.
    pub fn close(&self) {
        self.shared.closed.complete();
    }

    /// Whether the statement or its pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_complete()
    }

    /// SQL text of the statement.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.shared.sql
    }

    /// When the statement was last executed.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        *self.shared.last_used_at.lock()
    }

    /// Number of prepared copies currently cached.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.shared.statements.lock().len()
    }

    /// Register a callback run when the statement closes.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.closed.subscribe(callback);
    }
}

impl<D: Driver> Drop for StatementPool<D> {
    fn drop(&mut self) {
        self.reaper.abort();
        self.close();
    }
}

impl<D: Driver> fmt::Debug for StatementPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementPool")
            .field("query", &self.query())
            .field("cached", &self.cached_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn reap_idle_statements<D: Driver>(shared: Weak<Shared<D>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.closed.is_complete() {
            break;
        }

        let evicted = shared.evict_idle(Instant::now(), shared.source.statement_idle_timeout());
        if !evicted.is_empty() {
            tracing::debug!(
                query = %shared.sql,
                count = evicted.len(),
                "dropping idle prepared statements"
            );
        }
    }
}
