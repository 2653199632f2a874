//! Transaction support.
//!
//! This module provides transaction isolation levels and the pooled
//! transaction types. A [`PooledTransaction`] owns a connection checked out
//! of the pool; [`NestedTransaction`]s are emulated with savepoints on the
//! same connection.
//!
//! A transaction with an open nested child is *busy*: its own statements and
//! further `begin_transaction` calls wait until the child (and every result
//! or statement derived from it) is finished. Waiters are served in the
//! order they arrived.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::driver::{Driver, TransactionExecutor};
use crate::error::{Error, Result};
use crate::release::ReleaseHandle;
use crate::result::PooledResult;
use crate::signal::Signal;
use crate::statement::PooledStatement;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ReadUncommitted,

    /// Read committed.
    ///
    /// Transactions can only read committed data. Prevents dirty reads
    /// but allows non-repeatable reads and phantom reads.
    #[default]
    ReadCommitted,

    /// Repeatable read.
    ///
    /// Rows read by a transaction don't change during the transaction.
    RepeatableRead,

    /// Serializable (highest isolation).
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL statement to set this isolation level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }

    /// Get the isolation level name as used in SQL.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open; statements may be issued.
    Active,
    /// Committed (or, for a nested transaction, savepoint released).
    Committed,
    /// Rolled back (or, for a nested transaction, rolled back to its savepoint).
    RolledBack,
}

impl TransactionState {
    fn ensure_active(self) -> Result<()> {
        match self {
            Self::Active => Ok(()),
            Self::Committed => Err(Error::Transaction(
                "the transaction has been committed".into(),
            )),
            Self::RolledBack => Err(Error::Transaction(
                "the transaction has been rolled back".into(),
            )),
        }
    }
}

struct Savepoint {
    identifier: String,
    parent_commit: Signal,
    parent_rollback: Signal,
}

/// State shared by the top-level and nested transaction handles.
struct TransactionCore<D: Driver> {
    executor: Arc<D::Transaction>,
    state: Mutex<TransactionState>,
    // Held by the open nested child, if any.
    busy: Arc<tokio::sync::Mutex<()>>,
    release: Mutex<Option<ReleaseHandle>>,
    // Prefix of child savepoint identifiers.
    identifier: String,
    savepoint: Option<Savepoint>,
    next_child: AtomicU64,
    on_close: Signal,
    on_commit: Signal,
    on_rollback: Signal,
}

impl<D: Driver> TransactionCore<D> {
    fn new(
        executor: Arc<D::Transaction>,
        release: ReleaseHandle,
        identifier: String,
        savepoint: Option<Savepoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            state: Mutex::new(TransactionState::Active),
            busy: Arc::new(tokio::sync::Mutex::new(())),
            release: Mutex::new(Some(release)),
            identifier,
            savepoint,
            next_child: AtomicU64::new(0),
            on_close: Signal::new(),
            on_commit: Signal::new(),
            on_rollback: Signal::new(),
        })
    }

    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn is_active(&self) -> bool {
        self.state() == TransactionState::Active && self.executor.is_active()
    }

    fn is_closed(&self) -> bool {
        self.state() != TransactionState::Active || self.executor.is_closed()
    }

    /// Wait until no nested child is open, then hand out a share of the
    /// release obligation for a derived resource.
    async fn ready(&self) -> Result<ReleaseHandle> {
        drop(self.busy.lock().await);
        self.state().ensure_active()?;
        self.release
            .lock()
            .clone()
            .ok_or_else(|| Error::Transaction("the transaction has been closed".into()))
    }

    async fn query(&self, sql: &str) -> Result<PooledResult<D>> {
        let release = self.ready().await?;
        let result = self.executor.query(sql).await?;
        Ok(PooledResult::new(result, release))
    }

    async fn execute(&self, sql: &str, params: D::Params) -> Result<PooledResult<D>> {
        let release = self.ready().await?;
        let result = self.executor.execute(sql, params).await?;
        Ok(PooledResult::new(result, release))
    }

    async fn prepare(&self, sql: &str) -> Result<PooledStatement<D>> {
        let release = self.ready().await?;
        let statement = self.executor.prepare(sql).await?;
        Ok(PooledStatement::with_busy_gate(
            statement,
            release,
            self.busy.clone(),
        ))
    }

    async fn begin_nested(&self) -> Result<NestedTransaction<D>> {
        let guard = self.busy.clone().lock_owned().await;
        self.state().ensure_active()?;
        let parent_release = self
            .release
            .lock()
            .clone()
            .ok_or_else(|| Error::Transaction("the transaction has been closed".into()))?;

        let ordinal = self.next_child.fetch_add(1, Ordering::Relaxed) + 1;
        let identifier = format!("{}_{}", self.identifier, ordinal);
        self.executor.create_savepoint(&identifier).await?;
        tracing::debug!(savepoint = %identifier, "created savepoint");

        Ok(NestedTransaction::new(
            self.executor.clone(),
            identifier,
            parent_release,
            guard,
            self.on_commit.clone(),
            self.on_rollback.clone(),
        ))
    }

    async fn finish(&self, commit: bool) -> Result<()> {
        drop(self.busy.lock().await);
        {
            let mut state = self.state.lock();
            state.ensure_active()?;
            *state = if commit {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            };
        }

        let outcome = match (&self.savepoint, commit) {
            (None, true) => self.executor.commit().await,
            (None, false) => self.executor.rollback().await,
            (Some(savepoint), true) => {
                tracing::debug!(savepoint = %savepoint.identifier, "releasing savepoint");
                self.executor.release_savepoint(&savepoint.identifier).await
            }
            (Some(savepoint), false) => {
                tracing::debug!(savepoint = %savepoint.identifier, "rolling back to savepoint");
                self.executor.rollback_to(&savepoint.identifier).await
            }
        };

        self.close(commit && outcome.is_ok());
        outcome
    }

    /// Drop this transaction's share of the connection and fire the hooks.
    fn close(&self, committed: bool) {
        drop(self.release.lock().take());

        if committed {
            match &self.savepoint {
                Some(savepoint) => {
                    let on_commit = self.on_commit.clone();
                    savepoint.parent_commit.subscribe(move || {
                        on_commit.complete();
                    });
                    let on_rollback = self.on_rollback.clone();
                    savepoint.parent_rollback.subscribe(move || {
                        on_rollback.complete();
                    });
                }
                None => {
                    self.on_commit.complete();
                }
            }
        } else {
            self.on_rollback.complete();
        }

        self.on_close.complete();
    }

    /// Best-effort rollback of a transaction that was dropped while open.
    fn abandon(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != TransactionState::Active {
                return;
            }
            *state = TransactionState::RolledBack;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    drop(self.busy.lock().await);
                    let outcome = match &self.savepoint {
                        Some(savepoint) => self.executor.rollback_to(&savepoint.identifier).await,
                        None => self.executor.rollback().await,
                    };
                    match outcome {
                        Ok(()) => tracing::debug!(
                            transaction = %self.identifier,
                            "rolled back abandoned transaction"
                        ),
                        Err(err) => tracing::debug!(
                            transaction = %self.identifier,
                            error = %err,
                            "rollback of abandoned transaction failed"
                        ),
                    }
                    self.close(false);
                });
            }
            Err(_) => {
                tracing::warn!(
                    transaction = %self.identifier,
                    "Tokio runtime unavailable while dropping an open transaction; \
                     releasing it without rollback"
                );
                self.close(false);
            }
        }
    }
}

/// A transaction running on a connection checked out of the pool.
///
/// The connection goes back to the pool once the transaction is committed or
/// rolled back and every result and statement derived from it is gone.
/// Dropping an open transaction schedules a best-effort rollback.
///
/// # Example
///
/// ```rust,ignore
/// let mut tx = pool.begin_transaction().await?;
/// tx.execute("INSERT INTO orders (customer_id) VALUES (?)", params).await?;
///
/// let mut items = tx.begin_transaction().await?;
/// items.execute("INSERT INTO items (order_id) VALUES (?)", params).await?;
/// items.rollback().await?; // keeps the order, drops the items
///
/// tx.commit().await?;
/// ```
pub struct PooledTransaction<D: Driver> {
    core: Arc<TransactionCore<D>>,
}

impl<D: Driver> PooledTransaction<D> {
    /// Wrap a driver transaction together with the release obligation of
    /// the connection it runs on.
    pub fn new(transaction: D::Transaction, release: ReleaseHandle) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            core: TransactionCore::new(Arc::new(transaction), release, format!("sp{id}"), None),
        }
    }

    /// Run a query inside the transaction.
    pub async fn query(&self, sql: &str) -> Result<PooledResult<D>> {
        self.core.query(sql).await
    }

    /// Run a parameterized query inside the transaction.
    pub async fn execute(&self, sql: &str, params: D::Params) -> Result<PooledResult<D>> {
        self.core.execute(sql, params).await
    }

    /// Prepare a statement inside the transaction.
    ///
    /// Executions of the statement wait while a nested transaction is open.
    pub async fn prepare(&self, sql: &str) -> Result<PooledStatement<D>> {
        self.core.prepare(sql).await
    }

    /// Open a nested transaction backed by a savepoint.
    ///
    /// Waits until any previously opened nested transaction is finished.
    pub async fn begin_transaction(&self) -> Result<NestedTransaction<D>> {
        self.core.begin_nested().await
    }

    /// Commit the transaction.
    ///
    /// Fails with [`Error::Transaction`] if it is no longer active.
    pub async fn commit(&mut self) -> Result<()> {
        self.core.finish(true).await
    }

    /// Roll back the transaction.
    ///
    /// Fails with [`Error::Transaction`] if it is no longer active.
    pub async fn rollback(&mut self) -> Result<()> {
        self.core.finish(false).await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.core.state()
    }

    /// Whether statements may still be issued.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Whether the transaction or its connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Isolation level the transaction was started with.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.core.executor.isolation()
    }

    /// When the transaction last ran anything.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.core.executor.last_used_at()
    }

    /// Savepoint backing this transaction; always `None` at the top level.
    #[must_use]
    pub fn savepoint_identifier(&self) -> Option<&str> {
        None
    }

    /// Register a callback run when the transaction commits or rolls back.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_close.subscribe(callback);
    }

    /// Register a callback run when the transaction commits.
    pub fn on_commit(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_commit.subscribe(callback);
    }

    /// Register a callback run when the transaction rolls back.
    pub fn on_rollback(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_rollback.subscribe(callback);
    }
}

impl<D: Driver> Drop for PooledTransaction<D> {
    fn drop(&mut self) {
        self.core.clone().abandon();
    }
}

impl<D: Driver> fmt::Debug for PooledTransaction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTransaction")
            .field("id", &self.core.identifier)
            .field("state", &self.state())
            .finish()
    }
}

/// A transaction nested in another one, backed by a savepoint.
///
/// Committing releases the savepoint, rolling back rolls back to it; either
/// way the enclosing transaction stays open and becomes available again once
/// this transaction and everything derived from it is finished.
pub struct NestedTransaction<D: Driver> {
    core: Arc<TransactionCore<D>>,
}

impl<D: Driver> NestedTransaction<D> {
    fn new(
        executor: Arc<D::Transaction>,
        identifier: String,
        parent_release: ReleaseHandle,
        parent_busy: OwnedMutexGuard<()>,
        parent_commit: Signal,
        parent_rollback: Signal,
    ) -> Self {
        let release = ReleaseHandle::new(move || {
            drop(parent_busy);
            drop(parent_release);
        });
        let savepoint = Savepoint {
            identifier: identifier.clone(),
            parent_commit,
            parent_rollback,
        };
        Self {
            core: TransactionCore::new(executor, release, identifier, Some(savepoint)),
        }
    }

    /// Run a query inside the nested transaction.
    pub async fn query(&self, sql: &str) -> Result<PooledResult<D>> {
        self.core.query(sql).await
    }

    /// Run a parameterized query inside the nested transaction.
    pub async fn execute(&self, sql: &str, params: D::Params) -> Result<PooledResult<D>> {
        self.core.execute(sql, params).await
    }

    /// Prepare a statement inside the nested transaction.
    pub async fn prepare(&self, sql: &str) -> Result<PooledStatement<D>> {
        self.core.prepare(sql).await
    }

    /// Open a further nested transaction.
    pub async fn begin_transaction(&self) -> Result<NestedTransaction<D>> {
        self.core.begin_nested().await
    }

    /// Release the savepoint, keeping the changes made since it was created.
    pub async fn commit(&mut self) -> Result<()> {
        self.core.finish(true).await
    }

    /// Roll back to the savepoint, discarding the changes made since it was
    /// created.
    pub async fn rollback(&mut self) -> Result<()> {
        self.core.finish(false).await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.core.state()
    }

    /// Whether statements may still be issued.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Whether the nested transaction or its connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Isolation level of the enclosing transaction.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.core.executor.isolation()
    }

    /// When the transaction last ran anything.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.core.executor.last_used_at()
    }

    /// Identifier of the savepoint backing this transaction.
    #[must_use]
    pub fn savepoint_identifier(&self) -> Option<&str> {
        self.core.savepoint.as_ref().map(|sp| sp.identifier.as_str())
    }

    /// Register a callback run when the nested transaction commits or rolls
    /// back.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_close.subscribe(callback);
    }

    /// Register a callback run once the changes are committed, i.e. when
    /// the enclosing transaction commits after this one.
    pub fn on_commit(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_commit.subscribe(callback);
    }

    /// Register a callback run when this transaction rolls back, or when an
    /// enclosing transaction rolls back after this one committed.
    pub fn on_rollback(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.on_rollback.subscribe(callback);
    }
}

impl<D: Driver> Drop for NestedTransaction<D> {
    fn drop(&mut self) {
        self.core.clone().abandon();
    }
}

impl<D: Driver> fmt::Debug for NestedTransaction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedTransaction")
            .field("savepoint", &self.core.identifier)
            .field("state", &self.state())
            .finish()
    }
}
