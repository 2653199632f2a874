//! Transactions, savepoint-backed nested transactions and their hooks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlpool::{
    ConnectionConfig, ConnectionPool, Error, IsolationLevel, PoolConfig, TransactionState,
};
use sqlpool_testing::{Event, StubConnector, StubDriver, StubResponse};
use tokio_test::{assert_pending, assert_ready, task};

fn pool(connector: &StubConnector) -> ConnectionPool<StubDriver> {
    ConnectionPool::new(
        ConnectionConfig::new("localhost", 5432),
        PoolConfig::new().max_connections(2),
        connector.clone(),
    )
    .unwrap()
}

fn connector() -> StubConnector {
    StubConnector::builder()
        .with_default_response(StubResponse::affected(1))
        .build()
}

/// Counts how often a hook fired.
#[derive(Clone, Default)]
struct Hook(Arc<AtomicUsize>);

impl Hook {
    fn callback(&self) -> impl FnOnce() + Send + 'static {
        let count = self.0.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fired(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Top-level Transactions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_commit_returns_connection() {
    let connector = connector();
    let pool = pool(&connector);

    let mut tx = pool.begin_transaction().await.unwrap();
    assert!(tx.is_active());
    assert_eq!(tx.state(), TransactionState::Active);
    assert_eq!(tx.savepoint_identifier(), None);
    assert_eq!(pool.status().in_use, 1);

    tx.execute("INSERT INTO t VALUES (?)", vec![1_i64.into()])
        .await
        .unwrap()
        .dispose()
        .await;
    tx.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(!tx.is_active());
    assert!(tx.is_closed());
    assert_eq!(pool.idle_connection_count(), 1);
    assert_eq!(connector.events().count(|e| matches!(e, Event::Commit(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_returns_connection() {
    let connector = connector();
    let pool = pool(&connector);

    let mut tx = pool.begin_transaction().await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(pool.idle_connection_count(), 1);
    assert_eq!(
        connector.events().count(|e| matches!(e, Event::Rollback(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_transaction_rejects_operations() {
    let connector = connector();
    let pool = pool(&connector);

    let mut tx = pool.begin_transaction().await.unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(err.is_transaction_state());
    let err = tx.rollback().await.unwrap_err();
    assert!(matches!(err, Error::Transaction(ref message) if message.contains("committed")));

    assert!(tx.query("SELECT 1").await.unwrap_err().is_transaction_state());
    assert!(
        tx.execute("SELECT 1", vec![])
            .await
            .unwrap_err()
            .is_transaction_state()
    );
    assert!(tx.prepare("SELECT 1").await.unwrap_err().is_transaction_state());
    assert!(tx.begin_transaction().await.unwrap_err().is_transaction_state());

    let mut tx = pool.begin_transaction().await.unwrap();
    tx.rollback().await.unwrap();
    let err = tx.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Transaction(ref message) if message.contains("rolled back")));
}

#[tokio::test(start_paused = true)]
async fn test_results_keep_connection_after_commit() {
    let connector = StubConnector::builder()
        .with_default_response(StubResponse::column("n", 1..=2))
        .build();
    let pool = pool(&connector);

    let mut tx = pool.begin_transaction().await.unwrap();
    let mut result = tx.query("SELECT n FROM numbers").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(pool.idle_connection_count(), 0);

    assert_eq!(result.collect_all().await.unwrap().len(), 2);
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_transaction_is_rolled_back() {
    let connector = connector();
    let pool = pool(&connector);

    let tx = pool.begin_transaction().await.unwrap();
    let rolled_back = Hook::default();
    tx.on_rollback(rolled_back.callback());
    drop(tx);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
        connector.events().count(|e| matches!(e, Event::Rollback(_))),
        1
    );
    assert_eq!(rolled_back.fired(), 1);
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transaction_uses_pool_isolation() {
    let connector = connector();
    let pool = ConnectionPool::new(
        ConnectionConfig::new("localhost", 5432),
        PoolConfig::new().transaction_isolation(IsolationLevel::RepeatableRead),
        connector.clone(),
    )
    .unwrap();

    let mut tx = pool.begin_transaction().await.unwrap();
    assert_eq!(tx.isolation(), IsolationLevel::RepeatableRead);
    tx.rollback().await.unwrap();

    assert_eq!(
        connector.events().filter(|e| matches!(e, Event::Begin(..))),
        vec![Event::Begin(1, IsolationLevel::RepeatableRead)]
    );
}

// =============================================================================
// Nested Transactions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_nested_transactions_run_one_at_a_time() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let mut first = tx.begin_transaction().await.unwrap();
    let mut begin_second = task::spawn(tx.begin_transaction());
    let mut begin_third = task::spawn(tx.begin_transaction());
    assert_pending!(begin_second.poll());
    assert_pending!(begin_third.poll());

    first.commit().await.unwrap();
    assert!(begin_second.is_woken());
    let mut second = assert_ready!(begin_second.poll()).unwrap();
    assert_pending!(begin_third.poll());

    second.rollback().await.unwrap();
    assert!(begin_third.is_woken());
    let mut third = assert_ready!(begin_third.poll()).unwrap();
    third.commit().await.unwrap();
    drop((begin_second, begin_third));

    let savepoints = connector.events().savepoints();
    assert_eq!(savepoints.len(), 3);
    assert_eq!(savepoints[0], first.savepoint_identifier().unwrap());
    assert_eq!(savepoints[1], second.savepoint_identifier().unwrap());
    assert_eq!(savepoints[2], third.savepoint_identifier().unwrap());
    assert_ne!(savepoints[0], savepoints[1]);
    assert_ne!(savepoints[1], savepoints[2]);

    let events = connector.events();
    assert!(
        events
            .snapshot()
            .contains(&Event::ReleaseSavepoint(1, savepoints[0].clone()))
    );
    assert!(
        events
            .snapshot()
            .contains(&Event::RollbackTo(1, savepoints[1].clone()))
    );
    assert!(
        events
            .snapshot()
            .contains(&Event::ReleaseSavepoint(1, savepoints[2].clone()))
    );

    drop((first, second, third));
    tx.commit().await.unwrap();
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parent_waits_for_nested_transaction() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let mut nested = tx.begin_transaction().await.unwrap();
    nested.query("UPDATE t SET x = 1").await.unwrap().dispose().await;

    let mut query = task::spawn(tx.query("SELECT 1"));
    assert_pending!(query.poll());

    nested.rollback().await.unwrap();
    assert!(query.is_woken());
    assert_ready!(query.poll()).unwrap().dispose().await;
    drop(query);

    assert_eq!(nested.state(), TransactionState::RolledBack);
    assert_eq!(tx.state(), TransactionState::Active);
    tx.commit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_nested_result_holds_parent() {
    let connector = StubConnector::builder()
        .with_default_response(StubResponse::column("n", 1..=2))
        .build();
    let pool = pool(&connector);
    let tx = pool.begin_transaction().await.unwrap();

    let mut nested = tx.begin_transaction().await.unwrap();
    let mut result = nested.query("SELECT n FROM numbers").await.unwrap();
    nested.commit().await.unwrap();

    let mut query = task::spawn(tx.query("SELECT 1"));
    assert_pending!(query.poll());

    assert_eq!(result.collect_all().await.unwrap().len(), 2);
    assert!(query.is_woken());
    assert!(assert_ready!(query.poll()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_grandchild_savepoint_identifiers() {
    let connector = connector();
    let pool = pool(&connector);
    let tx = pool.begin_transaction().await.unwrap();

    let child = tx.begin_transaction().await.unwrap();
    let grandchild = child.begin_transaction().await.unwrap();

    let child_id = child.savepoint_identifier().unwrap().to_owned();
    let grandchild_id = grandchild.savepoint_identifier().unwrap();
    assert!(grandchild_id.starts_with(&format!("{child_id}_")));
    assert_eq!(
        connector.events().savepoints(),
        vec![child_id.clone(), grandchild_id.to_owned()]
    );

    // Each transaction numbers its own children.
    let other = pool.begin_transaction().await.unwrap();
    let other_child = other.begin_transaction().await.unwrap();
    assert_ne!(other_child.savepoint_identifier().unwrap(), child_id);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_nested_transaction_rolls_back_to_savepoint() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let nested = tx.begin_transaction().await.unwrap();
    let savepoint = nested.savepoint_identifier().unwrap().to_owned();
    drop(nested);

    // The parent becomes usable once the background rollback is done.
    tx.query("SELECT 1").await.unwrap().dispose().await;
    assert!(
        connector
            .events()
            .snapshot()
            .contains(&Event::RollbackTo(1, savepoint))
    );

    tx.commit().await.unwrap();
    assert_eq!(
        connector.events().count(|e| matches!(e, Event::Rollback(_))),
        0
    );
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_top_level_hooks() {
    let connector = connector();
    let pool = pool(&connector);

    let mut tx = pool.begin_transaction().await.unwrap();
    let (closed, committed, rolled_back) = (Hook::default(), Hook::default(), Hook::default());
    tx.on_close(closed.callback());
    tx.on_commit(committed.callback());
    tx.on_rollback(rolled_back.callback());

    tx.commit().await.unwrap();
    assert_eq!(closed.fired(), 1);
    assert_eq!(committed.fired(), 1);
    assert_eq!(rolled_back.fired(), 0);

    // Hooks registered after the fact run right away.
    let late = Hook::default();
    tx.on_close(late.callback());
    assert_eq!(late.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_nested_commit_waits_for_parent_commit() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let mut nested = tx.begin_transaction().await.unwrap();
    let (closed, committed, rolled_back) = (Hook::default(), Hook::default(), Hook::default());
    nested.on_close(closed.callback());
    nested.on_commit(committed.callback());
    nested.on_rollback(rolled_back.callback());

    nested.commit().await.unwrap();
    assert_eq!(closed.fired(), 1);
    assert_eq!(committed.fired(), 0);

    tx.commit().await.unwrap();
    assert_eq!(committed.fired(), 1);
    assert_eq!(rolled_back.fired(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nested_commit_undone_by_parent_rollback() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let mut child = tx.begin_transaction().await.unwrap();
    let mut grandchild = child.begin_transaction().await.unwrap();
    let (committed, rolled_back) = (Hook::default(), Hook::default());
    grandchild.on_commit(committed.callback());
    grandchild.on_rollback(rolled_back.callback());

    grandchild.commit().await.unwrap();
    child.commit().await.unwrap();
    assert_eq!(rolled_back.fired(), 0);

    tx.rollback().await.unwrap();
    assert_eq!(committed.fired(), 0);
    assert_eq!(rolled_back.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_nested_rollback_fires_immediately() {
    let connector = connector();
    let pool = pool(&connector);
    let mut tx = pool.begin_transaction().await.unwrap();

    let mut nested = tx.begin_transaction().await.unwrap();
    let (committed, rolled_back) = (Hook::default(), Hook::default());
    nested.on_commit(committed.callback());
    nested.on_rollback(rolled_back.callback());

    nested.rollback().await.unwrap();
    assert_eq!(rolled_back.fired(), 1);

    tx.commit().await.unwrap();
    assert_eq!(committed.fired(), 0);
    assert_eq!(rolled_back.fired(), 1);
}
