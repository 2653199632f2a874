//! Pooled result chains and when they give their connection back.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use futures_util::TryStreamExt;
use sqlpool::{ConnectionConfig, ConnectionPool, Error, PoolConfig};
use sqlpool_testing::{ScalarValue, StubConnector, StubDriver, StubResponse};

fn pool(connector: &StubConnector) -> ConnectionPool<StubDriver> {
    ConnectionPool::new(
        ConnectionConfig::new("localhost", 5432),
        PoolConfig::new().max_connections(2),
        connector.clone(),
    )
    .unwrap()
}

fn chained_connector() -> StubConnector {
    StubConnector::builder()
        .with_response(
            "CALL report()",
            StubResponse::chain([
                StubResponse::column("id", [1, 2]),
                StubResponse::affected(5),
                StubResponse::column("total", [42]),
            ]),
        )
        .with_response("SELECT bad", StubResponse::error("no such column"))
        .with_response(
            "SELECT partial",
            StubResponse::chain([
                StubResponse::scalar(1),
                StubResponse::error("division by zero"),
            ]),
        )
        .with_default_response(StubResponse::column("n", 1..=3))
        .build()
}

// =============================================================================
// Chains
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_chain_releases_after_last_result() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let mut first = pool.query("CALL report()").await.unwrap();
    assert_eq!(first.collect_all().await.unwrap().len(), 2);
    assert!(!first.holds_connection());
    assert_eq!(pool.idle_connection_count(), 0);

    let mut second = first.next_result().await.unwrap().unwrap();
    assert_eq!(second.row_count(), Some(5));
    assert_eq!(second.column_count(), None);
    assert!(second.collect_all().await.unwrap().is_empty());
    assert_eq!(pool.idle_connection_count(), 0);

    let mut third = second.next_result().await.unwrap().unwrap();
    let rows = third.collect_all().await.unwrap();
    assert_eq!(rows[0]["total"], ScalarValue::Int(42));

    assert!(!third.holds_connection());
    assert_eq!(pool.idle_connection_count(), 1);
    assert!(third.next_result().await.unwrap().is_none());

    // Asking again does not release twice.
    assert!(first.next_result().await.unwrap().is_none());
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_next_result_skips_unread_rows() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let mut first = pool.query("CALL report()").await.unwrap();
    let mut second = first.next_result().await.unwrap().unwrap();
    assert_eq!(second.row_count(), Some(5));

    let third = second.next_result().await.unwrap().unwrap();
    assert_eq!(third.column_count(), Some(1));
    third.dispose().await;
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_next_result_releases_connection() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let mut result = pool.query("SELECT partial").await.unwrap();
    assert_eq!(result.collect_all().await.unwrap().len(), 1);
    assert_eq!(pool.idle_connection_count(), 1);

    let err = result.next_result().await.unwrap_err();
    assert!(matches!(err, Error::Query(ref message) if message == "division by zero"));
    assert!(result.next_result().await.unwrap().is_none());
}

// =============================================================================
// Release
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dropped_result_is_drained_and_released() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let result = pool.query("CALL report()").await.unwrap();
    assert!(result.holds_connection());
    drop(result);
    assert_eq!(pool.idle_connection_count(), 0);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(pool.idle_connection_count(), 1);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_releases_whole_chain() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let mut first = pool.query("CALL report()").await.unwrap();
    assert!(first.next_row().await.unwrap().is_some());
    first.dispose().await;

    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_of_fetched_chain() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let mut first = pool.query("CALL report()").await.unwrap();
    first.collect_all().await.unwrap();
    // The next set now holds the connection; disposing the head reaches it.
    first.dispose().await;

    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_error_releases_connection() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let err = pool.query("SELECT bad").await.unwrap_err();
    assert!(matches!(err, Error::Query(_)));
    assert_eq!(pool.status().available, 1);
    assert_eq!(pool.status().in_use, 0);
}

// =============================================================================
// Rows
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rows_stream() {
    let connector = chained_connector();
    let pool = pool(&connector);

    let result = pool.query("SELECT n FROM numbers").await.unwrap();
    assert_eq!(result.row_count(), Some(3));
    assert_eq!(result.column_count(), Some(1));

    let rows: Vec<_> = result.into_stream().try_collect().await.unwrap();
    let values: Vec<_> = rows.iter().map(|row| row["n"].clone()).collect();
    assert_eq!(
        values,
        vec![ScalarValue::Int(1), ScalarValue::Int(2), ScalarValue::Int(3)]
    );
    assert_eq!(pool.idle_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_passes_params() {
    let connector = StubConnector::builder()
        .with_default_response(StubResponse::custom(|_, params| {
            StubResponse::affected(params.len() as u64)
        }))
        .build();
    let pool = pool(&connector);

    let result = pool
        .execute(
            "UPDATE users SET name = ? WHERE id = ?",
            vec!["Alice".into(), 7_i64.into()],
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), Some(2));
    assert_eq!(result.column_count(), None);
}
