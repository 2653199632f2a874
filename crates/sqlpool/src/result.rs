//! Pooled result sets.
//!
//! A [`PooledResult`] keeps the connection it was produced on checked out
//! until the whole chain of result sets has been consumed or disposed. The
//! release obligation moves forward along the chain: when the next result
//! set is fetched it takes over the handle, so exactly one link holds it at
//! any time.

use std::fmt;

use futures_core::Stream;

use crate::driver::{Driver, ResultSet};
use crate::error::{Error, Result};
use crate::release::ReleaseHandle;

enum NextResult<D: Driver> {
    Unfetched,
    Ready(Box<PooledResult<D>>),
    Failed(Error),
    Done,
}

/// A result set running on a borrowed connection.
///
/// Rows are read with [`next_row`](Self::next_row). Once the rows are
/// exhausted the next result set (if any) is fetched and the connection is
/// handed to it; if there is none, the connection is released. Dropping a
/// result that still holds the connection drains the remaining rows in the
/// background before releasing it.
///
/// # Example
///
/// ```rust,ignore
/// let mut result = pool.query("SELECT 1; SELECT 2").await?;
/// while let Some(row) = result.next_row().await? {
///     println!("{row:?}");
/// }
/// if let Some(mut second) = result.next_result().await? {
///     let rows = second.collect_all().await?;
/// }
/// ```
pub struct PooledResult<D: Driver> {
    result: Option<D::ResultSet>,
    release: Option<ReleaseHandle>,
    next: NextResult<D>,
}

impl<D: Driver> PooledResult<D> {
    /// Wrap a driver result set together with the release obligation of the
    /// connection it runs on.
    pub fn new(result: D::ResultSet, release: ReleaseHandle) -> Self {
        Self {
            result: Some(result),
            release: Some(release),
            next: NextResult::Unfetched,
        }
    }

    /// Fetch the next row of this result set.
    ///
    /// Returns `Ok(None)` once the rows are exhausted; at that point the next
    /// result set has been fetched and the connection released if the chain
    /// ended.
    pub async fn next_row(&mut self) -> Result<Option<D::Row>> {
        let Some(result) = self.result.as_mut() else {
            return Ok(None);
        };

        match result.next_row().await {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                if matches!(self.next, NextResult::Unfetched) {
                    self.fetch_next().await;
                }
                Ok(None)
            }
            Err(err) => {
                if matches!(self.next, NextResult::Unfetched) {
                    self.next = NextResult::Done;
                    self.release = None;
                }
                Err(err)
            }
        }
    }

    /// Read every remaining row of this result set.
    pub async fn collect_all(&mut self) -> Result<Vec<D::Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Turn this result into a stream over the rows of the current result set.
    pub fn into_stream(self) -> impl Stream<Item = Result<D::Row>> + Send {
        futures_util::stream::try_unfold(self, |mut result| async move {
            Ok(result.next_row().await?.map(|row| (row, result)))
        })
    }

    /// Move to the next result set of the chain.
    ///
    /// Unread rows of this result set are discarded. Returns `Ok(None)` and
    /// releases the connection when the chain has ended.
    pub async fn next_result(&mut self) -> Result<Option<PooledResult<D>>> {
        if matches!(self.next, NextResult::Unfetched) {
            self.fetch_next().await;
        }

        match std::mem::replace(&mut self.next, NextResult::Done) {
            NextResult::Ready(next) => Ok(Some(*next)),
            NextResult::Failed(err) => Err(err),
            NextResult::Unfetched | NextResult::Done => Ok(None),
        }
    }

    /// Rows returned or affected, if known.
    #[must_use]
    pub fn row_count(&self) -> Option<u64> {
        self.result.as_ref().and_then(ResultSet::row_count)
    }

    /// Number of columns, if this result set returns rows.
    #[must_use]
    pub fn column_count(&self) -> Option<usize> {
        self.result.as_ref().and_then(ResultSet::column_count)
    }

    /// Whether this link of the chain still holds the connection.
    #[must_use]
    pub fn holds_connection(&self) -> bool {
        self.release.is_some()
    }

    /// Discard the remaining rows of the whole chain and release the
    /// connection.
    pub async fn dispose(mut self) {
        if let (Some(result), Some(release)) = (self.result.take(), self.release.take()) {
            drain(result).await;
            release.release();
        }

        if let NextResult::Ready(next) = std::mem::replace(&mut self.next, NextResult::Done) {
            Box::pin(next.dispose()).await;
        }
    }

    async fn fetch_next(&mut self) {
        let Some(result) = self.result.as_mut() else {
            self.next = NextResult::Done;
            return;
        };

        self.next = match result.next_result().await {
            Ok(Some(next)) => {
                let release = self.release.take().unwrap_or_else(ReleaseHandle::noop);
                NextResult::Ready(Box::new(PooledResult::new(next, release)))
            }
            Ok(None) => {
                self.release = None;
                NextResult::Done
            }
            Err(err) => {
                self.release = None;
                NextResult::Failed(err)
            }
        };
    }
}

impl<D: Driver> Drop for PooledResult<D> {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let Some(result) = self.result.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    drain(result).await;
                    release.release();
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Tokio runtime unavailable while dropping an undrained result; \
                     releasing its connection without discarding pending rows"
                );
            }
        }
    }
}

impl<D: Driver> fmt::Debug for PooledResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResult")
            .field("holds_connection", &self.holds_connection())
            .field("row_count", &self.row_count())
            .field("column_count", &self.column_count())
            .finish()
    }
}

/// Read and discard every remaining row of `result` and of the result sets
/// following it. Errors end the drain.
async fn drain<R: ResultSet>(mut result: R) {
    loop {
        while let Ok(Some(_)) = result.next_row().await {}

        match result.next_result().await {
            Ok(Some(next)) => result = next,
            Ok(None) | Err(_) => break,
        }
    }
}
