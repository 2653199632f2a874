//! Reference-counted release of a borrowed connection.
//!
//! Every pooled wrapper ([`PooledResult`](crate::PooledResult),
//! [`PooledStatement`](crate::PooledStatement), transactions) that runs on a
//! connection checked out of the pool holds a [`ReleaseHandle`]. Deriving a
//! resource from another clones the handle; finishing with a resource drops
//! it. The release action fires exactly once, when the last handle is gone.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Action = Box<dyn FnOnce() + Send>;

struct Obligation {
    action: Mutex<Option<Action>>,
}

impl Drop for Obligation {
    fn drop(&mut self) {
        if let Some(action) = self.action.get_mut().take() {
            action();
        }
    }
}

/// A shared obligation to release a resource once every holder is done.
///
/// Cloning increments the reference count, dropping decrements it. The
/// action runs when the count reaches zero.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<Obligation>,
}

impl ReleaseHandle {
    /// Create a handle with a reference count of one.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Obligation {
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    /// Create a handle whose release does nothing.
    ///
    /// Used to wrap resources that do not borrow a pooled connection.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Number of holders currently sharing this obligation.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Give up this holder's share of the obligation.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
