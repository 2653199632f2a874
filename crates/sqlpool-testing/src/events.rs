//! Recording of everything the stub driver is asked to do.

use std::sync::Arc;

use parking_lot::Mutex;
use sqlpool::IsolationLevel;

/// Identifier of a stub connection, in connect order starting at 1.
pub type ConnectionId = u64;

/// An operation performed by the stub driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection was opened.
    Connect(ConnectionId),
    /// A query ran directly on a connection or transaction.
    Query(ConnectionId, String),
    /// A statement was prepared.
    Prepare(ConnectionId, String),
    /// A prepared statement was executed.
    Execute(ConnectionId, String),
    /// A prepared statement was closed.
    CloseStatement(ConnectionId, String),
    /// A transaction was started.
    Begin(ConnectionId, IsolationLevel),
    /// A transaction was committed.
    Commit(ConnectionId),
    /// A transaction was rolled back.
    Rollback(ConnectionId),
    /// A savepoint was created.
    Savepoint(ConnectionId, String),
    /// A savepoint was released.
    ReleaseSavepoint(ConnectionId, String),
    /// The transaction was rolled back to a savepoint.
    RollbackTo(ConnectionId, String),
    /// A connection was closed.
    Close(ConnectionId),
}

/// Shared, append-only log of [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn record(&self, event: Event) {
        tracing::trace!(?event, "stub driver event");
        self.events.lock().push(event);
    }

    /// Every event recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|event| predicate(event))
            .cloned()
            .collect()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Names of the savepoints created, in order.
    #[must_use]
    pub fn savepoints(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Savepoint(_, name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
