//! Stub connector and its scripted server state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlpool::{ConnectionConfig, Connector, Error, Result};

use crate::StubDriver;
use crate::connection::{ConnectionShared, StubConnection};
use crate::events::{Event, EventLog};
use crate::response::StubResponse;

/// How a scripted connection attempt fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The server could not be reached ([`Error::Connection`]).
    Refused,
    /// The server rejected the login (a driver error, not retried).
    Rejected(String),
}

impl ConnectFailure {
    fn into_error(self) -> Error {
        match self {
            Self::Refused => Error::Connection("connection refused".into()),
            Self::Rejected(message) => Error::driver(message),
        }
    }
}

/// Responses, timing and recorded events shared by every stub connection.
pub(crate) struct ServerState {
    pub(crate) responses: HashMap<String, StubResponse>,
    pub(crate) default_response: StubResponse,
    pub(crate) query_latency: Duration,
    pub(crate) connect_delay: Duration,
    pub(crate) failures: Mutex<VecDeque<ConnectFailure>>,
    pub(crate) connects: AtomicUsize,
    pub(crate) next_id: AtomicU64,
    pub(crate) events: EventLog,
    pub(crate) connections: Mutex<Vec<Weak<ConnectionShared>>>,
}

impl ServerState {
    pub(crate) fn response_for(&self, sql: &str) -> StubResponse {
        self.responses
            .get(sql)
            .cloned()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

/// Builder for [`StubConnector`].
#[derive(Debug)]
pub struct StubConnectorBuilder {
    responses: HashMap<String, StubResponse>,
    default_response: StubResponse,
    query_latency: Duration,
    connect_delay: Duration,
    failures: VecDeque<ConnectFailure>,
}

impl Default for StubConnectorBuilder {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: StubResponse::empty(),
            query_latency: Duration::ZERO,
            connect_delay: Duration::ZERO,
            failures: VecDeque::new(),
        }
    }
}

impl StubConnectorBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for a specific SQL text.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: StubResponse) -> Self {
        self.responses.insert(sql.into(), response);
        self
    }

    /// Set the response for unmatched SQL.
    #[must_use]
    pub fn with_default_response(mut self, response: StubResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Time every query and statement execution takes.
    #[must_use]
    pub fn query_latency(mut self, latency: Duration) -> Self {
        self.query_latency = latency;
        self
    }

    /// Time every connection attempt takes.
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Fail the next `count` connection attempts as unreachable.
    #[must_use]
    pub fn fail_connects(mut self, count: usize) -> Self {
        self.failures
            .extend(std::iter::repeat_n(ConnectFailure::Refused, count));
        self
    }

    /// Fail the next connection attempt with `failure`.
    #[must_use]
    pub fn fail_next_connect(mut self, failure: ConnectFailure) -> Self {
        self.failures.push_back(failure);
        self
    }

    /// Build the connector.
    #[must_use]
    pub fn build(self) -> StubConnector {
        StubConnector {
            server: Arc::new(ServerState {
                responses: self.responses,
                default_response: self.default_response,
                query_latency: self.query_latency,
                connect_delay: self.connect_delay,
                failures: Mutex::new(self.failures),
                connects: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                events: EventLog::new(),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Connector producing [`StubConnection`]s.
///
/// Clones share the same scripted server, so a test can keep one clone to
/// inspect the [`EventLog`] after handing another to the pool.
#[derive(Clone)]
pub struct StubConnector {
    server: Arc<ServerState>,
}

impl StubConnector {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> StubConnectorBuilder {
        StubConnectorBuilder::new()
    }

    /// Number of connection attempts made, failed ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.server.connects.load(Ordering::SeqCst)
    }

    /// The shared event log.
    #[must_use]
    pub fn events(&self) -> EventLog {
        self.server.events.clone()
    }

    /// Number of opened connections that are not closed yet.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.server
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| !connection.is_closed())
            .count()
    }

    /// Mark every open connection dead, as if the server had dropped them.
    ///
    /// No [`Event::Close`] is recorded.
    pub fn kill_connections(&self) {
        for connection in self.server.connections.lock().iter().filter_map(Weak::upgrade) {
            connection.kill();
        }
    }
}

impl std::fmt::Debug for StubConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubConnector")
            .field("connects", &self.connect_count())
            .finish()
    }
}

#[async_trait]
impl Connector<StubDriver> for StubConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<StubConnection> {
        self.server.connects.fetch_add(1, Ordering::SeqCst);

        if !self.server.connect_delay.is_zero() {
            tokio::time::sleep(self.server.connect_delay).await;
        }

        if let Some(failure) = self.server.failures.lock().pop_front() {
            tracing::debug!(server = %config.target(), ?failure, "stub connect failed");
            return Err(failure.into_error());
        }

        let id = self.server.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = ConnectionShared::new(id, self.server.clone());
        self.server.connections.lock().push(Arc::downgrade(&shared));
        self.server.events.record(Event::Connect(id));

        Ok(StubConnection::new(shared))
    }
}
