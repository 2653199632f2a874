//! Scripted responses and the result sets built from them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sqlpool::{Error, ResultSet, Result};

/// A scalar value for stub rows and parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A row: column name to value.
pub type StubRow = BTreeMap<String, ScalarValue>;

/// Statement parameters.
pub type StubParams = Vec<ScalarValue>;

/// Response configuration for a SQL text.
#[derive(Clone)]
pub enum StubResponse {
    /// Return rows.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// Return rows affected count (for INSERT/UPDATE/DELETE).
    Affected(u64),

    /// Fail with [`Error::Query`].
    Error(String),

    /// Return several result sets, one after the other.
    Chain(Vec<StubResponse>),

    /// Compute the response from the SQL and parameters.
    Custom(Arc<dyn Fn(&str, &StubParams) -> StubResponse + Send + Sync>),
}

impl StubResponse {
    /// Create a single-column, single-row response.
    pub fn scalar(value: impl Into<ScalarValue>) -> Self {
        Self::Rows {
            columns: vec!["value".into()],
            rows: vec![vec![value.into()]],
        }
    }

    /// Create a rows response.
    pub fn rows(columns: &[&str], rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
        }
    }

    /// Create a single-column response with one row per value.
    pub fn column(name: &str, values: impl IntoIterator<Item = i64>) -> Self {
        Self::Rows {
            columns: vec![name.to_owned()],
            rows: values
                .into_iter()
                .map(|v| vec![ScalarValue::Int(v)])
                .collect(),
        }
    }

    /// Create an empty result response.
    pub fn empty() -> Self {
        Self::Affected(0)
    }

    /// Create a rows affected response.
    pub fn affected(count: u64) -> Self {
        Self::Affected(count)
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Create a multi result set response.
    pub fn chain(responses: impl IntoIterator<Item = StubResponse>) -> Self {
        Self::Chain(responses.into_iter().collect())
    }

    /// Create a response computed per call.
    pub fn custom(
        handler: impl Fn(&str, &StubParams) -> StubResponse + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(handler))
    }

    /// Resolve `Custom` and flatten `Chain` into the list of result sets.
    fn flatten(self, sql: &str, params: &StubParams, out: &mut VecDeque<StubResponse>) {
        match self {
            Self::Custom(handler) => handler(sql, params).flatten(sql, params, out),
            Self::Chain(responses) => {
                for response in responses {
                    response.flatten(sql, params, out);
                }
            }
            other => out.push_back(other),
        }
    }
}

impl fmt::Debug for StubResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
            Self::Error(message) => f.debug_tuple("Error").field(message).finish(),
            Self::Chain(responses) => f.debug_tuple("Chain").field(responses).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

/// One result set of a scripted response, with the sets that follow it.
#[derive(Debug)]
pub struct StubResultSet {
    columns: Vec<String>,
    rows: VecDeque<Vec<ScalarValue>>,
    row_count: u64,
    returns_rows: bool,
    rest: VecDeque<StubResponse>,
}

impl StubResultSet {
    /// Build the result of running `sql` with `params` against `response`.
    pub fn from_response(response: StubResponse, sql: &str, params: &StubParams) -> Result<Self> {
        let mut sets = VecDeque::new();
        response.flatten(sql, params, &mut sets);
        Self::from_sets(sets)
    }

    fn from_sets(mut sets: VecDeque<StubResponse>) -> Result<Self> {
        let head = sets.pop_front().unwrap_or(StubResponse::Affected(0));
        let mut set = match head {
            StubResponse::Rows { columns, rows } => Self {
                row_count: rows.len() as u64,
                columns,
                rows: rows.into(),
                returns_rows: true,
                rest: VecDeque::new(),
            },
            StubResponse::Affected(n) => Self {
                columns: Vec::new(),
                rows: VecDeque::new(),
                row_count: n,
                returns_rows: false,
                rest: VecDeque::new(),
            },
            StubResponse::Error(message) => return Err(Error::Query(message)),
            StubResponse::Chain(_) | StubResponse::Custom(_) => {
                return Err(Error::Query("unresolved stub response".into()));
            }
        };
        set.rest = sets;
        Ok(set)
    }

    /// Rows not read yet in this set.
    #[must_use]
    pub fn remaining_rows(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl ResultSet for StubResultSet {
    type Row = StubRow;

    async fn next_row(&mut self) -> Result<Option<StubRow>> {
        Ok(self.rows.pop_front().map(|values| {
            self.columns
                .iter()
                .cloned()
                .zip(values)
                .collect::<StubRow>()
        }))
    }

    fn row_count(&self) -> Option<u64> {
        Some(self.row_count)
    }

    fn column_count(&self) -> Option<usize> {
        self.returns_rows.then_some(self.columns.len())
    }

    async fn next_result(&mut self) -> Result<Option<Self>> {
        self.rows.clear();
        if self.rest.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.rest);
        Self::from_sets(rest).map(Some)
    }
}
