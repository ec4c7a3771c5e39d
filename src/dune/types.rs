//! Types exchanged with the query service.
//!
//! Covers execution handles, execution states, performance tiers and the
//! tabular result set, plus the raw response bodies of the HTTP API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of one query execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Wraps a raw execution id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of an execution as reported by the service.
///
/// Anything other than pending, executing or completed is kept verbatim in
/// `Other` and treated as a failure signal by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionState {
    Pending,
    Executing,
    Completed,
    Other(String),
}

impl ExecutionState {
    pub const PENDING: &'static str = "QUERY_STATE_PENDING";
    pub const EXECUTING: &'static str = "QUERY_STATE_EXECUTING";
    pub const COMPLETED: &'static str = "QUERY_STATE_COMPLETED";

    /// Returns the wire representation of the state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => Self::PENDING,
            Self::Executing => Self::EXECUTING,
            Self::Completed => Self::COMPLETED,
            Self::Other(raw) => raw,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl From<&str> for ExecutionState {
    fn from(s: &str) -> Self {
        match s {
            Self::PENDING => Self::Pending,
            Self::EXECUTING => Self::Executing,
            Self::COMPLETED => Self::Completed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ExecutionState {
    fn from(s: String) -> Self {
        match Self::from(s.as_str()) {
            Self::Other(_) => Self::Other(s),
            known => known,
        }
    }
}

impl From<ExecutionState> for String {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine size the service runs the query on.
///
/// Larger tiers finish sooner and spend more credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    /// Cheapest and slowest.
    Small,
    #[default]
    Medium,
    /// Most expensive and fastest.
    Large,
}

impl PerformanceTier {
    /// Returns the tier as sent in the `performance` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl FromStr for PerformanceTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(format!(
                "Invalid performance tier: {s}. Expected: small, medium, or large"
            )),
        }
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saved query to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Numeric id of the saved query.
    pub query_id: String,
    pub performance: PerformanceTier,
    /// Values for the query's declared parameters, if any.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl QueryRequest {
    pub fn new(query_id: impl Into<String>, performance: PerformanceTier) -> Self {
        Self {
            query_id: query_id.into(),
            performance,
            parameters: BTreeMap::new(),
        }
    }

    /// Adds a query parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Fresh status of an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
}

/// Response of the results endpoint.
///
/// The endpoint reports the state as well, so `result` is only present once
/// the execution has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResults {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    pub result: Option<ResultSet>,
}

/// One result row: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows of a completed execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column names in display order.
    pub columns: Vec<String>,

    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Creates a result set, deriving the column order from the rows when
    /// `columns` is empty.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let columns = if columns.is_empty() {
            columns_from_rows(&rows)
        } else {
            columns
        };
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Collects column names in first-seen order across all rows.
fn columns_from_rows(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

// === Wire formats ===

#[derive(Debug, Deserialize)]
pub(crate) struct ExecuteResponse {
    pub execution_id: String,
    #[serde(default)]
    pub state: Option<ExecutionState>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusResponse {
    pub execution_id: String,
    pub state: ExecutionState,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultsResponse {
    pub execution_id: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub result: Option<ResultPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultPayload {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub metadata: Option<ResultMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultMetadata {
    #[serde(default)]
    pub column_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

impl From<ResultsResponse> for ExecutionResults {
    fn from(response: ResultsResponse) -> Self {
        let result = response.result.map(|payload| {
            let columns = payload
                .metadata
                .map(|m| m.column_names)
                .unwrap_or_default();
            ResultSet::new(columns, payload.rows)
        });

        Self {
            execution_id: ExecutionId::new(response.execution_id),
            state: response.state,
            result,
        }
    }
}
