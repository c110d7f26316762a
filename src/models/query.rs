//! Query-related data models.
//!
//! This module defines types for SQL statement requests and results.

use serde::{Deserialize, Serialize};

/// Default statement timeout in seconds, applied when a request carries none.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// A positional parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
}

impl QueryParam {
    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A single decoded cell.
///
/// Serialized untagged, so `BinaryAsText` is indistinguishable from `Text`
/// on the wire; the distinction exists for in-process consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    BinaryAsText(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::BinaryAsText(s) => Some(s),
            _ => None,
        }
    }
}

/// One statement to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Default: false
    #[serde(default)]
    pub transaction: bool,
    /// 0 means the executor default
    #[serde(default, alias = "timeout")]
    pub timeout_secs: u64,
    /// 0 or negative means unlimited
    #[serde(default)]
    pub max_rows: i64,
}

impl QueryRequest {
    /// Create a new request with default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    /// Add a parameter to this statement.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }

    pub fn with_transaction(mut self, transaction: bool) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_rows(mut self, max_rows: i64) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Row cap, or `None` when unlimited.
    pub fn row_cap(&self) -> Option<usize> {
        usize::try_from(self.max_rows).ok().filter(|cap| *cap > 0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ColumnValue>>,
    /// For row-returning statements, the number of rows returned
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Get a cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&ColumnValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// An ordered list of statements sharing one transaction flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub queries: Vec<QueryRequest>,
    #[serde(default)]
    pub transaction: bool,
}

impl BatchRequest {
    pub fn new(queries: Vec<QueryRequest>, transaction: bool) -> Self {
        Self {
            queries,
            transaction,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Results of the statements that completed, in order
    pub results: Vec<QueryResult>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0-based index of the statement that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
