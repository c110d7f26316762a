//! Data models for the session proxy.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    BackendKind, ConnectResponse, ConnectionParams, DisconnectResponse, SessionInfo,
};
pub use query::{
    BatchRequest, BatchResult, ColumnValue, DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, QueryRequest,
    QueryResult,
};
pub use schema::{ColumnInfo, TableInfo, TableKind};
