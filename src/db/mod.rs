//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Backend connector (defaults, connection strings, liveness probe)
//! - Session handles and the session registry
//! - Query execution
//! - Schema introspection
//! - Row decoding
//! - Database dispatch macros for reducing code duplication

pub mod connector;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod schema;
pub mod session_pool;
pub mod types;

pub use connector::{BackendConnector, ResolvedTarget};
pub use executor::{QueryExecutor, is_row_returning};
pub use pool::DbPool;
pub use schema::SchemaInspector;
pub use session_pool::{PoolConfig, SessionPool};
