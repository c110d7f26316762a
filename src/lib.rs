//! DB Session Proxy Library
//!
//! Session-oriented SQL access to MySQL, PostgreSQL and SQLite. Callers
//! open a session once, then run statements, batches and schema lookups
//! against it by id until they disconnect or the session expires.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod transport;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use service::ProxyService;
