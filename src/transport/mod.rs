//! Transport layer for the session proxy.
//!
//! The proxy is served over HTTP/JSON; see [`http`] for the routes.

pub mod http;

pub use http::{HttpTransport, router};
