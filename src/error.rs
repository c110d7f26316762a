//! Error types for the session proxy.
//!
//! Every fallible operation returns a [`DbError`]. Variants carry the
//! backend's message plus, where one exists, a suggestion that callers can
//! surface to users as-is.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Execution error: {message}")]
    Execution {
        message: String,
        /// e.g., "23000" for an integrity constraint violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Failed to close session {session_id}: {message}")]
    Close { session_id: String, message: String },

    #[error("Unsupported operation: {operation} on {backend}")]
    Unsupported { operation: String, backend: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create an execution error with optional SQL state.
    pub fn execution(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn close(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Close {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Create an error for a capability the backend does not have.
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Execution { suggestion, .. } => Some(suggestion),
            Self::SessionNotFound { .. } => Some("Connect again to obtain a new session"),
            Self::Timeout { .. } => {
                Some("Consider increasing the timeout or optimizing the statement")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The proxy itself never retries; this is advisory for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection_error",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::Execution { .. } => "execution_error",
            Self::Timeout { .. } => "timeout",
            Self::Schema { .. } => "schema_error",
            Self::Close { .. } => "close_error",
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status used by the transport layer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidInput { .. } | Self::Execution { .. } | Self::Schema { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection { .. }
            | Self::Close { .. }
            | Self::Unsupported { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message as shown to callers, with the SQL state appended when known.
    pub fn display_message(&self) -> String {
        match self {
            Self::Execution {
                message,
                sql_state: Some(code),
                ..
            } => format!("{} (SQLSTATE: {})", message, code),
            _ => self.to_string(),
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// Anything reported by the server while running a statement is an
/// execution error; transport-level failures are connection errors.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::execution(
                    db_err.message(),
                    code,
                    "Check the SQL syntax, referenced objects and parameter count",
                )
            }
            sqlx::Error::RowNotFound => DbError::execution(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a connection for the session",
                "The session is saturated; retry later or raise the pool limits",
            ),
            sqlx::Error::PoolClosed => DbError::execution(
                "Session handle is closed",
                None,
                "The session was closed while the statement was in flight; reconnect",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.display_message(),
                suggestion: self.suggestion(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::execution(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert!(DbError::schema("bad", "users").suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::session_not_found("abc").is_retryable());
        assert!(!DbError::execution("dup", None, "").is_retryable());
    }

    #[test]
    fn test_execution_message_includes_sql_state() {
        let err = DbError::execution("syntax error", Some("42601".to_string()), "check syntax");
        assert!(err.display_message().contains("42601"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DbError::unauthorized("nope").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DbError::session_not_found("s1").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DbError::execution("bad", None, "").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DbError::timeout("query", 5).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            DbError::close("s1", "stuck").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_pool_closed_is_execution_error() {
        let err = DbError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Execution { .. }));
    }

    #[test]
    fn test_unsupported_is_distinguishable() {
        let err = DbError::unsupported("last_insert_id", "postgres");
        assert!(matches!(err, DbError::Unsupported { .. }));
        assert_eq!(err.code(), "unsupported");
    }
}
