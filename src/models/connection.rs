//! Connection and session data models.
//!
//! This module defines the backend kind, the caller-supplied connection
//! parameters, session metadata and the wire shapes of connect/disconnect.

use crate::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Includes MariaDB
    Mysql,
    #[serde(alias = "postgresql")]
    Postgres,
    Sqlite,
}

impl BackendKind {
    /// Wire name, as used in requests and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mysql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(DbError::invalid_input(format!(
                "Unsupported database type '{}'. Expected mysql, postgres or sqlite",
                other
            ))),
        }
    }
}

/// Caller-supplied connection parameters.
///
/// Every field except `kind` may be omitted; the connector fills the gaps
/// from the per-backend defaults.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "username")]
    pub user: Option<String>,
    /// Sensitive - never log
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// SQLite only
    #[serde(default)]
    pub file_path: Option<String>,
    /// Extra driver parameters, appended to the connection URL.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ConnectionParams {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file_path: None,
            params: BTreeMap::new(),
        }
    }

    /// Parameters for a SQLite file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new(BackendKind::Sqlite).with_file_path(path)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("file_path", &self.file_path)
            .field("params", &self.params)
            .finish()
    }
}

/// Session metadata. Never carries the native handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub owner_id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Check whether the session has passed its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a connect call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResponse {
    pub fn connected(session_id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            connected: true,
            error: None,
        }
    }

    /// Wire shape for a failed connect.
    pub fn failed(kind: BackendKind, err: &DbError) -> Self {
        Self {
            session_id: String::new(),
            kind,
            connected: false,
            error: Some(err.display_message()),
        }
    }
}

/// Outcome of a disconnect call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DisconnectResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(err: &DbError) -> Self {
        Self {
            success: false,
            error: Some(err.display_message()),
        }
    }
}
