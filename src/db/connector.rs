//! Backend connector.
//!
//! Turns caller-supplied [`ConnectionParams`] into a live [`DbPool`]:
//! omitted fields are filled from [`BackendDefaults`], MySQL/PostgreSQL
//! parameters become a connection URL, SQLite parameters become a file path,
//! and the new handle must pass a bounded liveness probe before it is
//! handed back.

use crate::config::{BackendDefaults, PoolLimits};
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, ConnectionParams};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Where a handle should point, after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// `mysql://` or `postgres://` URL. Contains credentials - never log.
    Url(String),
    SqliteFile(String),
}

/// Opens native handles for a backend kind.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    defaults: BackendDefaults,
    limits: PoolLimits,
    probe_timeout: Duration,
}

impl BackendConnector {
    pub fn new(defaults: BackendDefaults, limits: PoolLimits, probe_timeout: Duration) -> Self {
        Self {
            defaults,
            limits,
            probe_timeout,
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Open a handle and probe it.
    ///
    /// A handle that fails the probe is closed before the error is returned.
    pub async fn connect(&self, params: &ConnectionParams) -> DbResult<DbPool> {
        let kind = params.kind;
        let target = self.resolve(params)?;
        let pool = self.open(kind, &target)?;

        if let Err(e) = pool.ping(self.probe_timeout).await {
            warn!(db_type = %kind, error = %e, "Liveness probe failed, closing handle");
            pool.close().await;
            return Err(match e {
                DbError::Timeout { .. } => DbError::connection(
                    format!(
                        "{} server did not respond within {}s",
                        kind.display_name(),
                        self.probe_timeout.as_secs()
                    ),
                    format!("Check that the {} server is running and reachable", kind.display_name()),
                ),
                DbError::Connection { message, .. } | DbError::Execution { message, .. } => {
                    let suggestion = connection_suggestion(kind, &message);
                    DbError::connection(format!("Failed to connect: {}", message), suggestion)
                }
                other => other,
            });
        }

        info!(db_type = %kind, "Backend handle opened");
        Ok(pool)
    }

    /// Apply defaults and build the connection target.
    pub fn resolve(&self, params: &ConnectionParams) -> DbResult<ResolvedTarget> {
        let d = &self.defaults;
        match params.kind {
            BackendKind::Mysql => {
                let mut url = base_url(
                    "mysql",
                    params.host.as_deref().unwrap_or(&d.mysql_host),
                    params.port.unwrap_or(d.mysql_port),
                    params.user.as_deref().unwrap_or(&d.mysql_user),
                    params.password.as_deref().unwrap_or(&d.mysql_password),
                    params.database.as_deref().unwrap_or(&d.mysql_database),
                )?;
                {
                    let mut query = url.query_pairs_mut();
                    for (key, value) in split_params(&d.mysql_params) {
                        if !params.params.contains_key(key) {
                            query.append_pair(key, value);
                        }
                    }
                    for (key, value) in &params.params {
                        query.append_pair(key, value);
                    }
                }
                Ok(ResolvedTarget::Url(finish_url(url)))
            }
            BackendKind::Postgres => {
                let mut url = base_url(
                    "postgres",
                    params.host.as_deref().unwrap_or(&d.postgres_host),
                    params.port.unwrap_or(d.postgres_port),
                    params.user.as_deref().unwrap_or(&d.postgres_user),
                    params.password.as_deref().unwrap_or(&d.postgres_password),
                    params.database.as_deref().unwrap_or(&d.postgres_database),
                )?;
                {
                    let mut query = url.query_pairs_mut();
                    if !params.params.contains_key("sslmode") {
                        query.append_pair("sslmode", &d.postgres_sslmode);
                    }
                    for (key, value) in &params.params {
                        query.append_pair(key, value);
                    }
                }
                Ok(ResolvedTarget::Url(finish_url(url)))
            }
            BackendKind::Sqlite => {
                let path = params
                    .file_path
                    .as_deref()
                    .or(params.database.as_deref())
                    .unwrap_or(&d.sqlite_path);
                if path.trim().is_empty() {
                    return Err(DbError::invalid_input("SQLite file path cannot be empty"));
                }
                Ok(ResolvedTarget::SqliteFile(path.to_string()))
            }
        }
    }

    /// Create the pool lazily; nothing touches the network until the probe.
    fn open(&self, kind: BackendKind, target: &ResolvedTarget) -> DbResult<DbPool> {
        let is_sqlite = kind == BackendKind::Sqlite;
        let max_open = self.limits.max_open_for(is_sqlite);

        match (kind, target) {
            (BackendKind::Mysql, ResolvedTarget::Url(url)) => {
                let options = MySqlConnectOptions::from_str(url).map_err(|e| {
                    DbError::connection(
                        format!("Invalid MySQL connection parameters: {}", e),
                        "Check host, port, user and database values",
                    )
                })?;
                let pool = MySqlPoolOptions::new()
                    .max_connections(max_open)
                    .idle_timeout(Some(self.limits.idle_timeout))
                    .max_lifetime(Some(self.limits.max_lifetime))
                    .acquire_timeout(self.limits.acquire_timeout)
                    .connect_lazy_with(options);
                Ok(DbPool::MySql(pool))
            }
            (BackendKind::Postgres, ResolvedTarget::Url(url)) => {
                let options = PgConnectOptions::from_str(url).map_err(|e| {
                    DbError::connection(
                        format!("Invalid PostgreSQL connection parameters: {}", e),
                        "Check host, port, user, database and sslmode values",
                    )
                })?;
                let pool = PgPoolOptions::new()
                    .max_connections(max_open)
                    .idle_timeout(Some(self.limits.idle_timeout))
                    .max_lifetime(Some(self.limits.max_lifetime))
                    .acquire_timeout(self.limits.acquire_timeout)
                    .connect_lazy_with(options);
                Ok(DbPool::Postgres(pool))
            }
            (BackendKind::Sqlite, ResolvedTarget::SqliteFile(path)) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_open)
                    .idle_timeout(Some(self.limits.idle_timeout))
                    .max_lifetime(Some(self.limits.max_lifetime))
                    .acquire_timeout(self.limits.acquire_timeout)
                    .connect_lazy_with(options);
                Ok(DbPool::SQLite(pool))
            }
            _ => Err(DbError::internal(format!(
                "Resolved target does not match backend {}",
                kind
            ))),
        }
    }
}

fn base_url(
    scheme: &str,
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    database: &str,
) -> DbResult<Url> {
    let mut url = Url::parse(&format!("{}://localhost", scheme))
        .map_err(|e| DbError::internal(format!("Invalid URL scheme {}: {}", scheme, e)))?;
    url.set_host(Some(host))
        .map_err(|e| DbError::invalid_input(format!("Invalid host '{}': {}", host, e)))?;
    let invalid = |field: &str| DbError::invalid_input(format!("Invalid {} for {}", field, scheme));
    url.set_port(Some(port)).map_err(|_| invalid("port"))?;
    url.set_username(user).map_err(|_| invalid("user"))?;
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| invalid("password"))?;
    }
    url.set_path(&format!("/{}", database));
    Ok(url)
}

/// Drop a dangling `?` left by an empty query string.
fn finish_url(url: Url) -> String {
    let s = String::from(url);
    s.strip_suffix('?').map(str::to_string).unwrap_or(s)
}

fn split_params(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.split_once('='))
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(kind: BackendKind, message: &str) -> String {
    let lower = message.to_lowercase();

    if lower.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            kind.display_name()
        );
    }

    if lower.contains("authentication") || lower.contains("password") || lower.contains("access denied") {
        return "Verify the username and password".to_string();
    }

    if lower.contains("does not exist") || lower.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if lower.contains("tls") || lower.contains("ssl") {
        return "Check TLS/SSL configuration or try sslmode=disable".to_string();
    }

    match kind {
        BackendKind::Sqlite => "Verify the file path is writable".to_string(),
        _ => format!("Verify the {} connection parameters", kind.display_name()),
    }
}
