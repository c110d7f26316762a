//! Configuration handling for the session proxy.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use clap::{Args, Parser};
use std::time::Duration;
use tracing::warn;

pub use crate::models::DEFAULT_QUERY_TIMEOUT_SECS;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8081;
pub const DEFAULT_SESSION_SERVICE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 5;

// Session lifecycle defaults
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

// Per-session pool defaults
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 10;
pub const DEFAULT_MAX_OPEN_CONNS_SQLITE: u32 = 1;
pub const DEFAULT_CONN_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONN_MAX_LIFETIME_SECS: u64 = 5 * 60;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// Backend defaults
pub const DEFAULT_DATABASE_NAME: &str = "codebridge";
pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
pub const DEFAULT_SQLITE_PATH: &str = "codebridge.db";

/// Driver-level limits applied to every session handle.
///
/// sqlx pools have no cap on idle connections; idle ones are closed after
/// `idle_timeout` instead, and none are kept open ahead of demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_open: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl PoolLimits {
    /// Limits for a given backend. SQLite handles get a single connection.
    pub fn max_open_for(&self, is_sqlite: bool) -> u32 {
        if is_sqlite {
            DEFAULT_MAX_OPEN_CONNS_SQLITE
        } else {
            self.max_open
        }
    }

    /// Validate limits and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open == 0 {
            return Err("max_open_conns must be greater than 0".to_string());
        }
        if self.max_lifetime.is_zero() || self.idle_timeout.is_zero() {
            return Err(
                "conn_max_lifetime and conn_idle_timeout must be greater than 0".to_string(),
            );
        }
        Ok(())
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN_CONNS,
            idle_timeout: Duration::from_secs(DEFAULT_CONN_IDLE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(DEFAULT_CONN_MAX_LIFETIME_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// Process-wide fallbacks for omitted connection parameters.
#[derive(Debug, Clone, Args)]
pub struct BackendDefaults {
    #[arg(long, default_value = "localhost", env = "DB_PROXY_MYSQL_HOST")]
    pub mysql_host: String,

    #[arg(long, default_value_t = DEFAULT_MYSQL_PORT, env = "DB_PROXY_MYSQL_PORT")]
    pub mysql_port: u16,

    #[arg(long, default_value = "root", env = "DB_PROXY_MYSQL_USER")]
    pub mysql_user: String,

    #[arg(long, default_value = "", env = "DB_PROXY_MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: String,

    #[arg(long, default_value = DEFAULT_DATABASE_NAME, env = "DB_PROXY_MYSQL_DATABASE")]
    pub mysql_database: String,

    /// Extra URL parameters, e.g. "charset=utf8mb4"
    #[arg(long, default_value = "charset=utf8mb4", env = "DB_PROXY_MYSQL_PARAMS")]
    pub mysql_params: String,

    #[arg(long, default_value = "localhost", env = "DB_PROXY_POSTGRES_HOST")]
    pub postgres_host: String,

    #[arg(long, default_value_t = DEFAULT_POSTGRES_PORT, env = "DB_PROXY_POSTGRES_PORT")]
    pub postgres_port: u16,

    #[arg(long, default_value = "postgres", env = "DB_PROXY_POSTGRES_USER")]
    pub postgres_user: String,

    #[arg(long, default_value = "", env = "DB_PROXY_POSTGRES_PASSWORD", hide_env_values = true)]
    pub postgres_password: String,

    #[arg(long, default_value = DEFAULT_DATABASE_NAME, env = "DB_PROXY_POSTGRES_DATABASE")]
    pub postgres_database: String,

    #[arg(long, default_value = "disable", env = "DB_PROXY_POSTGRES_SSLMODE")]
    pub postgres_sslmode: String,

    #[arg(long, default_value = DEFAULT_SQLITE_PATH, env = "DB_PROXY_SQLITE_PATH")]
    pub sqlite_path: String,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            mysql_host: "localhost".to_string(),
            mysql_port: DEFAULT_MYSQL_PORT,
            mysql_user: "root".to_string(),
            mysql_password: String::new(),
            mysql_database: DEFAULT_DATABASE_NAME.to_string(),
            mysql_params: "charset=utf8mb4".to_string(),
            postgres_host: "localhost".to_string(),
            postgres_port: DEFAULT_POSTGRES_PORT,
            postgres_user: "postgres".to_string(),
            postgres_password: String::new(),
            postgres_database: DEFAULT_DATABASE_NAME.to_string(),
            postgres_sslmode: "disable".to_string(),
            sqlite_path: DEFAULT_SQLITE_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-session-proxy",
    about = "Session-oriented SQL proxy for MySQL, PostgreSQL and SQLite",
    version,
    author
)]
pub struct Config {
    /// HTTP host to bind to
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "DB_PROXY_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "DB_PROXY_HTTP_PORT")]
    pub http_port: u16,

    /// Base URL of the session service that validates bearer tokens
    #[arg(
        long,
        default_value = DEFAULT_SESSION_SERVICE_URL,
        env = "DB_PROXY_SESSION_SERVICE_URL"
    )]
    pub session_service_url: String,

    /// Token validation timeout in seconds
    #[arg(long, default_value_t = DEFAULT_AUTH_TIMEOUT_SECS, env = "DB_PROXY_AUTH_TIMEOUT")]
    pub auth_timeout: u64,

    /// Default statement timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "DB_PROXY_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Liveness probe timeout on connect, in seconds
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECS, env = "DB_PROXY_PROBE_TIMEOUT")]
    pub probe_timeout: u64,

    /// Upper bound on closing one session handle, in seconds
    #[arg(long, default_value_t = DEFAULT_CLOSE_TIMEOUT_SECS, env = "DB_PROXY_CLOSE_TIMEOUT")]
    pub close_timeout: u64,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS, env = "DB_PROXY_SESSION_TTL")]
    pub session_ttl: u64,

    /// Interval between expiry sweeps, in seconds
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS, env = "DB_PROXY_SWEEP_INTERVAL")]
    pub sweep_interval: u64,

    /// Maximum open connections per session
    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_CONNS, env = "DB_PROXY_MAX_OPEN_CONNS")]
    pub max_open_conns: u32,

    /// Seconds an idle pooled connection is kept before it is closed
    #[arg(
        long,
        default_value_t = DEFAULT_CONN_IDLE_TIMEOUT_SECS,
        env = "DB_PROXY_CONN_IDLE_TIMEOUT"
    )]
    pub conn_idle_timeout: u64,

    /// Maximum lifetime of a pooled connection, in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONN_MAX_LIFETIME_SECS,
        env = "DB_PROXY_CONN_MAX_LIFETIME"
    )]
    pub conn_max_lifetime: u64,

    /// Connection acquire timeout, in seconds
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "DB_PROXY_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    #[command(flatten)]
    pub backends: BackendDefaults,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_PROXY_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_PROXY_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            session_service_url: DEFAULT_SESSION_SERVICE_URL.to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT_SECS,
            close_timeout: DEFAULT_CLOSE_TIMEOUT_SECS,
            session_ttl: DEFAULT_SESSION_TTL_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            conn_idle_timeout: DEFAULT_CONN_IDLE_TIMEOUT_SECS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME_SECS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            backends: BackendDefaults::default(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Check invariants that clap cannot express.
    ///
    /// An idle timeout above the connection lifetime is clamped rather than rejected.
    pub fn validate(&mut self) -> Result<(), String> {
        if self.conn_idle_timeout > self.conn_max_lifetime {
            warn!(
                conn_idle_timeout = self.conn_idle_timeout,
                conn_max_lifetime = self.conn_max_lifetime,
                "conn_idle_timeout exceeds conn_max_lifetime, clamping"
            );
            self.conn_idle_timeout = self.conn_max_lifetime;
        }
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        if self.session_ttl == 0 {
            return Err("session_ttl must be greater than 0".to_string());
        }
        if self.query_timeout == 0 {
            return Err("query_timeout must be greater than 0".to_string());
        }
        if self.probe_timeout == 0 || self.close_timeout == 0 {
            return Err("probe_timeout and close_timeout must be greater than 0".to_string());
        }
        self.pool_limits().validate()
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_open: self.max_open_conns,
            idle_timeout: Duration::from_secs(self.conn_idle_timeout),
            max_lifetime: Duration::from_secs(self.conn_max_lifetime),
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
        }
    }

    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    pub fn probe_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn close_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.close_timeout)
    }

    pub fn auth_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }

    pub fn session_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
