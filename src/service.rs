//! Proxy facade.
//!
//! [`ProxyService`] is the single entry point used by the HTTP layer: it
//! ties the connector, the session pool, the executor and the schema
//! inspector together behind session ids.

use crate::config::Config;
use crate::db::{BackendConnector, PoolConfig, QueryExecutor, SchemaInspector, SessionPool};
use crate::error::{DbError, DbResult};
use crate::models::{
    BatchRequest, BatchResult, ConnectResponse, ConnectionParams, QueryRequest, QueryResult,
    SessionInfo, TableInfo,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Session-oriented access to MySQL, PostgreSQL and SQLite.
#[derive(Debug)]
pub struct ProxyService {
    sessions: Arc<SessionPool>,
    connector: BackendConnector,
    executor: QueryExecutor,
    session_ttl: Duration,
}

impl ProxyService {
    pub fn new(
        sessions: Arc<SessionPool>,
        connector: BackendConnector,
        executor: QueryExecutor,
        session_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            connector,
            executor,
            session_ttl,
        }
    }

    /// Build the service from configuration, starting the session pool.
    pub fn from_config(config: &Config) -> Self {
        let sessions = SessionPool::start(PoolConfig::from(config));
        let connector = BackendConnector::new(
            config.backends.clone(),
            sessions.limits().clone(),
            config.probe_timeout_duration(),
        );
        let executor = QueryExecutor::new(config.query_timeout_duration());
        Self::new(sessions, connector, executor, config.session_ttl_duration())
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    /// Open a session for `owner_id`.
    ///
    /// A backend that cannot be reached is reported through the response
    /// (`connected: false`), not as an `Err`.
    pub async fn connect(
        &self,
        owner_id: &str,
        params: &ConnectionParams,
    ) -> DbResult<ConnectResponse> {
        let kind = params.kind;

        let handle = match self.connector.connect(params).await {
            Ok(handle) => handle,
            Err(e @ DbError::InvalidInput { .. }) => return Err(e),
            Err(e) => {
                warn!(owner_id = %owner_id, db_type = %kind, error = %e, "Connect failed");
                return Ok(ConnectResponse::failed(kind, &e));
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let ttl = chrono::Duration::from_std(self.session_ttl)
            .map_err(|e| DbError::internal(format!("Invalid session TTL: {}", e)))?;
        let expires_at = Utc::now() + ttl;

        self.sessions
            .add(&session_id, owner_id, kind, handle, expires_at)
            .await?;

        info!(
            session_id = %session_id,
            owner_id = %owner_id,
            db_type = %kind,
            "Session connected"
        );
        Ok(ConnectResponse::connected(session_id, kind))
    }

    /// Close a session.
    pub async fn disconnect(&self, session_id: &str) -> DbResult<()> {
        self.sessions.remove(session_id).await?;
        info!(session_id = %session_id, "Session disconnected");
        Ok(())
    }

    pub async fn execute_query(
        &self,
        session_id: &str,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let handle = self.sessions.get(session_id).await?;
        self.executor.execute(&handle, request).await
    }

    /// Run a batch. Statement failures are reported inside the result;
    /// only an unknown session is an `Err`.
    pub async fn execute_batch(
        &self,
        session_id: &str,
        batch: &BatchRequest,
    ) -> DbResult<BatchResult> {
        let handle = self.sessions.get(session_id).await?;
        Ok(self.executor.execute_batch(&handle, batch).await)
    }

    pub async fn describe_schema(
        &self,
        session_id: &str,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        let kind = self.sessions.session_info(session_id).await?.kind;
        let handle = self.sessions.get(session_id).await?;
        SchemaInspector::describe_schema(&handle, kind, schema, table).await
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.active_count().await
    }

    pub async fn list_sessions(&self, owner_id: &str) -> Vec<SessionInfo> {
        self.sessions.sessions_for_owner(owner_id).await
    }

    /// Stop the sweeper and close every session.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
