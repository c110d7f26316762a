//! HTTP transport for the session proxy.
//!
//! Routes:
//! - `POST /api/db/connect`, `/disconnect`, `/query`, `/batch`, `/schema`
//! - `GET /api/db/sessions`
//! - `GET /health`
//!
//! Every `/api/db/*` route goes through [`auth_middleware`]. Handlers only
//! translate between JSON and [`ProxyService`] calls.

use crate::auth::{OwnerId, TokenResolver, auth_middleware};
use crate::error::{DbError, DbResult};
use crate::models::{
    BatchRequest, BatchResult, ConnectResponse, ConnectionParams, DisconnectResponse,
    QueryRequest, QueryResult, SessionInfo, TableInfo,
};
use crate::service::ProxyService;
use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQueryRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub query: QueryRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBatchRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub batch: BatchRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRequest {
    pub session_id: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
}

// =============================================================================
// Router
// =============================================================================

/// Build the application router.
pub fn router(service: Arc<ProxyService>, resolver: Arc<dyn TokenResolver>) -> Router {
    let api = Router::new()
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/query", post(query))
        .route("/batch", post(batch))
        .route("/schema", post(schema))
        .route("/sessions", get(sessions))
        .route_layer(middleware::from_fn_with_state(resolver, auth_middleware));

    Router::new()
        .nest("/api/db", api)
        .route("/health", get(health))
        .with_state(service)
}

/// Unwrap a JSON body, reporting malformed input as [`DbError::InvalidInput`].
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> DbResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| DbError::invalid_input(rejection.body_text()))
}

fn require_session_id(session_id: &str) -> DbResult<()> {
    if session_id.trim().is_empty() {
        return Err(DbError::invalid_input("sessionId is required"));
    }
    Ok(())
}

async fn connect(
    State(service): State<Arc<ProxyService>>,
    Extension(OwnerId(owner_id)): Extension<OwnerId>,
    payload: Result<Json<ConnectionParams>, JsonRejection>,
) -> DbResult<Json<ConnectResponse>> {
    let params = body(payload)?;
    service.connect(&owner_id, &params).await.map(Json)
}

async fn disconnect(
    State(service): State<Arc<ProxyService>>,
    payload: Result<Json<DisconnectRequest>, JsonRejection>,
) -> DbResult<Json<DisconnectResponse>> {
    let request = body(payload)?;
    require_session_id(&request.session_id)?;
    let response = match service.disconnect(&request.session_id).await {
        Ok(()) => DisconnectResponse::ok(),
        Err(e) => DisconnectResponse::failed(&e),
    };
    Ok(Json(response))
}

async fn query(
    State(service): State<Arc<ProxyService>>,
    payload: Result<Json<SessionQueryRequest>, JsonRejection>,
) -> DbResult<Json<QueryResult>> {
    let request = body(payload)?;
    require_session_id(&request.session_id)?;
    service
        .execute_query(&request.session_id, &request.query)
        .await
        .map(Json)
}

async fn batch(
    State(service): State<Arc<ProxyService>>,
    payload: Result<Json<SessionBatchRequest>, JsonRejection>,
) -> DbResult<Json<BatchResult>> {
    let request = body(payload)?;
    require_session_id(&request.session_id)?;
    service
        .execute_batch(&request.session_id, &request.batch)
        .await
        .map(Json)
}

async fn schema(
    State(service): State<Arc<ProxyService>>,
    payload: Result<Json<SchemaRequest>, JsonRejection>,
) -> DbResult<Json<SchemaResponse>> {
    let request = body(payload)?;
    require_session_id(&request.session_id)?;
    let tables = service
        .describe_schema(
            &request.session_id,
            request.schema.as_deref(),
            request.table.as_deref(),
        )
        .await?;
    Ok(Json(SchemaResponse { tables }))
}

async fn sessions(
    State(service): State<Arc<ProxyService>>,
    Extension(OwnerId(owner_id)): Extension<OwnerId>,
) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: service.list_sessions(&owner_id).await,
    })
}

async fn health(State(service): State<Arc<ProxyService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: service.active_session_count().await,
    })
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server hosting the proxy API.
pub struct HttpTransport {
    service: Arc<ProxyService>,
    resolver: Arc<dyn TokenResolver>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpTransport {
    pub fn new(
        service: Arc<ProxyService>,
        resolver: Arc<dyn TokenResolver>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service,
            resolver,
            host: host.into(),
            port,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serve until SIGINT/SIGTERM, then close every session.
    pub async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::internal(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        info!(addr = %bind_addr, "HTTP server listening");

        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> DbResult<()> {
        let app = router(self.service.clone(), self.resolver.clone());

        // In-flight requests get this long to finish once a signal arrives
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();
        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        let result = tokio::select! {
            result = server => result.map_err(|e| {
                error!(error = %e, "HTTP server error");
                DbError::internal(format!("HTTP server error: {}", e))
            }),
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );
                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => Ok(()),
        };

        info!("Closing all sessions");
        self.service.shutdown().await;
        result
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
