//! Authentication for the HTTP transport.
//!
//! Every `/api/db/*` request carries `Authorization: Bearer <token>`. The
//! token is resolved to an owner id by a [`TokenResolver`]; the production
//! resolver asks the session service, tests plug in their own.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Principal the request acts for, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerId(pub String);

/// Maps a bearer token to the owner id it belongs to.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Resolve `token`, failing with [`DbError::Unauthorized`] when it is not valid.
    async fn resolve(&self, token: &str) -> DbResult<String>;
}

#[derive(Serialize)]
struct ValidateTokenRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateTokenResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Validates tokens against the session service (`POST {base}/validate-token`).
#[derive(Debug, Clone)]
pub struct SessionServiceResolver {
    client: Client,
    endpoint: String,
}

impl SessionServiceResolver {
    pub fn new(base_url: &str, timeout: Duration) -> DbResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DbError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/validate-token", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenResolver for SessionServiceResolver {
    async fn resolve(&self, token: &str) -> DbResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ValidateTokenRequest { token })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Session service unreachable");
                DbError::unauthorized(format!("Token validation failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DbError::unauthorized(format!(
                "Token validation failed with status {}",
                status
            )));
        }

        let body: ValidateTokenResponse = response.json().await.map_err(|e| {
            DbError::unauthorized(format!("Malformed token validation response: {}", e))
        })?;

        match body {
            ValidateTokenResponse {
                valid: true,
                user_id: Some(user_id),
                ..
            } if !user_id.is_empty() => Ok(user_id),
            ValidateTokenResponse { error, .. } => Err(DbError::unauthorized(
                error.unwrap_or_else(|| "Invalid token".to_string()),
            )),
        }
    }
}

/// Authentication middleware for `/api/db/*` routes.
pub async fn auth_middleware(
    State(resolver): State<Arc<dyn TokenResolver>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = match extract_bearer_token(&request) {
        Ok(token) => token.to_string(),
        Err(e) => {
            warn!(error = %e, "Authentication failed");
            return e.into_response();
        }
    };

    match resolver.resolve(&token).await {
        Ok(owner_id) => {
            debug!(owner_id = %owner_id, "Request authenticated");
            request.extensions_mut().insert(OwnerId(owner_id));
            next.run(request).await
        }
        Err(e) => {
            warn!(token_prefix = %mask_token(&token), error = %e, "Authentication failed");
            e.into_response()
        }
    }
}

fn extract_bearer_token(request: &Request<Body>) -> DbResult<&str> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| DbError::unauthorized("Authorization token is required"))?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| DbError::unauthorized("Authorization header contains invalid characters"))?;

    let token = auth_str.strip_prefix("Bearer ").ok_or_else(|| {
        DbError::unauthorized("Invalid Authorization header format. Expected 'Bearer <token>'")
    })?;

    let token = token.trim();
    if token.is_empty() {
        return Err(DbError::unauthorized("Bearer token is empty"));
    }
    Ok(token)
}

fn mask_token(token: &str) -> String {
    match token.char_indices().nth(3) {
        Some((idx, _)) => format!("{}***", &token[..idx]),
        None => "***".to_string(),
    }
}
