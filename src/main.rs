//! DB Session Proxy - Main entry point.
//!
//! Serves session-oriented SQL access to MySQL, PostgreSQL and SQLite over
//! HTTP, authenticating callers against the session service.

use db_session_proxy::auth::{SessionServiceResolver, TokenResolver};
use db_session_proxy::config::Config;
use db_session_proxy::service::ProxyService;
use db_session_proxy::transport::HttpTransport;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::parse_args();
    init_tracing(&config);

    if let Err(msg) = config.validate() {
        error!(error = %msg, "Invalid configuration");
        return Err(msg.into());
    }

    info!(
        addr = %config.http_bind_addr(),
        session_service = %config.session_service_url,
        session_ttl_secs = config.session_ttl,
        "Starting DB Session Proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    let resolver: Arc<dyn TokenResolver> = Arc::new(SessionServiceResolver::new(
        &config.session_service_url,
        config.auth_timeout_duration(),
    )?);
    let service = Arc::new(ProxyService::from_config(&config));

    let transport = HttpTransport::new(service, resolver, &config.http_host, config.http_port);
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
