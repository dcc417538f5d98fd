//! HTTP surface for the parley assistant: the chat API plus a health check.

pub mod bootstrap;
pub mod chat;
pub mod health;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::HeaderValue;
use axum::Router;
use parley_core::config::{AppConfig, LoadOptions, LogFormat, ServerConfig};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bootstrap::Application;
use crate::chat::ChatState;
use crate::health::HealthState;

/// Installs the global subscriber. `logging.level` accepts any `EnvFilter`
/// directive, e.g. `info,parley_agent=debug`.
pub fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

pub fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    event_name = "system.server.invalid_origin",
                    correlation_id = "bootstrap",
                    origin = %origin,
                    "ignoring allowed origin that is not a valid header value"
                );
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn app_router(app: &Application) -> Router {
    let chat = chat::router(ChatState { runtime: Arc::clone(&app.runtime) });
    let health = health::router(HealthState {
        db_pool: app.db_pool.clone(),
        registry: Arc::clone(app.runtime.registry()),
    });
    chat.merge(health).layer(cors_layer(&app.config.server))
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        operation_count = app.runtime.registry().len(),
        "parley-server listening"
    );

    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, app_router(&app))
            .with_graceful_shutdown(async move { stop_signal.cancelled().await })
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => {
            app.shutdown().await;
            joined??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "draining in-flight requests"
    );
    stop.cancel();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => joined??,
        Err(_) => {
            warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                "in-flight requests did not finish before the grace period"
            );
            server.abort();
        }
    }

    app.shutdown().await;
    info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "parley-server stopped"
    );
    Ok(())
}
