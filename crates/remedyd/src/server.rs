//! HTTP server for remedyd

use crate::engine::Engine;
use crate::routes;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Request bodies are small JSON documents
const BODY_LIMIT: usize = 64 * 1024;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Full API router. `request_timeout` bounds handlers that wait on
/// collaborators, such as detection and wizard start.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::issue_routes())
        .merge(routes::wizard_routes())
        .merge(routes::action_routes())
        .with_state(Arc::new(state))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until shutdown is signalled
pub async fn run(
    app: Router,
    listen: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("  Listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender also means shutdown
            let _ = shutdown.changed().await;
        })
        .await
        .context("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}
