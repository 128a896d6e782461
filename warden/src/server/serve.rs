//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::WardenError;
use crate::server::handlers::{
    control_handler, health_handler, logs_handler, status_handler, version_handler,
    webhook_handler,
};
use crate::server::state::ServerState;

/// Routes of the control API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version of warden itself
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Supervised service
        .route("/status", get(status_handler))
        .route("/logs", get(logs_handler))
        .route("/control/{action}", post(control_handler))
        .route("/webhook", post(webhook_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), WardenError>>, WardenError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| WardenError::ServerError(format!("failed to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| WardenError::ServerError(e.to_string()))
    });

    Ok(handle)
}
