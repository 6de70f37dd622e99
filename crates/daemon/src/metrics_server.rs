//! Status HTTP server for loopcast
//!
//! Exposes the pipeline snapshot via HTTP for the dashboard and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{PipelineSnapshot, SharedStatus};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {addr}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("Failed to bind to address: {0}")]
    BindError(#[source] std::io::Error),

    #[error("Status server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handler for GET /status endpoint
/// Returns the current PipelineSnapshot as JSON
async fn get_status(State(status): State<SharedStatus>) -> Json<PipelineSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status HTTP server on `bind_addr` until `cancel` fires
///
/// # Arguments
/// * `status` - Shared snapshot to serve
/// * `bind_addr` - `host:port` to listen on
/// * `cancel` - Shutdown trigger
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if the address is unusable or serving fails
pub async fn run_status_server(
    status: SharedStatus,
    bind_addr: &str,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind_addr.parse().map_err(|e: std::net::AddrParseError| {
        ServerError::InvalidAddr {
            addr: bind_addr.to_string(),
            reason: e.to_string(),
        }
    })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ServerError::BindError)?;
    info!(addr = %addr, "status endpoint listening");

    let app = create_status_router(status);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}
