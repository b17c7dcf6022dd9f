//! Status HTTP server for the archive pipeline
//!
//! Exposes the metrics snapshot and the connectivity flag for dashboards and
//! for platform glue that reports network changes.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

use crate::connectivity::ConnectivityMonitor;
use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ServerState {
    pub metrics: SharedMetrics,
    pub connectivity: ConnectivityMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub online: bool,
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<ServerState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.metrics.read().await.clone();
    snapshot.online = state.connectivity.is_online();
    Json(snapshot)
}

async fn get_connectivity(State(state): State<ServerState>) -> Json<ConnectivityStatus> {
    Json(ConnectivityStatus {
        online: state.connectivity.is_online(),
    })
}

/// Handler for POST /connectivity
/// Parked uploads resume as soon as the flag turns online.
async fn set_connectivity(
    State(state): State<ServerState>,
    Json(status): Json<ConnectivityStatus>,
) -> Json<ConnectivityStatus> {
    state.connectivity.set_online(status.online);
    state.metrics.write().await.online = status.online;
    Json(status)
}

/// Creates the axum Router with the status endpoints
pub fn create_metrics_router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/connectivity", get(get_connectivity).post(set_connectivity))
        .with_state(state)
}

/// Runs the status HTTP server on `bind_addr`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if the address is invalid or the server fails to start
pub async fn run_metrics_server(state: ServerState, bind_addr: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind_addr.to_string()))?;
    let app = create_metrics_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status server listening");
    axum::serve(listener, app).await.map_err(ServerError::BindError)?;

    Ok(())
}
