//! HTTP server for metrics and peer introspection.
//!
//! Runs on a separate tokio task and serves:
//! - `/metrics` for Prometheus scraping
//! - `/peers` with the aggregated peer list as JSON
//! - `/status` with the aggregate connection status and election role

use crate::aggregator::{AggregatedPeer, StrategyAggregator};
use crate::election::Role;
use crate::strategy::ConnectionStatus;
use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HttpState {
    pub aggregator: Arc<StrategyAggregator>,
    /// Election role, when the LAN strategy runs an election.
    pub role: Option<watch::Receiver<Role>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    pub peers: usize,
    pub strategies: Vec<String>,
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

async fn peers_handler(State(state): State<HttpState>) -> Json<Vec<AggregatedPeer>> {
    Json(state.aggregator.peers())
}

async fn status_handler(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.aggregator.status(),
        role: state.role.as_ref().map(|rx| rx.borrow().as_str()),
        peers: state.aggregator.peers().len(),
        strategies: state.aggregator.strategy_ids(),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/peers", get(peers_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Run the HTTP server until `cancel` fires.
///
/// Binds to `0.0.0.0:port`. This is a long-running task that should be
/// spawned in the background.
pub async fn run_http_server(port: u16, state: HttpState, cancel: CancellationToken) {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }
}
