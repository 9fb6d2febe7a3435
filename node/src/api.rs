//! # Status API
//!
//! Builds the axum router that exposes an adjudicator's HTTP interface.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path       | Description                                |
//! |--------|------------|--------------------------------------------|
//! | GET    | `/health`  | Liveness probe                             |
//! | GET    | `/status`  | Height, phase, round readiness, cache use  |
//! | GET    | `/peers`   | Peer table with heartbeat ages             |

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use arbiter_protocol::consensus::PeerSummary;
use arbiter_protocol::{AdjudicatorNode, NodeStatus};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: every field sits behind an `Arc` or is a small string.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Network identifier (e.g. "devnet").
    pub network: String,
    /// The adjudicator this API reports on.
    pub node: Arc<AdjudicatorNode>,
    /// Refreshed from the node on every `/status` call.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub node: NodeStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub count: usize,
    pub fresh: usize,
    pub peers: Vec<PeerSummary>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the [`Router`] with all API routes, CORS, and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the process is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — the node's consensus position and cache usage.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = state.node.status();

    state.metrics.block_height.set(node.height as i64);
    state.metrics.connected_peers.set(node.connected_peers as i64);
    state.metrics.fresh_peers.set(node.fresh_peers as i64);

    Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        node,
    })
}

/// `GET /peers` — every peer row, sorted by address.
async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.node.status();
    Json(PeersResponse {
        count: status.connected_peers,
        fresh: status.fresh_peers,
        peers: status.peers,
    })
}
