//! Rendezvous relay for the mesh.
//!
//! Every websocket connection gets a fresh [`PeerId`] and a `PEERS`
//! envelope listing the peers already connected. Negotiation envelopes are
//! forwarded to their `target` with `sender` overwritten by the relay. The
//! relay never inspects the negotiation payloads it carries.

pub mod config;
pub mod registry;
pub mod router;
mod websocket;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub use registry::{ConnectionRegistry, Delivery, Outbound};
pub use router::{RouteError, SignalingRouter};
pub use signal_proto::PeerId;

#[derive(Clone, Default)]
pub struct RelayState {
    pub router: SignalingRouter,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    connections: usize,
    next_identity: u64,
}

/// Build the relay HTTP surface. The websocket endpoint is served on both
/// `/` and `/ws`.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state.router))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let registry = state.router.registry();
    Json(StatsResponse {
        connections: registry.len(),
        next_identity: registry.next_id().as_u64(),
    })
}
