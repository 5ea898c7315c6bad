//! Relay connection handler.
//!
//! `GET /signal` upgrades to a WebSocket and hands it to a relay session.
//! Clients must send `join-stream` as their first frame.

use crate::relay::serve_websocket;
use crate::routes::AppState;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};
use common::protocol::MAX_FRAME_BYTES;
use std::sync::Arc;

/// Handler for GET /signal
#[tracing::instrument(skip_all, name = "relay.handlers.signal_upgrade")]
pub async fn signal_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let ctx = state.relay.clone();
    // Oversized frames still reach the session so the client gets an error frame
    ws.max_message_size(MAX_FRAME_BYTES * 2)
        .on_upgrade(move |socket| serve_websocket(socket, ctx))
}
