//! Axum app: router and WebSocket upgrade handler.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};

use crate::hub::SubscriptionHub;

pub fn router(hub: Arc<SubscriptionHub>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<SubscriptionHub>>) -> Response {
    ws.on_upgrade(move |socket| hub.handle_connection(socket))
}
