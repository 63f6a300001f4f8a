use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;

use crate::server::ExperimentServer;

use super::connection::handle_socket;

/// Upgrade an HTTP request into the bidirectional message channel.
pub(super) async fn ws_handler(
    State(server): State<Arc<ExperimentServer>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}
