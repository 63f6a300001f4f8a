use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::server::ExperimentServer;
use crate::telemetry::{emit, TelemetryKind};

/// Outbound queue depth per connection. Bursts beyond this drop with a
/// warning rather than applying backpressure to the game loop.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub(super) async fn handle_socket(socket: WebSocket, server: Arc<ExperimentServer>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<ServerMessage>>(OUTBOUND_QUEUE_CAPACITY);

    let connection_id = server.attach_connection(tx);
    tracing::debug!(%connection_id, "WebSocket connection established");

    // Send task: drain the connection's outbound queue onto the socket.
    // Ends when the queue closes (eviction/cleanup) or the socket errors.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match serde_json::to_string(message.as_ref()) {
                Ok(json) => Message::Text(json.into()),
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Receive loop: parse inbound frames and hand them to the dispatcher.
    // A malformed frame is dropped with telemetry; the connection stays up.
    let max_size = server.config().max_message_size;
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%connection_id, error = %err, "WebSocket receive error");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                if text.len() > max_size {
                    tracing::warn!(
                        %connection_id,
                        size = text.len(),
                        max = max_size,
                        "inbound frame exceeds size limit"
                    );
                    server.send_error(
                        &connection_id,
                        format!("Message too large ({} bytes, max {max_size})", text.len()),
                        ErrorCode::MessageTooLarge,
                    );
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(message) => {
                        server.handle_client_message(connection_id, message).await;
                    }
                    Err(err) => {
                        tracing::warn!(%connection_id, error = %err, "malformed inbound message dropped");
                        emit(TelemetryKind::MalformedMessage)
                            .details(serde_json::json!({
                                "connection_id": connection_id.to_string(),
                                "error": err.to_string(),
                            }))
                            .emit();
                    }
                }
            }
            Message::Binary(_) => {
                tracing::warn!(%connection_id, "binary frames are not part of the protocol");
            }
            Message::Close(_) => break,
            // Transport-level ping/pong is handled by the socket layer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    server.handle_connection_drop(connection_id).await;
    send_task.abort();
    tracing::debug!(%connection_id, "WebSocket connection closed");
}
