use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::relay::Relay;

/// HTTP surface of the relay: the WebSocket upgrade plus a health check.
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(health_check))
        .with_state(relay)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(relay): State<Relay>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "participants": relay.participant_count(),
    }))
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Drive one participant connection from registration to `peer-left`.
async fn handle_socket(socket: WebSocket, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let participant = relay.connect(tx);

    let writer_id = participant.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(target = "mesh::relay", id = %writer_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                relay.relay(&participant, &text);
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    relay.relay(&participant, &text);
                }
                Err(_) => {
                    debug!(target = "mesh::relay", id = %participant, "ignoring non-UTF8 binary frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(target = "mesh::relay", id = %participant, error = %err, "websocket error");
                break;
            }
        }
    }

    relay.disconnect(&participant);
    writer.abort();
}
