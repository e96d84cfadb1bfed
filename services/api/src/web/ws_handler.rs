//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//! Incoming frames are handed to the connection; everything going out is
//! written by a single writer task so audio frames never interleave.

use crate::web::{
    client::{ClientLink, Outbound},
    connection::Connection,
    middleware::UserId,
    protocol::{ClientMessage, ServerMessage},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(UserId(user_id)): Extension<UserId>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: Option<uuid::Uuid>) {
    info!(?user_id, "New WebSocket connection established.");

    let (sender, mut receiver) = socket.split();
    let (link, outbound) = ClientLink::channel();
    let writer = tokio::spawn(write_outbound(sender, outbound));
    let mut connection = Connection::new(app_state, user_id, link);

    // --- Main Message Loop ---
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => connection.handle(message).await,
                Err(e) => {
                    warn!("Failed to deserialize client message: {}", e);
                    connection.report("Unrecognized message.");
                }
            },
            Some(Ok(Message::Binary(data))) => connection.push_audio(&data),
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive failed: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- Cleanup ---
    connection.close().await;
    drop(connection);
    writer.abort();
    info!("WebSocket connection closed.");
}

/// Drains the connection's outbound queue into the socket until either side goes away.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let (message, audio) = match item {
            Outbound::Text(message) => (message, None),
            Outbound::WithAudio(message, audio) => (message, Some(audio)),
        };
        if send_json(&mut sender, &message).await.is_err() {
            break;
        }
        if let Some(audio) = audio {
            if let Err(e) = sender.send(Message::Binary(audio)).await {
                error!("Failed to send audio frame: {}", e);
                break;
            }
        }
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|e| {
        error!("Failed to send message: {}", e);
        e
    })
}
