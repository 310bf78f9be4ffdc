//! WebSocket handler for live collaboration.
//!
//! Each socket belongs to one participant of one session. Outgoing events
//! arrive through the connection manager's channel; incoming messages are
//! edits, cursor moves and pings.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::sessions::now_ms;
use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
///
/// Disconnecting does not leave the session; silent participants are
/// removed by the reaper.
pub async fn handle_websocket_connection(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    user_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = state.connections.register(&session_id, &user_id, tx);

    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        user_id = %user_id,
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, ServerMessage::SessionClosed { .. });
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
            if closing {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) = process_message(&text, &state, &session_id, &user_id).await
                {
                    state.connections.send_to(&conn_id, response);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    state.connections.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        user_id = %user_id,
        active_connections = state.connections.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply for this connection, if any.
async fn process_message(
    text: &str,
    state: &AppState,
    session_id: &str,
    user_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                format!("Invalid message format: {}", e),
                None,
            ));
        }
    };

    match client_msg {
        ClientMessage::Edit {
            operation,
            request_id,
        } => {
            match state
                .sessions
                .apply_edit(session_id, user_id, operation, now_ms())
                .await
            {
                Ok(report) => Some(ServerMessage::EditResult { report, request_id }),
                Err(e) => Some(ServerMessage::error(e.to_string(), request_id)),
            }
        }

        ClientMessage::Cursor { cursor } => {
            match state
                .sessions
                .update_cursor(session_id, user_id, cursor, now_ms())
                .await
            {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::error(e.to_string(), None)),
            }
        }

        ClientMessage::Ping => {
            // Keeps the participant from being swept as silent.
            if let Err(e) = state.sessions.touch(session_id, user_id, now_ms()).await {
                return Some(ServerMessage::error(e.to_string(), None));
            }
            Some(ServerMessage::Pong)
        }
    }
}
