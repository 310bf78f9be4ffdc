//! WebSocket connection manager.
//!
//! Tracks live connections per session and implements [`Broadcaster`] on top
//! of them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ServerMessage;
use crate::sessions::Broadcaster;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs per session.
    by_session: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a connection of `user_id` to `session_id`.
    ///
    /// Returns the connection ID.
    pub fn register(&self, session_id: &str, user_id: &str, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                sender,
            },
        );
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .push(conn_id.clone());

        tracing::info!(
            conn_id = %conn_id,
            session_id = %session_id,
            user_id = %user_id,
            "WebSocket connection registered"
        );

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_session.get_mut(&conn.session_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_session.remove(&conn.session_id);
                }
            }

            tracing::info!(
                conn_id = %conn_id,
                session_id = %conn.session_id,
                user_id = %conn.user_id,
                "WebSocket connection unregistered"
            );
        }
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of connections to one session.
    pub fn session_connection_count(&self, session_id: &str) -> usize {
        self.by_session
            .get(session_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

impl Broadcaster for ConnectionManager {
    fn publish(&self, session_id: &str, origin: Option<&str>, message: ServerMessage) -> usize {
        let Some(conn_ids) = self.by_session.get(session_id).map(|ids| ids.clone()) else {
            return 0;
        };

        let mut sent_count = 0;
        for conn_id in &conn_ids {
            if let Some(conn) = self.connections.get(conn_id) {
                if origin == Some(conn.user_id.as_str()) {
                    continue;
                }
                if conn.sender.send(message.clone()).is_ok() {
                    sent_count += 1;
                }
            }
        }

        tracing::debug!(
            session_id = %session_id,
            message = message.kind(),
            recipients = sent_count,
            "Broadcast message to connections"
        );

        sent_count
    }
}
