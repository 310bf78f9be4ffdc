//! Fan-out of session events to connected participants.

use crate::websocket::ServerMessage;

/// Delivers session events to everyone connected to a session.
///
/// Publishing never blocks and never fails the caller: delivery is
/// fire-and-forget, and the return value is the number of recipients.
pub trait Broadcaster: Send + Sync {
    /// Send `message` to the connections of `session_id`, skipping those of
    /// the `origin` user when given.
    fn publish(&self, session_id: &str, origin: Option<&str>, message: ServerMessage) -> usize;
}
