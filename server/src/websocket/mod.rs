//! WebSocket support for live collaboration.
//!
//! Participants connect per session and receive the session's events as
//! they are committed. They can also submit edits and cursor moves over the
//! same socket.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
