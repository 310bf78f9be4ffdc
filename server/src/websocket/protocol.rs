//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded, tagged by `type` in snake_case.

use serde::{Deserialize, Serialize};
use timetable_engine::{
    ConflictRecord, CursorPosition, EditReport, Operation, Participant, Suggestion, UserId,
    Version,
};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit an edit as the connected user.
    Edit {
        operation: Operation,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Move the user's cursor.
    Cursor {
        #[serde(flatten)]
        cursor: CursorPosition,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of the client's own edit.
    EditResult {
        report: EditReport,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// An edit by another participant was committed.
    OperationApplied {
        operation: Operation,
        version: Version,
    },

    ParticipantJoined {
        participant: Participant,
    },

    ParticipantLeft {
        user_id: UserId,
    },

    CursorMoved {
        user_id: UserId,
        cursor: CursorPosition,
    },

    /// An edit needs a human decision.
    ManualInterventionRequired {
        user_id: UserId,
        op_id: String,
        conflicts: Vec<ConflictRecord>,
        suggestions: Vec<Suggestion>,
    },

    /// The session closed; the connection will not receive anything else.
    SessionClosed {
        session_id: String,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::EditResult { .. } => "edit_result",
            ServerMessage::OperationApplied { .. } => "operation_applied",
            ServerMessage::ParticipantJoined { .. } => "participant_joined",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::CursorMoved { .. } => "cursor_moved",
            ServerMessage::ManualInterventionRequired { .. } => "manual_intervention_required",
            ServerMessage::SessionClosed { .. } => "session_closed",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
