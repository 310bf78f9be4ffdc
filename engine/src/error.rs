//! Error types for the timetable engine.

use crate::{ConflictRecord, ItemId, OperationId, SessionId, UserId, Version};
use thiserror::Error;

/// Broad category of an [`Error`], used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; rejected immediately and never logged as a conflict.
    Validation,
    /// The document moved underneath the caller; resubmit after resolution.
    Conflict,
    /// An item lock is held by someone else; retry with backoff.
    LockTimeout,
    /// Reconciliation left conflicts that need a decision.
    SyncDivergence,
    /// The session or participant does not exist (anymore).
    NotFound,
    /// Internal state is inconsistent.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::SyncDivergence => "sync_divergence",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// All possible errors from the timetable engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid time slot: {0}")]
    InvalidTimeSlot(String),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Conflict errors
    #[error("item already exists: {0}")]
    ItemAlreadyExists(ItemId),

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: Version, actual: Version },

    #[error("operation on deleted item: {0}")]
    OperationOnDeleted(ItemId),

    #[error("user {user_id} already joined session {session_id}")]
    DuplicateParticipant {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("operation {op_id} still conflicts after {attempts} resolution attempts")]
    UnresolvedConflict { op_id: OperationId, attempts: usize },

    // Lock errors
    #[error("item {item_id} is locked by {holder}, retry in {retry_after_ms}ms")]
    LockHeld {
        item_id: ItemId,
        holder: UserId,
        retry_after_ms: u64,
    },

    // Sync errors
    #[error("reconciliation left {} unresolved conflicts ({applied} operations applied)", conflicts.len())]
    SyncDivergence {
        conflicts: Vec<ConflictRecord>,
        applied: usize,
    },

    // Session errors
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("user {user_id} is not in session {session_id}")]
    UserNotInSession {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("session is closed: {0}")]
    SessionClosed(SessionId),

    // Fatal
    #[error("corrupted vector clock: {0}")]
    CorruptClock(String),
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOperation(_)
            | Error::MissingField(_)
            | Error::InvalidTimeSlot(_)
            | Error::ItemNotFound(_)
            | Error::InvalidSnapshot(_) => ErrorKind::Validation,
            Error::ItemAlreadyExists(_)
            | Error::VersionMismatch { .. }
            | Error::OperationOnDeleted(_)
            | Error::DuplicateParticipant { .. }
            | Error::UnresolvedConflict { .. } => ErrorKind::Conflict,
            Error::LockHeld { .. } => ErrorKind::LockTimeout,
            Error::SyncDivergence { .. } => ErrorKind::SyncDivergence,
            Error::SessionNotFound(_)
            | Error::UserNotInSession { .. }
            | Error::SessionClosed(_) => ErrorKind::NotFound,
            Error::CorruptClock(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::LockTimeout)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
