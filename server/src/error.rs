//! Unified error handling for the server.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use timetable_engine::ErrorKind;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Engine(#[from] timetable_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status and machine-readable kind for this error.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Engine(e) => {
                let kind = e.kind();
                let status = match kind {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::Conflict | ErrorKind::SyncDivergence => StatusCode::CONFLICT,
                    ErrorKind::LockTimeout => StatusCode::LOCKED,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, kind.as_str())
            }
            AppError::BadRequest(_) | AppError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "validation")
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Database(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "fatal")
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.classify();

        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) => {
                if status.is_server_error() {
                    tracing::error!("Engine error: {:?}", e);
                } else {
                    tracing::warn!("Engine error: {:?}", e);
                }
                (e.to_string(), engine_details(e))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    "Internal server error".to_string(),
                    Some(serde_json::Value::String(msg.clone())),
                )
            }
            other => (other.to_string(), None),
        };

        let body = Json(ErrorResponse {
            status: "error",
            error: error_message,
            kind,
            details,
        });

        (status, body).into_response()
    }
}

/// Structured context for the engine errors a client can act on.
fn engine_details(error: &timetable_engine::Error) -> Option<serde_json::Value> {
    use timetable_engine::Error;

    match error {
        Error::LockHeld {
            item_id,
            holder,
            retry_after_ms,
        } => Some(serde_json::json!({
            "itemId": item_id,
            "holder": holder,
            "retryAfterMs": retry_after_ms,
        })),
        Error::VersionMismatch { expected, actual } => Some(serde_json::json!({
            "expected": expected,
            "actual": actual,
        })),
        Error::SyncDivergence { conflicts, applied } => Some(serde_json::json!({
            "conflicts": conflicts,
            "applied": applied,
        })),
        _ => None,
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_status() {
        let cases = [
            (
                timetable_engine::Error::InvalidOperation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                timetable_engine::Error::SessionNotFound("s-1".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                timetable_engine::Error::VersionMismatch {
                    expected: 1,
                    actual: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                timetable_engine::Error::LockHeld {
                    item_id: "cs101".into(),
                    holder: "alice".into(),
                    retry_after_ms: 10,
                },
                StatusCode::LOCKED,
            ),
            (
                timetable_engine::Error::CorruptClock("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(AppError::from(error).classify().0, expected);
        }
    }

    #[test]
    fn test_kind_names() {
        let err = AppError::from(timetable_engine::Error::LockHeld {
            item_id: "cs101".into(),
            holder: "alice".into(),
            retry_after_ms: 10,
        });
        assert_eq!(err.classify().1, "lock_timeout");
        assert_eq!(AppError::BadRequest("x".into()).classify().1, "validation");
    }
}
