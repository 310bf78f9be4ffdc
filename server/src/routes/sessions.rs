//! Session endpoint routes.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use timetable_engine::{
    ChangeLogEntry, DocumentId, DocumentSnapshot, EditReport, ItemLock, Operation, Participant,
    SessionStatus, SiteId, UserId, VectorClock,
};

use crate::error::{AppError, Result};
use crate::extract::{AppJson, AppQuery};
use crate::handlers::handle_websocket_connection;
use crate::sessions::{now_ms, ReconcileReport};
use crate::AppState;

/// Default number of entries for the change log.
const DEFAULT_CHANGE_LIMIT: usize = 50;

/// Maximum number of entries for the change log.
const MAX_CHANGE_LIMIT: usize = 1000;

fn default_role() -> String {
    "member".to_string()
}

/// Create session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/join", post(join_session))
        .route("/sessions/{id}/leave", post(leave_session))
        .route("/sessions/{id}/status", get(session_status))
        .route("/sessions/{id}/edits", post(apply_edit))
        .route("/sessions/{id}/changes", get(change_log))
        .route("/sessions/{id}/reconcile", post(reconcile))
        .route(
            "/sessions/{id}/locks/{item_id}",
            post(acquire_lock).delete(release_lock),
        )
        .route("/sessions/{id}/checkpoint", post(checkpoint))
        .route("/sessions/{id}/ws", get(websocket))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// Document to open; a new one is created when absent
    #[serde(default)]
    pub document_id: Option<DocumentId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub document_id: DocumentId,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub status: &'static str,
    pub session: SessionStatus,
}

/// Identifies the acting participant.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveResponse {
    pub status: &'static str,
    pub participant: Participant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub user_id: UserId,
    pub operation: Operation,
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub remote_site_id: SiteId,
    /// Replica to merge; the stored replica of `remote_site_id` when absent
    #[serde(default)]
    pub snapshot: Option<DocumentSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub status: &'static str,
    pub document_id: DocumentId,
    pub item_count: usize,
    pub vector_clock: VectorClock,
}

/// POST /sessions
async fn create_session(
    State(state): State<AppState>,
    AppJson(request): AppJson<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>> {
    require("userId", &request.user_id)?;

    let status = state
        .sessions
        .create_session(
            request.document_id,
            &request.user_id,
            &request.user_name,
            &request.role,
            now_ms(),
        )
        .await?;

    Ok(Json(CreateSessionResponse {
        session_id: status.session_id,
        document_id: status.document_id,
        participants: status.participants,
    }))
}

/// POST /sessions/{id}/join
async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(request): AppJson<JoinRequest>,
) -> Result<Json<JoinResponse>> {
    require("userId", &request.user_id)?;

    let session = state
        .sessions
        .join_session(&id, &request.user_id, &request.user_name, &request.role, now_ms())
        .await?;

    Ok(Json(JoinResponse {
        status: "joined",
        session,
    }))
}

/// POST /sessions/{id}/leave
async fn leave_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(request): AppJson<UserRequest>,
) -> Result<Json<LeaveResponse>> {
    let participant = state
        .sessions
        .leave_session(&id, &request.user_id, now_ms())
        .await?;

    Ok(Json(LeaveResponse {
        status: "left",
        participant,
    }))
}

/// GET /sessions/{id}/status
async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>> {
    Ok(Json(state.sessions.get_status(&id, now_ms()).await?))
}

/// POST /sessions/{id}/edits
///
/// Conflicts that need a decision come back as a `conflict` report, not an
/// error.
async fn apply_edit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(request): AppJson<EditRequest>,
) -> Result<Json<EditReport>> {
    let report = state
        .sessions
        .apply_edit(&id, &request.user_id, request.operation, now_ms())
        .await?;
    Ok(Json(report))
}

/// GET /sessions/{id}/changes?limit=
async fn change_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<ChangesQuery>,
) -> Result<Json<Vec<ChangeLogEntry>>> {
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_CHANGE_LIMIT))
        .unwrap_or(DEFAULT_CHANGE_LIMIT);

    Ok(Json(state.sessions.get_change_log(&id, limit).await?))
}

/// POST /sessions/{id}/reconcile
async fn reconcile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppJson(request): AppJson<ReconcileRequest>,
) -> Result<Json<ReconcileReport>> {
    require("remoteSiteId", &request.remote_site_id)?;

    let report = state
        .sessions
        .reconcile(&id, &request.remote_site_id, request.snapshot, now_ms())
        .await?;
    Ok(Json(report))
}

/// POST /sessions/{id}/locks/{item_id}
async fn acquire_lock(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(String, String)>,
    AppJson(request): AppJson<UserRequest>,
) -> Result<Json<ItemLock>> {
    let lock = state
        .sessions
        .acquire_lock(&id, &request.user_id, &item_id, now_ms())
        .await?;
    Ok(Json(lock))
}

/// DELETE /sessions/{id}/locks/{item_id}
async fn release_lock(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(String, String)>,
    AppJson(request): AppJson<UserRequest>,
) -> Result<Json<ReleaseResponse>> {
    let released = state
        .sessions
        .release_lock(&id, &request.user_id, &item_id, now_ms())
        .await?;
    Ok(Json(ReleaseResponse { released }))
}

/// POST /sessions/{id}/checkpoint
async fn checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CheckpointResponse>> {
    let snapshot = state.sessions.checkpoint(&id, now_ms()).await?;
    Ok(Json(CheckpointResponse {
        status: "saved",
        item_count: snapshot.active_item_count(),
        document_id: snapshot.document_id,
        vector_clock: snapshot.clock,
    }))
}

/// GET /sessions/{id}/ws?userId=
async fn websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    AppQuery(query): AppQuery<UserRequest>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if !state.sessions.is_participant(&id, &query.user_id).await? {
        return Err(timetable_engine::Error::UserNotInSession {
            session_id: id,
            user_id: query.user_id,
        }
        .into());
    }

    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, id, query.user_id)))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}
