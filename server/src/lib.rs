//! Timetable Server - hosts collaborative editing sessions over a shared
//! timetable document.
//!
//! Participants join sessions over HTTP, submit edits, and follow each
//! other's changes over a WebSocket. Offline replicas are merged back with
//! the engine's reconciliation. All scheduling semantics live in
//! `timetable-engine`; this crate adds concurrency, transport, persistence
//! and configuration.

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod routes;
pub mod sessions;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::DocumentStore;
use crate::sessions::SessionManager;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    /// Wire the session manager to the connection manager as its broadcaster.
    pub fn new(config: Config, store: DocumentStore) -> Self {
        let connections = ConnectionManager::new_shared();
        let sessions = Arc::new(SessionManager::new(
            store,
            connections.clone(),
            config.session_config(),
            config.site_id.clone(),
        ));
        Self {
            config: Arc::new(config),
            sessions,
            connections,
        }
    }
}

/// Build the application router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
