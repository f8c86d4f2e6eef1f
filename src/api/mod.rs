//! HTTP, SSE and WebSocket surface over the sync core.
//!
//! All session routes live under `/v1`. Errors are returned as
//! `{"error": <message>, "code": <status>}`.

mod participants;
mod sessions;
mod ws;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::storage::StorageStats;
use crate::sync::protocol::PROTOCOL_VERSION;
use crate::sync::server::ServerStats;
use crate::sync::{SyncError, SyncServer};

/// Shared application state
pub struct AppState {
    pub sync: Arc<SyncServer>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(sync: Arc<SyncServer>) -> Self {
        Self {
            sync,
            started_at: Instant::now(),
        }
    }
}

/// A core error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SyncError::SessionNotFound(_) | SyncError::ParticipantNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SyncError::UnsupportedLanguage(_) | SyncError::InvalidMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::DuplicateParticipant(_) | SyncError::SessionFull(_) => StatusCode::CONFLICT,
            SyncError::Storage(_) | SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol_version: u8,
    uptime_seconds: u64,
    sync: ServerStats,
    storage: StorageStats,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sync: state.sync.stats(),
        storage: state.sync.storage().stats(),
    })
}

async fn index() -> &'static str {
    "CodeLive session server. API under /v1/sessions"
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let v1 = Router::new()
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/:session_id",
            get(sessions::get_session).put(sessions::submit_edit),
        )
        .route("/sessions/:session_id/language", put(sessions::change_language))
        .route("/sessions/:session_id/stream", get(sessions::document_stream))
        .route(
            "/sessions/:session_id/participants",
            get(participants::list_participants).post(participants::join_session),
        )
        .route(
            "/sessions/:session_id/participants/stream",
            get(participants::presence_stream),
        )
        .route(
            "/sessions/:session_id/participants/:participant_id",
            patch(participants::patch_participant).delete(participants::leave_session),
        )
        .route("/sessions/:session_id/ws", get(ws::ws_handler));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .nest("/v1", v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
