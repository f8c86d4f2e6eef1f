//! Session document routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tracing::debug;

use super::{ApiResult, AppState};
use crate::sync::protocol::{
    CreateSessionRequest, EditAccepted, EditRequest, LanguageChanged, LanguageRequest,
    SessionSummary,
};
use crate::sync::session::{Session, WriteOutcome};

pub(super) async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state
        .sync
        .create_session(&payload.title, payload.language.as_deref())?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub(super) async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    Ok(Json(state.sync.list_sessions()?))
}

pub(super) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sync.get_session(&session_id)?))
}

/// 200 `{version}` when accepted, 409 `{version, code}` on a stale base
pub(super) async fn submit_edit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<EditRequest>,
) -> ApiResult<Response> {
    let response = match state.sync.submit_edit(&session_id, request)? {
        WriteOutcome::Accepted { version } => Json(EditAccepted { version }).into_response(),
        WriteOutcome::Conflict(conflict) => (StatusCode::CONFLICT, Json(conflict)).into_response(),
    };
    Ok(response)
}

pub(super) async fn change_language(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<LanguageRequest>,
) -> ApiResult<Json<LanguageChanged>> {
    Ok(Json(state.sync.change_language(&session_id, request)?))
}

/// Server-sent document stream: one `data:` event per accepted change
pub(super) async fn document_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let changes = state.sync.subscribe_documents(&session_id)?;
    debug!(session_id = %session_id, "SSE document stream opened");

    let events = changes.map(|change| Event::default().json_data(&change));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{send, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::language::Language;
    use crate::sync::SyncServerConfig;

    #[tokio::test]
    async fn test_create_and_fetch() {
        let (app, _) = test_app(SyncServerConfig::default());

        let (status, created) = send(
            &app,
            "POST",
            "/v1/sessions",
            Some(json!({"title": "Interview", "language": "python"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["version"], 0);
        assert_eq!(created["language"], "python");
        assert_eq!(created["code"], Language::Python.template());
        assert!(created["lastClientId"].is_null());

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(&app, "GET", &format!("/v1/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["title"], "Interview");

        let (status, list) = send(&app, "GET", "/v1/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_unsupported_language() {
        let (app, _) = test_app(SyncServerConfig::default());
        let (status, body) = send(
            &app,
            "POST",
            "/v1/sessions",
            Some(json!({"title": "x", "language": "cobol"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_edit_then_conflict() {
        let (app, sync) = test_app(SyncServerConfig::default());
        let id = sync.create_session("Interview", None).unwrap().id;
        let uri = format!("/v1/sessions/{}", id);

        let (status, body) = send(
            &app,
            "PUT",
            &uri,
            Some(json!({"code": "B", "version": 0, "clientId": "client-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"version": 1}));

        let (status, body) = send(
            &app,
            "PUT",
            &uri,
            Some(json!({"code": "C", "version": 0, "clientId": "client-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"version": 1, "code": "B"}));
    }

    #[tokio::test]
    async fn test_edit_unknown_session() {
        let (app, _) = test_app(SyncServerConfig::default());
        let (status, _) = send(
            &app,
            "PUT",
            "/v1/sessions/missing",
            Some(json!({"code": "B", "version": 0, "clientId": "c"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_change_language() {
        let (app, sync) = test_app(SyncServerConfig::default());
        let id = sync.create_session("Interview", None).unwrap().id;

        let (status, body) = send(
            &app,
            "PUT",
            &format!("/v1/sessions/{}/language", id),
            Some(json!({"language": "java"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);
        assert_eq!(body["code"], Language::Java.template());

        let (status, _) = send(
            &app,
            "PUT",
            &format!("/v1/sessions/{}/language", id),
            Some(json!({"language": "brainfuck"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_document_stream_delivers_changes() {
        let (app, sync) = test_app(SyncServerConfig::default());
        let id = sync.create_session("Interview", None).unwrap().id;

        let request = Request::builder()
            .uri(format!("/v1/sessions/{}/stream", id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        sync.submit_edit(
            &id,
            crate::sync::protocol::EditRequest {
                code: "B".to_string(),
                version: 0,
                client_id: "client-1".to_string(),
            },
        )
        .unwrap();

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"sourceClientId\":\"client-1\""));
        assert!(text.contains("\"version\":1"));
    }

    #[tokio::test]
    async fn test_document_stream_unknown_session() {
        let (app, _) = test_app(SyncServerConfig::default());
        let (status, _) = send(&app, "GET", "/v1/sessions/missing/stream", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
