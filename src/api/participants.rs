//! Participant and presence routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::{stream, Stream, StreamExt};
use std::sync::Arc;
use tracing::debug;

use super::{ApiResult, AppState};
use crate::sync::presence::{Participant, ParticipantPatch};
use crate::sync::protocol::JoinRequest;

pub(super) async fn list_participants(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<Participant>>> {
    Ok(Json(state.sync.participants(&session_id)?))
}

pub(super) async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<(StatusCode, Json<Participant>)> {
    let participant = state.sync.join(&session_id, &request.name)?;
    Ok((StatusCode::CREATED, Json(participant)))
}

pub(super) async fn patch_participant(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id)): Path<(String, String)>,
    Json(patch): Json<ParticipantPatch>,
) -> ApiResult<Json<Participant>> {
    let participant = state
        .sync
        .patch_participant(&session_id, &participant_id, patch)?;
    Ok(Json(participant))
}

/// Always 204: leaving twice, or leaving a vanished session, is success
pub(super) async fn leave_session(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.sync.leave(&session_id, &participant_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Server-sent presence stream. The first event is the current list, every
/// later event a full snapshot after a change.
pub(super) async fn presence_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let (snapshot, updates) = state.sync.subscribe_presence(&session_id)?;
    debug!(session_id = %session_id, "SSE presence stream opened");

    let events = stream::once(async move { Arc::new(snapshot) })
        .chain(updates)
        .map(|list| Event::default().json_data(list.as_slice()));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
