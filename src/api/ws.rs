//! WebSocket transport: one socket carries both push streams and the write path.
//!
//! Outgoing frames always use the binary codec. Incoming frames may be binary
//! or JSON text; anything undecodable is logged and dropped without closing
//! the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ApiError, AppState};
use crate::sync::broadcast::{DocumentStream, PresenceStream};
use crate::sync::presence::{Participant, ParticipantPatch};
use crate::sync::protocol::{
    ClientMessage, EditAccepted, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
};
use crate::sync::session::{Session, WriteOutcome};
use crate::sync::{ParticipantId, SyncError};

/// WebSocket upgrade handler. Unknown sessions are refused before upgrading.
pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let subscriptions = state.sync.subscribe_session(&session_id).and_then(|doc| {
        let presence = state.sync.subscribe_presence(&session_id)?;
        Ok((doc, presence))
    });

    match subscriptions {
        Ok(((session, documents), (participants, presence))) => {
            info!(session_id = %session_id, "WebSocket upgrade request");
            let subscriptions = Subscriptions {
                session,
                participants,
                documents,
                presence,
            };
            ws.on_upgrade(move |socket| handle_websocket(socket, session_id, state, subscriptions))
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Participants joined over one socket and not yet left
type JoinedList = Arc<Mutex<Vec<ParticipantId>>>;

struct Subscriptions {
    session: Session,
    participants: Vec<Participant>,
    documents: DocumentStream,
    presence: PresenceStream,
}

async fn handle_websocket(
    socket: WebSocket,
    session_id: String,
    state: Arc<AppState>,
    subscriptions: Subscriptions,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let Subscriptions {
        session,
        participants,
        mut documents,
        mut presence,
    } = subscriptions;

    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        session,
        participants,
        server_time: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = send_server_message(&mut ws_sender, &welcome).await {
        warn!(session_id = %session_id, "Failed to send welcome: {}", e);
        return;
    }

    // Replies to this socket's own requests
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.recv() => msg,
                Some(change) = documents.next() => ServerMessage::DocumentChanged(change),
                Some(list) = presence.next() => ServerMessage::Participants(list.as_ref().clone()),
                else => break,
            };

            if let Err(e) = send_server_message(&mut ws_sender, &msg).await {
                debug!(session_id = %send_session, "Send failed, closing: {}", e);
                break;
            }
        }
    });

    let joined: JoinedList = Arc::new(Mutex::new(Vec::new()));

    let recv_session = session_id.clone();
    let recv_state = state.clone();
    let recv_joined = joined.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                Message::Text(text) => SyncProtocol::decode_client_text(&text),
                Message::Close(_) => {
                    debug!(session_id = %recv_session, "WebSocket closed by client");
                    break;
                }
                // Ping/pong are answered by the socket itself
                _ => continue,
            };

            match decoded {
                Ok(client_msg) => {
                    let reply = handle_client_message(
                        client_msg,
                        &recv_session,
                        &recv_state,
                        &mut recv_joined.lock(),
                    );
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(session_id = %recv_session, "Dropping malformed frame: {}", e);
                }
            }
        }
    });

    close_connection(send_task, recv_task, &joined, &session_id, &state).await;
    info!(session_id = %session_id, "WebSocket disconnected");
}

/// Wait for either half of the socket to end and stop the other one.
///
/// Participants that joined over this socket and never left go offline,
/// whichever half ended first.
async fn close_connection(
    mut send_task: JoinHandle<()>,
    mut recv_task: JoinHandle<()>,
    joined: &JoinedList,
    session_id: &str,
    state: &AppState,
) {
    let send_finished = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
    };
    let other = if send_finished { recv_task } else { send_task };
    other.abort();
    // Wait it out so nothing joins after the list is taken.
    let _ = other.await;

    let offline = ParticipantPatch {
        is_online: Some(false),
        ..Default::default()
    };
    let joined = std::mem::take(&mut *joined.lock());
    for participant_id in joined {
        if let Err(e) = state
            .sync
            .patch_participant(session_id, &participant_id, offline.clone())
        {
            debug!(session_id, participant_id = %participant_id, "Could not mark offline: {}", e);
        }
    }
}

/// Handle a decoded client message and produce the reply for this socket
fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    state: &Arc<AppState>,
    joined: &mut Vec<ParticipantId>,
) -> ServerMessage {
    let result = match msg {
        ClientMessage::SubmitEdit(request) => {
            state
                .sync
                .submit_edit(session_id, request)
                .map(|outcome| match outcome {
                    WriteOutcome::Accepted { version } => {
                        ServerMessage::EditAccepted(EditAccepted { version })
                    }
                    WriteOutcome::Conflict(conflict) => ServerMessage::EditConflict(conflict),
                })
        }

        ClientMessage::ChangeLanguage(request) => state
            .sync
            .change_language(session_id, request)
            .map(ServerMessage::LanguageChanged),

        ClientMessage::Join(request) => {
            state.sync.join(session_id, &request.name).map(|participant| {
                joined.push(participant.id.clone());
                ServerMessage::Joined(participant)
            })
        }

        ClientMessage::PatchParticipant {
            participant_id,
            patch,
        } => state
            .sync
            .patch_participant(session_id, &participant_id, patch)
            .map(ServerMessage::ParticipantUpdated),

        ClientMessage::Leave { participant_id } => {
            joined.retain(|id| id != &participant_id);
            state
                .sync
                .leave(session_id, &participant_id)
                .map(|removed| ServerMessage::Left {
                    participant_id,
                    removed,
                })
        }

        ClientMessage::Ping { timestamp } => Ok(ServerMessage::Pong {
            timestamp,
            server_time: chrono::Utc::now().timestamp(),
        }),
    };

    result.unwrap_or_else(|e: SyncError| {
        SyncProtocol::error_response(ErrorCode::from(&e), e.to_string())
    })
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = SyncProtocol::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}
