//! Transports a [`SyncAgent`](super::SyncAgent) talks through.
//!
//! [`HttpTransport`] speaks the `/v1` REST and SSE surface of a remote
//! server. [`LocalTransport`] calls an in-process [`SyncServer`] directly,
//! which is what embedders and tests use.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::sse;
use crate::sync::presence::{Participant, ParticipantPatch};
use crate::sync::protocol::{
    ConflictResponse, DocumentChange, EditAccepted, EditRequest, LanguageChanged, LanguageRequest,
};
use crate::sync::session::{Session, WriteOutcome};
use crate::sync::{SyncError, SyncServer};

/// Transport failures surfaced to the agent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request failed: {0}")]
    Request(String),

    /// The peer answered with something that does not decode
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Stream lost: {0}")]
    StreamLost(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Document stream as seen by a client. A `Malformed` item is recoverable,
/// any other error ends the stream.
pub type ChangeStream = BoxStream<'static, TransportResult<DocumentChange>>;

impl From<SyncError> for TransportError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::SessionNotFound(_) | SyncError::ParticipantNotFound(_) => {
                TransportError::NotFound(err.to_string())
            }
            other => TransportError::Request(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn fetch_session(&self, session_id: &str) -> TransportResult<Session>;

    async fn submit_edit(
        &self,
        session_id: &str,
        request: EditRequest,
    ) -> TransportResult<WriteOutcome>;

    async fn change_language(
        &self,
        session_id: &str,
        request: LanguageRequest,
    ) -> TransportResult<LanguageChanged>;

    async fn patch_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> TransportResult<Participant>;

    /// Open the document stream. Only changes committed after this returns
    /// are guaranteed to be delivered.
    async fn subscribe(&self, session_id: &str) -> TransportResult<ChangeStream>;
}

/// In-process transport over a shared [`SyncServer`]
#[derive(Clone)]
pub struct LocalTransport {
    server: Arc<SyncServer>,
}

impl LocalTransport {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }
}

#[async_trait]
impl SessionTransport for LocalTransport {
    async fn fetch_session(&self, session_id: &str) -> TransportResult<Session> {
        Ok(self.server.get_session(session_id)?)
    }

    async fn submit_edit(
        &self,
        session_id: &str,
        request: EditRequest,
    ) -> TransportResult<WriteOutcome> {
        Ok(self.server.submit_edit(session_id, request)?)
    }

    async fn change_language(
        &self,
        session_id: &str,
        request: LanguageRequest,
    ) -> TransportResult<LanguageChanged> {
        Ok(self.server.change_language(session_id, request)?)
    }

    async fn patch_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> TransportResult<Participant> {
        Ok(self
            .server
            .patch_participant(session_id, participant_id, patch)?)
    }

    async fn subscribe(&self, session_id: &str) -> TransportResult<ChangeStream> {
        let changes = self.server.subscribe_documents(session_id)?;
        Ok(changes.map(Ok).boxed())
    }
}

/// REST + SSE transport against a remote server
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Timeout for single requests. The document stream has none.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/v1/sessions/{}", self.base_url, session_id)
    }
}

/// Decode a success body, or turn the status into a [`TransportError`]
async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> TransportResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()));
    }

    let detail = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::NOT_FOUND => Err(TransportError::NotFound(format!("{}: {}", what, detail))),
        _ => Err(TransportError::Request(format!("{}: {}", what, detail))),
    }
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn fetch_session(&self, session_id: &str) -> TransportResult<Session> {
        let response = self
            .client
            .get(self.session_url(session_id))
            .timeout(self.request_timeout)
            .send()
            .await?;
        read_json(response, "fetch session").await
    }

    async fn submit_edit(
        &self,
        session_id: &str,
        request: EditRequest,
    ) -> TransportResult<WriteOutcome> {
        let response = self
            .client
            .put(self.session_url(session_id))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: ConflictResponse = response
                .json()
                .await
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            return Ok(WriteOutcome::Conflict(conflict));
        }

        let accepted: EditAccepted = read_json(response, "submit edit").await?;
        Ok(WriteOutcome::Accepted {
            version: accepted.version,
        })
    }

    async fn change_language(
        &self,
        session_id: &str,
        request: LanguageRequest,
    ) -> TransportResult<LanguageChanged> {
        let response = self
            .client
            .put(format!("{}/language", self.session_url(session_id)))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        read_json(response, "change language").await
    }

    async fn patch_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> TransportResult<Participant> {
        let response = self
            .client
            .patch(format!(
                "{}/participants/{}",
                self.session_url(session_id),
                participant_id
            ))
            .timeout(self.request_timeout)
            .json(&patch)
            .send()
            .await?;
        read_json(response, "patch participant").await
    }

    async fn subscribe(&self, session_id: &str) -> TransportResult<ChangeStream> {
        let response = self
            .client
            .get(format!("{}/stream", self.session_url(session_id)))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(TransportError::NotFound(format!("session {}", session_id)))
            }
            status => {
                return Err(TransportError::Request(format!(
                    "subscribe: {}",
                    status
                )))
            }
        }
        debug!(session_id, "Document stream connected");

        let changes = sse::data_events(response.bytes_stream()).map(|event| {
            event.and_then(|data| {
                serde_json::from_str::<DocumentChange>(&data)
                    .map_err(|e| TransportError::Malformed(e.to_string()))
            })
        });
        Ok(changes.boxed())
    }
}
