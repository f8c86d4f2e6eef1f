//! Session synchronization core.
//!
//! This module keeps one authoritative document per session consistent across
//! any number of concurrently editing clients. It provides:
//! - A per-session store with an atomic compare-and-increment write path
//! - A participant registry for presence, colors and cursors
//! - A change broadcaster fanning out document and presence updates
//! - The wire protocol shared by the HTTP, SSE and WebSocket surfaces

pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::ChangeBroadcaster;
pub use presence::ParticipantRegistry;
pub use server::{JoinPolicy, SyncServer, SyncServerConfig};
pub use session::SessionStore;

/// Unique identifier for a session
pub type SessionId = String;

/// Unique identifier for a participant, assigned by the registry at join time
pub type ParticipantId = String;

/// Opaque per-client token used for echo suppression.
///
/// Distinct from [`ParticipantId`]: a participant may reconnect with a new token.
pub type ClientId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Participant with this name already exists: {0}")]
    DuplicateParticipant(String),

    #[error("Session is full: {0}")]
    SessionFull(SessionId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::storage::StorageError> for SyncError {
    fn from(err: crate::storage::StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
