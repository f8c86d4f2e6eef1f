//! Client Sync Agent and its transports.
//!
//! A [`SyncAgent`] owns one client's view of a session. It coalesces local
//! edits and cursor moves with cancelable debounce timers, submits edits
//! against its last known version, adopts the authoritative snapshot on
//! conflict, and filters the document stream by version and client id.

pub mod agent;
pub mod debounce;
pub mod sse;
pub mod transport;

pub use agent::{AgentConfig, AgentEvent, EditPhase, LocalState, Notice, SyncAgent};
pub use debounce::Debouncer;
pub use transport::{
    ChangeStream, HttpTransport, LocalTransport, SessionTransport, TransportError,
    TransportResult,
};

use crate::sync::ClientId;

/// Generate an opaque client token used for echo suppression.
///
/// One token per agent; a participant reconnecting gets a new one.
pub fn generate_client_id() -> ClientId {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}
