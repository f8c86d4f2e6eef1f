//! CodeLive session server.
//!
//! The session synchronization core of a collaborative interview editor:
//! - One authoritative document per session with version-gated
//!   last-writer-wins writes
//! - Participant presence with cursors, typing and online status
//! - Ordered, lossy push streams for document and presence changes
//! - A client-side sync agent that debounces edits, suppresses its own
//!   echoes and adopts the authoritative state on conflict

pub mod api;
pub mod client;
pub mod config;
pub mod language;
pub mod storage;
pub mod sync;
