//! Authoritative session state and the version-gated write path.
//!
//! Each session lives in its own [`SessionCell`] behind a short per-session
//! mutex, so writers of different sessions never contend. The only way to
//! change `code` collaboratively is [`SessionStore::try_apply`], which performs
//! a single compare-and-increment: the proposal is accepted only when its base
//! version equals the stored version, otherwise the caller gets the current
//! authoritative snapshot back.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::protocol::{ConflictResponse, LanguageChanged};
use super::{ClientId, SessionId, SyncError, SyncResult};
use crate::language::Language;

/// The shared document of one interview session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub language: Language,
    pub code: String,
    /// Starts at 0 and increases by exactly one per accepted write
    pub version: u64,
    /// Client that produced the current version, if any
    pub last_client_id: Option<ClientId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>, language: Language) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            language,
            code: language.template().to_string(),
            version: 0,
            last_client_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A proposed whole-document write
#[derive(Debug, Clone)]
pub struct EditProposal {
    pub code: String,
    pub base_version: u64,
    pub client_id: ClientId,
}

/// Result of a version-gated write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The proposal was based on the current version and is now committed
    Accepted { version: u64 },
    /// The proposal was stale; carries the state stored at rejection time
    Conflict(ConflictResponse),
}

impl WriteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted { .. })
    }
}

/// One session's mutable state and its bookkeeping flags
#[derive(Debug)]
pub struct SessionCell {
    state: Mutex<Session>,
    dirty: AtomicBool,
    /// Set under `state` once the cell has left the store; writers holding a
    /// stale handle must reload instead of committing into it
    evicted: AtomicBool,
    last_active: Mutex<Instant>,
}

impl SessionCell {
    fn new(session: Session) -> Self {
        Self {
            state: Mutex::new(session),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> Session {
        self.state.lock().clone()
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        *self.last_active.lock() = Instant::now();
    }

    /// Check and clear the dirty flag
    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

/// In-memory store of all loaded sessions, keyed by session id
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionCell>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh session at version 0 seeded with the language template
    pub fn create(&self, title: impl Into<String>, language: Language) -> Session {
        let session = Session::new(title, language);
        self.insert(session.clone());
        session
    }

    /// Add a newly built session
    pub fn insert(&self, session: Session) {
        debug!(session_id = %session.id, "Session created in store");
        self.sessions
            .insert(session.id.clone(), Arc::new(SessionCell::new(session)));
    }

    /// Insert a session loaded from storage.
    ///
    /// Keeps the already-loaded copy if another caller won the race.
    pub fn restore(&self, session: Session) {
        self.sessions
            .entry(session.id.clone())
            .or_insert_with(|| Arc::new(SessionCell::new(session)));
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Current state of a session
    pub fn get(&self, session_id: &str) -> SyncResult<Session> {
        Ok(self.cell(session_id)?.snapshot())
    }

    /// Version-gated whole-document write.
    ///
    /// `on_commit` runs inside the session's critical section right after an
    /// accepted write, so anything it publishes is ordered by version.
    pub fn try_apply<F>(
        &self,
        session_id: &str,
        proposal: EditProposal,
        on_commit: F,
    ) -> SyncResult<WriteOutcome>
    where
        F: FnOnce(&Session),
    {
        let cell = self.cell(session_id)?;
        let mut session = cell.state.lock();
        if cell.is_evicted() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        if session.version != proposal.base_version {
            debug!(
                session_id,
                base_version = proposal.base_version,
                current_version = session.version,
                "Rejecting stale write"
            );
            return Ok(WriteOutcome::Conflict(ConflictResponse {
                version: session.version,
                code: session.code.clone(),
            }));
        }

        session.code = proposal.code;
        session.version += 1;
        session.last_client_id = Some(proposal.client_id);
        cell.mark_dirty();
        on_commit(&session);

        Ok(WriteOutcome::Accepted {
            version: session.version,
        })
    }

    /// Administrative language switch.
    ///
    /// Bypasses the version check: the document is reset to the language
    /// template and the version is bumped unconditionally.
    pub fn set_language<F>(
        &self,
        session_id: &str,
        language: Language,
        client_id: Option<ClientId>,
        on_commit: F,
    ) -> SyncResult<LanguageChanged>
    where
        F: FnOnce(&Session),
    {
        let cell = self.cell(session_id)?;
        let mut session = cell.state.lock();
        if cell.is_evicted() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        session.language = language;
        session.code = language.template().to_string();
        session.version += 1;
        session.last_client_id = client_id;
        cell.mark_dirty();
        on_commit(&session);

        Ok(LanguageChanged {
            code: session.code.clone(),
            version: session.version,
        })
    }

    /// Snapshots of every session modified since the last call
    pub fn take_dirty(&self) -> Vec<Session> {
        self.cells()
            .into_iter()
            .filter(|cell| cell.take_dirty())
            .map(|cell| cell.snapshot())
            .collect()
    }

    /// Flag a session for the next save pass again (e.g. after a failed save)
    pub fn mark_dirty(&self, session_id: &str) {
        if let Some(cell) = self.sessions.get(session_id) {
            cell.mark_dirty();
        }
    }

    /// Ids of sessions untouched for longer than `max_idle`
    pub fn idle_sessions(&self, max_idle: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop a session from memory, returning its last state
    pub fn evict(&self, session_id: &str) -> Option<Session> {
        self.evict_with(session_id, |_| {})
    }

    /// Drop a session from memory.
    ///
    /// The cell is marked evicted and `persist` sees its final state before
    /// the map entry goes away, all under the session's lock. A write racing
    /// the eviction either lands in that final state or fails with
    /// [`SyncError::SessionNotFound`].
    pub fn evict_with<F>(&self, session_id: &str, persist: F) -> Option<Session>
    where
        F: FnOnce(&Session),
    {
        let cell = self.cell(session_id).ok()?;
        let session = cell.state.lock();
        if cell.is_evicted() {
            return None;
        }
        cell.evicted.store(true, Ordering::Release);
        persist(&session);
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, &cell));
        debug!(session_id, version = session.version, "Session evicted");
        Some(session.clone())
    }

    /// Ids of every loaded session
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    // Clone the Arc out so the shard guard is released before the session lock is taken.
    fn cell(&self, session_id: &str) -> SyncResult<Arc<SessionCell>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))
    }

    fn cells(&self) -> Vec<Arc<SessionCell>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}
