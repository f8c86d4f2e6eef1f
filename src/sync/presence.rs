//! Participant registry for session presence.
//!
//! This module tracks who is in a session and their live status:
//! - Join order, which is also the order every listing is returned in
//! - Round-robin color assignment from a fixed palette
//! - Cursor positions, typing indicators and online flags
//!
//! Participants are keyed by session. Removal is an explicit delete, never a
//! flag flip, so a participant absent from the registry has never joined.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{ParticipantId, SessionId, SyncError, SyncResult};

/// Colors handed out in join order
pub const DEFAULT_PALETTE: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

const AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

/// 1-based cursor position in the shared document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    #[serde(alias = "lineNumber")]
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.line == 0 || self.column == 0 {
            return Err(SyncError::InvalidMessage(format!(
                "cursor position is 1-based, got {}:{}",
                self.line, self.column
            )));
        }
        Ok(())
    }
}

/// A member of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub avatar: String,
    /// Assigned color (hex)
    pub color: String,
    pub is_online: bool,
    #[serde(default)]
    pub is_typing: bool,
    /// Last reported cursor; kept even while offline
    pub cursor: Option<CursorPosition>,
}

impl Participant {
    fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            avatar: avatar_url(&name),
            name,
            color: color.into(),
            is_online: true,
            is_typing: false,
            cursor: None,
        }
    }

    /// Apply only the fields present in `patch`
    fn apply(&mut self, patch: &ParticipantPatch) {
        if let Some(cursor) = patch.cursor {
            self.cursor = Some(cursor);
        }
        if let Some(is_typing) = patch.is_typing {
            self.is_typing = is_typing;
        }
        if let Some(is_online) = patch.is_online {
            self.is_online = is_online;
        }
    }
}

/// Partial participant update; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPatch {
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub is_typing: Option<bool>,
    #[serde(default)]
    pub is_online: Option<bool>,
}

impl ParticipantPatch {
    pub fn cursor(cursor: CursorPosition) -> Self {
        Self {
            cursor: Some(cursor),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.is_typing.is_none() && self.is_online.is_none()
    }
}

pub fn avatar_url(name: &str) -> String {
    format!("{}{}", AVATAR_BASE_URL, name)
}

/// Ordered participant list of one session
#[derive(Debug, Default)]
struct Roster {
    participants: Mutex<Vec<Participant>>,
    dirty: AtomicBool,
    /// Set under `participants` when the list leaves the registry
    evicted: AtomicBool,
}

impl Roster {
    fn with_participants(participants: Vec<Participant>) -> Self {
        Self {
            participants: Mutex::new(participants),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        }
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Registry of participants across all sessions
#[derive(Debug)]
pub struct ParticipantRegistry {
    rosters: DashMap<SessionId, Arc<Roster>>,
    palette: Vec<String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::with_palette(DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect())
    }

    /// Use a custom palette. An empty palette falls back to the default one.
    pub fn with_palette(palette: Vec<String>) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect()
        } else {
            palette
        };
        Self {
            rosters: DashMap::new(),
            palette,
        }
    }

    pub fn palette(&self) -> &[String] {
        &self.palette
    }

    /// Start an empty list for a newly created session
    pub fn open(&self, session_id: &str) {
        self.rosters
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Roster::default()));
    }

    /// Add a participant to a session.
    ///
    /// The session's list must have been opened or restored first; joining an
    /// unloaded session fails with [`SyncError::SessionNotFound`].
    /// `admit` sees the current list under the session's lock and may refuse
    /// the join. `on_change` runs under the same lock with the new list.
    pub fn join<A, F>(
        &self,
        session_id: &str,
        name: &str,
        admit: A,
        on_change: F,
    ) -> SyncResult<Participant>
    where
        A: FnOnce(&[Participant]) -> SyncResult<()>,
        F: FnOnce(&[Participant]),
    {
        let roster = self.live_roster(session_id)?;
        let mut participants = roster.participants.lock();
        if roster.is_evicted() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        admit(&participants)?;

        let color = &self.palette[participants.len() % self.palette.len()];
        let participant = Participant::new(name, color.as_str());
        participants.push(participant.clone());
        roster.mark_dirty();
        on_change(&participants);

        debug!(
            session_id,
            participant_id = %participant.id,
            color = %participant.color,
            "Participant joined"
        );
        Ok(participant)
    }

    /// Participants in join order; empty when nobody has joined
    pub fn list(&self, session_id: &str) -> Vec<Participant> {
        self.roster(session_id)
            .map(|roster| roster.participants.lock().clone())
            .unwrap_or_default()
    }

    pub fn get(&self, session_id: &str, participant_id: &str) -> Option<Participant> {
        let roster = self.roster(session_id)?;
        let participants = roster.participants.lock();
        participants.iter().find(|p| p.id == participant_id).cloned()
    }

    /// Partial update of one participant
    pub fn patch<F>(
        &self,
        session_id: &str,
        participant_id: &str,
        patch: &ParticipantPatch,
        on_change: F,
    ) -> SyncResult<Participant>
    where
        F: FnOnce(&[Participant]),
    {
        if let Some(cursor) = &patch.cursor {
            cursor.validate()?;
        }

        let roster = self.live_roster(session_id)?;
        let mut participants = roster.participants.lock();
        if roster.is_evicted() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        let participant = participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.to_string()))?;
        participant.apply(patch);
        let updated = participant.clone();

        roster.mark_dirty();
        on_change(&participants);
        Ok(updated)
    }

    /// Remove a participant. Returns whether anything was removed;
    /// `on_change` only runs when it was.
    pub fn leave<F>(&self, session_id: &str, participant_id: &str, on_change: F) -> SyncResult<bool>
    where
        F: FnOnce(&[Participant]),
    {
        let roster = self.live_roster(session_id)?;
        let mut participants = roster.participants.lock();
        if roster.is_evicted() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        let before = participants.len();
        participants.retain(|p| p.id != participant_id);
        if participants.len() == before {
            return Ok(false);
        }

        roster.mark_dirty();
        on_change(&participants);
        debug!(session_id, participant_id, "Participant left");
        Ok(true)
    }

    pub fn count(&self, session_id: &str) -> usize {
        self.roster(session_id)
            .map(|roster| roster.participants.lock().len())
            .unwrap_or(0)
    }

    pub fn total_participants(&self) -> usize {
        self.rosters
            .iter()
            .map(|entry| entry.value().participants.lock().len())
            .sum()
    }

    /// Install a list loaded from storage, unless one is already loaded
    pub fn restore(&self, session_id: &str, participants: Vec<Participant>) {
        self.rosters
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Roster::with_participants(participants)));
    }

    /// Lists modified since the last call
    pub fn take_dirty(&self) -> Vec<(SessionId, Vec<Participant>)> {
        let rosters: Vec<(SessionId, Arc<Roster>)> = self
            .rosters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        rosters
            .into_iter()
            .filter(|(_, roster)| roster.take_dirty())
            .map(|(id, roster)| {
                let participants = roster.participants.lock().clone();
                (id, participants)
            })
            .collect()
    }

    pub fn mark_dirty(&self, session_id: &str) {
        if let Some(roster) = self.roster(session_id) {
            roster.mark_dirty();
        }
    }

    /// Drop a session's list from memory
    pub fn evict(&self, session_id: &str) -> Option<Vec<Participant>> {
        self.evict_with(session_id, |_| {})
    }

    /// Drop a session's list from memory after `persist` has seen it.
    ///
    /// Runs under the list's lock, so a change racing the eviction is either
    /// in what `persist` sees or refused with [`SyncError::SessionNotFound`].
    pub fn evict_with<F>(&self, session_id: &str, persist: F) -> Option<Vec<Participant>>
    where
        F: FnOnce(&[Participant]),
    {
        let roster = self.roster(session_id)?;
        let participants = roster.participants.lock();
        if roster.is_evicted() {
            return None;
        }
        roster.evicted.store(true, Ordering::Release);
        persist(&participants);
        self.rosters
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, &roster));
        Some(participants.clone())
    }

    fn roster(&self, session_id: &str) -> Option<Arc<Roster>> {
        self.rosters.get(session_id).map(|entry| entry.value().clone())
    }

    fn live_roster(&self, session_id: &str) -> SyncResult<Arc<Roster>> {
        self.roster(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))
    }
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}
