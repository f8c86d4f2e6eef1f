//! SyncServer: the session synchronization core behind every transport.
//!
//! The server wires together:
//! - [`SessionStore`] for the version-gated document write path
//! - [`ParticipantRegistry`] for presence
//! - [`ChangeBroadcaster`] for the document and presence push streams
//! - [`SessionDb`] for persistence, with lazy reload of evicted sessions
//!
//! Broadcasts are issued from inside the store/registry critical section,
//! so every subscriber sees a session's changes in commit order. The write
//! itself never waits on subscribers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::broadcast::{ChangeBroadcaster, DocumentStream, PresenceStream, DEFAULT_CAPACITY};
use super::presence::{Participant, ParticipantPatch, ParticipantRegistry, DEFAULT_PALETTE};
use super::protocol::{
    DocumentChange, EditRequest, LanguageChanged, LanguageRequest, SessionSummary,
};
use super::session::{EditProposal, Session, SessionStore, WriteOutcome};
use super::{SyncError, SyncResult};
use crate::language::Language;
use crate::storage::SessionDb;

const DEFAULT_TITLE: &str = "Untitled Session";


/// How joins with an already-present display name are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinPolicy {
    /// Every join gets a fresh participant, names may repeat
    #[default]
    AllowDuplicates,
    /// A join whose name matches a current participant fails with `DuplicateParticipant`
    RejectDuplicateNames,
}

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Per-subscriber backlog on each broadcast channel
    pub broadcast_capacity: usize,
    /// Interval between dirty-session saves
    pub save_interval: Duration,
    /// Interval between eviction passes
    pub cleanup_interval: Duration,
    /// Inactivity after which an unsubscribed session is evicted from memory
    pub session_idle_timeout: Duration,
    /// Maximum participants per session
    pub max_participants_per_session: usize,
    pub join_policy: JoinPolicy,
    /// Participant colors, assigned round-robin in join order
    pub palette: Vec<String>,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_CAPACITY,
            save_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            session_idle_timeout: Duration::from_secs(300),
            max_participants_per_session: 50,
            join_policy: JoinPolicy::AllowDuplicates,
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl SyncServerConfig {
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants_per_session = max;
        self
    }

    pub fn with_palette(mut self, palette: Vec<String>) -> Self {
        self.palette = palette;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }
}

pub struct SyncServer {
    config: SyncServerConfig,
    sessions: SessionStore,
    participants: ParticipantRegistry,
    broadcaster: ChangeBroadcaster,
    storage: Arc<SessionDb>,
    /// Serializes loading sessions from storage against evicting them
    lifecycle: Mutex<()>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(storage: SessionDb, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            sessions: SessionStore::new(),
            participants: ParticipantRegistry::with_palette(config.palette.clone()),
            broadcaster: ChangeBroadcaster::new(config.broadcast_capacity),
            storage: Arc::new(storage),
            lifecycle: Mutex::new(()),
            started_at: Instant::now(),
            shutdown_tx,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_storage(storage: SessionDb) -> Self {
        Self::new(storage, SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<SessionDb> {
        &self.storage
    }

    /// Create a session at version 0, seeded with the language template.
    /// `language` defaults to javascript.
    pub fn create_session(&self, title: &str, language: Option<&str>) -> SyncResult<Session> {
        let language = match language {
            Some(name) => name.parse::<Language>()?,
            None => Language::default(),
        };
        let title = match title.trim() {
            "" => DEFAULT_TITLE,
            trimmed => trimmed,
        };

        let session = Session::new(title, language);
        self.participants.open(&session.id);
        self.sessions.insert(session.clone());
        if let Err(e) = self.storage.save_session(&session) {
            // Keep it dirty so the save loop retries.
            error!(session_id = %session.id, "Failed to persist new session: {}", e);
            self.sessions.mark_dirty(&session.id);
        }

        info!(session_id = %session.id, language = %language, "Session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> SyncResult<Session> {
        self.with_loaded(session_id, || self.sessions.get(session_id))
    }

    /// Every known session, loaded or only stored, oldest first
    pub fn list_sessions(&self) -> SyncResult<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for id in self.sessions.session_ids() {
            if let Ok(session) = self.sessions.get(&id) {
                let participants = self.participants.count(&id);
                summaries.push(summary(&session, participants));
                seen.insert(id);
            }
        }

        for session in self.storage.list_sessions()? {
            if seen.contains(&session.id) {
                continue;
            }
            let participants = self.storage.load_participants(&session.id)?.len();
            summaries.push(summary(&session, participants));
        }

        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// Version-gated document write
    pub fn submit_edit(&self, session_id: &str, request: EditRequest) -> SyncResult<WriteOutcome> {
        let client_id = request.client_id.clone();
        let base_version = request.version;
        let proposal = EditProposal {
            code: request.code,
            base_version,
            client_id: request.client_id,
        };

        let outcome = self.with_loaded(session_id, || {
            self.sessions.try_apply(session_id, proposal.clone(), |session| {
                let delivered = self
                    .broadcaster
                    .publish_document(session_id, DocumentChange::from(session));
                debug!(session_id, version = session.version, delivered, "Document change published");
            })
        })?;

        match &outcome {
            WriteOutcome::Accepted { version } => {
                debug!(session_id, client_id = %client_id, version, "Edit accepted");
            }
            WriteOutcome::Conflict(conflict) => {
                info!(
                    session_id,
                    client_id = %client_id,
                    base_version,
                    current_version = conflict.version,
                    "Edit conflicted"
                );
            }
        }

        Ok(outcome)
    }

    /// Unconditional language switch resetting the document to the template.
    ///
    /// Not version-gated: a concurrent edit still in flight will conflict
    /// against the bumped version and its content is lost.
    pub fn change_language(
        &self,
        session_id: &str,
        request: LanguageRequest,
    ) -> SyncResult<LanguageChanged> {
        let language: Language = request.language.parse()?;

        let changed = self.with_loaded(session_id, || {
            self.sessions
                .set_language(session_id, language, request.client_id.clone(), |session| {
                    self.broadcaster
                        .publish_document(session_id, DocumentChange::from(session));
                })
        })?;

        info!(session_id, language = %language, version = changed.version, "Language changed");
        Ok(changed)
    }

    /// Register a participant, applying the join policy and participant cap
    pub fn join(&self, session_id: &str, name: &str) -> SyncResult<Participant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidMessage("name must not be empty".to_string()));
        }
        let policy = self.config.join_policy;
        let max = self.config.max_participants_per_session;

        let participant = self.with_loaded(session_id, || {
            self.participants.join(
                session_id,
                name,
                |current| {
                    if current.len() >= max {
                        return Err(SyncError::SessionFull(session_id.to_string()));
                    }
                    if policy == JoinPolicy::RejectDuplicateNames
                        && current.iter().any(|p| p.name == name)
                    {
                        return Err(SyncError::DuplicateParticipant(name.to_string()));
                    }
                    Ok(())
                },
                |list| {
                    self.broadcaster.publish_presence(session_id, list.to_vec());
                },
            )
        })?;

        info!(
            session_id,
            participant_id = %participant.id,
            name = %participant.name,
            "Participant joined"
        );
        Ok(participant)
    }

    pub fn participants(&self, session_id: &str) -> SyncResult<Vec<Participant>> {
        self.ensure_loaded(session_id)?;
        Ok(self.participants.list(session_id))
    }

    pub fn patch_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> SyncResult<Participant> {
        self.with_loaded(session_id, || {
            self.participants
                .patch(session_id, participant_id, &patch, |list| {
                    self.broadcaster.publish_presence(session_id, list.to_vec());
                })
        })
    }

    /// Idempotent removal. `Ok(false)` when the participant or the whole
    /// session was already gone.
    pub fn leave(&self, session_id: &str, participant_id: &str) -> SyncResult<bool> {
        let removed = self.with_loaded(session_id, || {
            self.participants.leave(session_id, participant_id, |list| {
                self.broadcaster.publish_presence(session_id, list.to_vec());
            })
        });
        let removed = match removed {
            Ok(removed) => removed,
            Err(SyncError::SessionNotFound(_)) => false,
            Err(e) => return Err(e),
        };

        if removed {
            info!(session_id, participant_id, "Participant left");
        } else {
            debug!(session_id, participant_id, "Leave for absent participant ignored");
        }
        Ok(removed)
    }

    pub fn subscribe_documents(&self, session_id: &str) -> SyncResult<DocumentStream> {
        self.ensure_loaded(session_id)?;
        Ok(self.broadcaster.subscribe_documents(session_id))
    }

    /// Current session state plus the document stream after it.
    ///
    /// The stream is attached before the snapshot is read so no commit falls
    /// between the two; a change may appear in both, which receivers drop by
    /// version.
    pub fn subscribe_session(&self, session_id: &str) -> SyncResult<(Session, DocumentStream)> {
        let stream = self.subscribe_documents(session_id)?;
        let session = self.sessions.get(session_id)?;
        Ok((session, stream))
    }

    /// Current participant list plus the presence stream after it
    pub fn subscribe_presence(
        &self,
        session_id: &str,
    ) -> SyncResult<(Vec<Participant>, PresenceStream)> {
        self.ensure_loaded(session_id)?;
        let stream = self.broadcaster.subscribe_presence(session_id);
        let snapshot = self.participants.list(session_id);
        Ok((snapshot, stream))
    }

    /// Run `op` against a loaded session.
    ///
    /// An operation that lands on a session evicted after the load check
    /// sees `SessionNotFound`. It is retried once with evictions held off,
    /// so the second attempt always finds the session in memory.
    fn with_loaded<T, F>(&self, session_id: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        self.ensure_loaded(session_id)?;
        match op() {
            Err(SyncError::SessionNotFound(_)) => {
                debug!(session_id, "Session evicted mid-operation, reloading");
                let _lifecycle = self.lifecycle.lock();
                self.load_locked(session_id)?;
                op()
            }
            result => result,
        }
    }

    /// Make sure a session is in memory, loading it from storage if needed
    fn ensure_loaded(&self, session_id: &str) -> SyncResult<()> {
        if self.sessions.contains(session_id) {
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock();
        self.load_locked(session_id)
    }

    // Caller holds `lifecycle`.
    fn load_locked(&self, session_id: &str) -> SyncResult<()> {
        if self.sessions.contains(session_id) {
            return Ok(());
        }

        let session = self
            .storage
            .load_session(session_id)?
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
        let participants = self.storage.load_participants(session_id)?;

        // Roster first, so a visible session always has its participants.
        self.participants.restore(session_id, participants);
        self.sessions.restore(session);

        info!(session_id, "Session loaded from storage");
        Ok(())
    }

    /// Persist every session and participant list modified since the last pass
    pub fn save_dirty(&self) -> usize {
        // An eviction must not overtake a snapshot taken here.
        let _lifecycle = self.lifecycle.lock();
        let mut saved = 0;

        for session in self.sessions.take_dirty() {
            if let Err(e) = self.storage.save_session(&session) {
                error!(session_id = %session.id, "Failed to save session: {}", e);
                self.sessions.mark_dirty(&session.id);
            } else {
                saved += 1;
            }
        }

        for (session_id, participants) in self.participants.take_dirty() {
            if let Err(e) = self.storage.save_participants(&session_id, &participants) {
                error!(session_id = %session_id, "Failed to save participants: {}", e);
                self.participants.mark_dirty(&session_id);
            } else {
                saved += 1;
            }
        }

        if saved > 0 {
            if let Err(e) = self.storage.flush() {
                warn!("Storage flush failed: {}", e);
            }
        }

        saved
    }

    /// Evict idle sessions without subscribers and prune dead channels.
    /// Returns the number of sessions evicted.
    pub fn cleanup(&self) -> usize {
        let idle = self.sessions.idle_sessions(self.config.session_idle_timeout);
        let mut evicted = 0;

        for session_id in idle {
            let _lifecycle = self.lifecycle.lock();
            if self.broadcaster.has_subscribers(&session_id) {
                continue;
            }

            // Session first: once it is gone no new roster can be opened for it.
            let saved = self.sessions.evict_with(&session_id, |session| {
                if let Err(e) = self.storage.save_session(session) {
                    error!(session_id = %session_id, "Failed to save evicted session: {}", e);
                }
            });
            if saved.is_none() {
                continue;
            }
            self.participants.evict_with(&session_id, |participants| {
                if let Err(e) = self.storage.save_participants(&session_id, participants) {
                    error!(session_id = %session_id, "Failed to save evicted participants: {}", e);
                }
            });

            info!(session_id = %session_id, "Evicted idle session");
            evicted += 1;
        }

        self.broadcaster.prune();
        evicted
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.sessions.len(),
            participants: self.participants.total_participants(),
            subscribers: self.broadcaster.total_subscribers(),
            broadcast_channels: self.broadcaster.session_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown; the save task performs a final save
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let save_interval = server.config.save_interval;
        // Subscribe before spawning so an early shutdown is not missed.
        let mut shutdown = server.shutdown_receiver();

        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.save_dirty();
                        if saved > 0 {
                            debug!("Auto-saved {} records", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        // Final save
                        let saved = server.save_dirty();
                        info!("Final save wrote {} records", saved);
                        break;
                    }
                }
            }
        });

        let server = self;
        let cleanup_interval = server.config.cleanup_interval;
        let mut shutdown = server.shutdown_receiver();

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = server.cleanup();
                        if evicted > 0 {
                            debug!("Cleanup evicted {} sessions", evicted);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

fn summary(session: &Session, participants: usize) -> SessionSummary {
    SessionSummary {
        id: session.id.clone(),
        title: session.title.clone(),
        language: session.language,
        version: session.version,
        participants,
        created_at: session.created_at,
    }
}

/// Server statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub active_sessions: usize,
    pub participants: usize,
    pub subscribers: usize,
    pub broadcast_channels: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
    }
}
