//! Per-client synchronization agent.
//!
//! The agent keeps the client's copy of one session document, the last
//! version it knows, and an edit phase (`Idle -> Pending -> Sending -> Idle`).
//! Everything the embedding editor must react to arrives as an
//! [`AgentEvent`] on the channel returned by [`SyncAgent::connect`].

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::generate_client_id;
use super::transport::{ChangeStream, SessionTransport, TransportError, TransportResult};
use crate::language::Language;
use crate::sync::presence::{CursorPosition, ParticipantPatch};
use crate::sync::protocol::{DocumentChange, EditRequest, LanguageChanged, LanguageRequest};
use crate::sync::session::WriteOutcome;
use crate::sync::{ClientId, ParticipantId, SessionId};

/// Debounce windows for outbound traffic
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub edit_debounce: Duration,
    pub cursor_debounce: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            edit_debounce: Duration::from_millis(400),
            cursor_debounce: Duration::from_millis(150),
        }
    }
}

impl AgentConfig {
    pub fn with_edit_debounce(mut self, delay: Duration) -> Self {
        self.edit_debounce = delay;
        self
    }

    pub fn with_cursor_debounce(mut self, delay: Duration) -> Self {
        self.cursor_debounce = delay;
        self
    }
}

/// User-visible notices. None of them stop the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A write was rejected; the server's state at `version` was adopted
    Conflict { version: u64 },
    WriteFailed(String),
    CursorFailed(String),
    MalformedMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Replace the editor content with this state
    RemoteChange {
        code: String,
        language: Language,
        version: u64,
    },
    Notice(Notice),
    /// The document stream ended; call [`SyncAgent::reconnect`] to resume
    StreamLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPhase {
    Idle,
    /// A local edit is buffered and waiting for the debounce window
    Pending,
    /// A write is in flight
    Sending,
}

/// Snapshot of the agent's local view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub code: String,
    pub language: Language,
    pub version: u64,
    pub phase: EditPhase,
    /// Bumped whenever buffered local edits stop being valid. An edit
    /// carries the generation it was made in and is dropped if it changed.
    edit_generation: u64,
}

/// A local edit waiting for the debounce window or the send lock
struct BufferedEdit {
    generation: u64,
    code: String,
}

struct Shared {
    session_id: SessionId,
    client_id: ClientId,
    participant_id: Mutex<Option<ParticipantId>>,
    transport: Arc<dyn SessionTransport>,
    state: Mutex<LocalState>,
    /// At most one write in flight
    send_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<AgentEvent>,
    edits: Debouncer<BufferedEdit>,
    cursors: Debouncer<CursorPosition>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: AgentEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.events.send(event);
    }

    /// Invalidate every local edit not yet sent, including one whose timer
    /// already fired and is waiting for the send lock.
    fn discard_local_edits(&self, state: &mut LocalState) {
        state.edit_generation += 1;
        if state.phase == EditPhase::Pending {
            state.phase = EditPhase::Idle;
        }
        self.edits.cancel();
    }

    async fn flush_edit(&self, edit: BufferedEdit) {
        let _guard = self.send_lock.lock().await;

        let base = {
            let mut state = self.state.lock();
            if state.edit_generation != edit.generation {
                debug!(session_id = %self.session_id, "Dropping superseded edit");
                return;
            }
            state.phase = EditPhase::Sending;
            state.version
        };

        let request = EditRequest {
            code: edit.code,
            version: base,
            client_id: self.client_id.clone(),
        };
        let result = self.transport.submit_edit(&self.session_id, request).await;

        match result {
            Ok(WriteOutcome::Accepted { version }) => {
                let mut state = self.state.lock();
                state.version = state.version.max(version);
                if state.phase == EditPhase::Sending {
                    state.phase = EditPhase::Idle;
                }
                debug!(session_id = %self.session_id, version, "Edit accepted");
            }
            Ok(WriteOutcome::Conflict(conflict)) => {
                let adopted = {
                    let mut state = self.state.lock();
                    self.discard_local_edits(&mut state);
                    state.phase = EditPhase::Idle;
                    if conflict.version >= state.version {
                        state.code = conflict.code;
                        state.version = conflict.version;
                        Some(state.clone())
                    } else {
                        None
                    }
                };
                info!(
                    session_id = %self.session_id,
                    base,
                    version = conflict.version,
                    "Edit rejected, adopting server state"
                );
                if let Some(state) = adopted {
                    self.emit(AgentEvent::RemoteChange {
                        code: state.code,
                        language: state.language,
                        version: state.version,
                    });
                }
                self.emit(AgentEvent::Notice(Notice::Conflict {
                    version: conflict.version,
                }));
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    if state.phase == EditPhase::Sending {
                        state.phase = EditPhase::Idle;
                    }
                }
                warn!(session_id = %self.session_id, "Edit failed: {}", e);
                self.emit(AgentEvent::Notice(Notice::WriteFailed(e.to_string())));
            }
        }
    }

    async fn flush_cursor(&self, cursor: CursorPosition) {
        let Some(participant_id) = self.participant_id.lock().clone() else {
            debug!(session_id = %self.session_id, "No participant set, dropping cursor update");
            return;
        };

        let patch = ParticipantPatch::cursor(cursor);
        if let Err(e) = self
            .transport
            .patch_participant(&self.session_id, &participant_id, patch)
            .await
        {
            warn!(session_id = %self.session_id, "Cursor update failed: {}", e);
            self.emit(AgentEvent::Notice(Notice::CursorFailed(e.to_string())));
        }
    }

    /// Apply one entry of the document stream
    fn handle_change(&self, change: DocumentChange) {
        let mut state = self.state.lock();

        if change.source_client_id.as_deref() == Some(self.client_id.as_str()) {
            // Own echo: the content is already local
            if change.version > state.version {
                state.version = change.version;
            }
            return;
        }

        if change.version <= state.version {
            debug!(
                session_id = %self.session_id,
                version = change.version,
                known = state.version,
                "Ignoring stale change"
            );
            return;
        }

        state.code = change.code;
        state.language = change.language;
        state.version = change.version;
        if state.phase == EditPhase::Pending {
            debug!(session_id = %self.session_id, "Pending edit superseded by remote change");
        }
        self.discard_local_edits(&mut state);
        let event = AgentEvent::RemoteChange {
            code: state.code.clone(),
            language: state.language,
            version: state.version,
        };
        drop(state);
        self.emit(event);
    }

    /// Adopt a freshly fetched snapshot if it is not behind the local view
    fn adopt_snapshot(&self, code: String, language: Language, version: u64) {
        let mut state = self.state.lock();
        if version <= state.version {
            return;
        }
        state.code = code;
        state.language = language;
        state.version = version;
        self.discard_local_edits(&mut state);
        let event = AgentEvent::RemoteChange {
            code: state.code.clone(),
            language,
            version,
        };
        drop(state);
        self.emit(event);
    }
}

async fn run_stream(target: Weak<Shared>, mut changes: ChangeStream) {
    while let Some(item) = changes.next().await {
        let Some(shared) = target.upgrade() else {
            return;
        };
        match item {
            Ok(change) => shared.handle_change(change),
            Err(TransportError::Malformed(reason)) => {
                warn!(session_id = %shared.session_id, "Malformed stream message: {}", reason);
                shared.emit(AgentEvent::Notice(Notice::MalformedMessage(reason)));
            }
            Err(e) => {
                warn!(session_id = %shared.session_id, "Document stream failed: {}", e);
                shared.emit(AgentEvent::StreamLost(e.to_string()));
                return;
            }
        }
    }

    if let Some(shared) = target.upgrade() {
        info!(session_id = %shared.session_id, "Document stream ended");
        shared.emit(AgentEvent::StreamLost("stream ended".to_string()));
    }
}

/// One client's synchronization endpoint for one session.
///
/// Dropping the agent cancels its timers and closes the stream.
pub struct SyncAgent {
    shared: Arc<Shared>,
}

impl SyncAgent {
    /// Subscribe, fetch the current state and start listening.
    ///
    /// The stream is opened before the fetch so no change between the two
    /// is missed; anything at or below the fetched version is ignored.
    pub async fn connect(
        transport: Arc<dyn SessionTransport>,
        session_id: impl Into<SessionId>,
        config: AgentConfig,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        Self::connect_as(transport, session_id, generate_client_id(), config).await
    }

    /// Like [`connect`](Self::connect) with a caller-chosen client id
    pub async fn connect_as(
        transport: Arc<dyn SessionTransport>,
        session_id: impl Into<SessionId>,
        client_id: ClientId,
        config: AgentConfig,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let session_id = session_id.into();
        let changes = transport.subscribe(&session_id).await?;
        let session = transport.fetch_session(&session_id).await?;
        let (events, receiver) = mpsc::unbounded_channel();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let edit_target = weak.clone();
            let cursor_target = weak.clone();

            Shared {
                session_id: session_id.clone(),
                client_id,
                participant_id: Mutex::new(None),
                transport,
                state: Mutex::new(LocalState {
                    code: session.code,
                    language: session.language,
                    version: session.version,
                    phase: EditPhase::Idle,
                    edit_generation: 0,
                }),
                send_lock: tokio::sync::Mutex::new(()),
                events,
                edits: Debouncer::new("edit", config.edit_debounce, move |edit: BufferedEdit| {
                    let target = edit_target.clone();
                    async move {
                        if let Some(shared) = target.upgrade() {
                            shared.flush_edit(edit).await;
                        }
                    }
                }),
                cursors: Debouncer::new(
                    "cursor",
                    config.cursor_debounce,
                    move |cursor: CursorPosition| {
                        let target = cursor_target.clone();
                        async move {
                            if let Some(shared) = target.upgrade() {
                                shared.flush_cursor(cursor).await;
                            }
                        }
                    },
                ),
                stream_task: Mutex::new(None),
            }
        });

        let task = tokio::spawn(run_stream(Arc::downgrade(&shared), changes));
        *shared.stream_task.lock() = Some(task);

        info!(
            session_id = %session_id,
            client_id = %shared.client_id,
            version = session.version,
            "Sync agent connected"
        );
        Ok((Self { shared }, receiver))
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn snapshot(&self) -> LocalState {
        self.shared.state.lock().clone()
    }

    pub fn phase(&self) -> EditPhase {
        self.shared.state.lock().phase
    }

    /// Participant whose cursor [`move_cursor`](Self::move_cursor) updates
    pub fn set_participant(&self, participant_id: Option<ParticipantId>) {
        *self.shared.participant_id.lock() = participant_id;
    }

    /// Record a local edit. Only the last edit of a burst is sent.
    pub fn local_edit(&self, code: impl Into<String>) {
        let code = code.into();
        let generation = {
            let mut state = self.shared.state.lock();
            state.code = code.clone();
            state.phase = EditPhase::Pending;
            state.edit_generation
        };
        self.shared.edits.push(BufferedEdit { generation, code });
    }

    /// Record a cursor move. Only the last position of a burst is sent.
    pub fn move_cursor(&self, cursor: CursorPosition) {
        self.shared.cursors.push(cursor);
    }

    /// Switch the session language. Local edits not yet sent, including
    /// ones made while the switch is in flight, are discarded since the
    /// document is reset to the language template.
    pub async fn change_language(&self, language: Language) -> TransportResult<LanguageChanged> {
        let _guard = self.shared.send_lock.lock().await;
        {
            let mut state = self.shared.state.lock();
            self.shared.discard_local_edits(&mut state);
        }

        let request = LanguageRequest {
            language: language.as_str().to_string(),
            client_id: Some(self.shared.client_id.clone()),
        };
        let changed = self
            .shared
            .transport
            .change_language(&self.shared.session_id, request)
            .await?;

        let mut state = self.shared.state.lock();
        if changed.version >= state.version {
            state.code = changed.code.clone();
            state.language = language;
            state.version = changed.version;
            self.shared.discard_local_edits(&mut state);
        }
        Ok(changed)
    }

    /// Replace the document stream and re-fetch the authoritative state
    pub async fn reconnect(&self) -> TransportResult<()> {
        if let Some(task) = self.shared.stream_task.lock().take() {
            task.abort();
        }

        let transport = self.shared.transport.clone();
        let changes = transport.subscribe(&self.shared.session_id).await?;
        let session = transport.fetch_session(&self.shared.session_id).await?;
        self.shared
            .adopt_snapshot(session.code, session.language, session.version);

        let task = tokio::spawn(run_stream(Arc::downgrade(&self.shared), changes));
        if let Some(previous) = self.shared.stream_task.lock().replace(task) {
            previous.abort();
        }
        info!(session_id = %self.shared.session_id, version = session.version, "Sync agent reconnected");
        Ok(())
    }

    /// Cancel pending timers and stop listening. Safe to call twice.
    pub fn shutdown(&self) {
        let edit = self.shared.edits.cancel();
        let cursor = self.shared.cursors.cancel();
        if let Some(task) = self.shared.stream_task.lock().take() {
            task.abort();
            debug!(
                session_id = %self.shared.session_id,
                pending_edit = edit,
                pending_cursor = cursor,
                "Sync agent shut down"
            );
        }
    }
}

impl Drop for SyncAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::LocalTransport;
    use crate::storage::SessionDb;
    use crate::sync::presence::Participant;
    use crate::sync::session::Session;
    use crate::sync::{SyncServer, SyncServerConfig};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn test_server() -> Arc<SyncServer> {
        Arc::new(SyncServer::new(
            SessionDb::temporary().unwrap(),
            SyncServerConfig::default(),
        ))
    }

    /// Local transport with failure injection and a replaceable stream
    struct ScriptedTransport {
        inner: LocalTransport,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
        patches: AtomicUsize,
        stream: Mutex<Option<ChangeStream>>,
        /// Round-trip time for writes and language switches
        latency: Mutex<Duration>,
    }

    impl ScriptedTransport {
        fn new(server: Arc<SyncServer>) -> Self {
            Self {
                inner: LocalTransport::new(server),
                fail_writes: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
                patches: AtomicUsize::new(0),
                stream: Mutex::new(None),
                latency: Mutex::new(Duration::ZERO),
            }
        }

        fn with_latency(self, latency: Duration) -> Self {
            *self.latency.lock() = latency;
            self
        }

        async fn round_trip(&self) {
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
        }

        fn with_stream(self, stream: ChangeStream) -> Self {
            *self.stream.lock() = Some(stream);
            self
        }

        fn muted(self) -> Self {
            self.with_stream(stream::pending().boxed())
        }
    }

    #[async_trait]
    impl SessionTransport for ScriptedTransport {
        async fn fetch_session(&self, session_id: &str) -> TransportResult<Session> {
            self.inner.fetch_session(session_id).await
        }

        async fn submit_edit(
            &self,
            session_id: &str,
            request: EditRequest,
        ) -> TransportResult<WriteOutcome> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.round_trip().await;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Request("connection refused".to_string()));
            }
            self.inner.submit_edit(session_id, request).await
        }

        async fn change_language(
            &self,
            session_id: &str,
            request: LanguageRequest,
        ) -> TransportResult<LanguageChanged> {
            self.round_trip().await;
            self.inner.change_language(session_id, request).await
        }

        async fn patch_participant(
            &self,
            session_id: &str,
            participant_id: &str,
            patch: ParticipantPatch,
        ) -> TransportResult<Participant> {
            self.patches.fetch_add(1, Ordering::SeqCst);
            self.inner
                .patch_participant(session_id, participant_id, patch)
                .await
        }

        async fn subscribe(&self, session_id: &str) -> TransportResult<ChangeStream> {
            let scripted = self.stream.lock().take();
            match scripted {
                Some(stream) => Ok(stream),
                None => self.inner.subscribe(session_id).await,
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn remote(code: &str, version: u64, source: Option<&str>) -> DocumentChange {
        DocumentChange {
            code: code.to_string(),
            language: Language::Javascript,
            version,
            source_client_id: source.map(str::to_string),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_sends_one_write() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, mut rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        for code in ["a", "ab", "abc"] {
            agent.local_edit(code);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(agent.phase(), EditPhase::Pending);
        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);

        settle().await;
        assert_eq!(transport.writes.load(Ordering::SeqCst), 1);

        let session = server.get_session(&id).unwrap();
        assert_eq!(session.code, "abc");
        assert_eq!(session.version, 1);

        let state = agent.snapshot();
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, EditPhase::Idle);

        // The echo of our own write must not reach the editor
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_adopts_server_state() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()).muted());

        let (agent, mut rx) =
            assert_ok!(SyncAgent::connect(transport, id.clone(), AgentConfig::default()).await);

        server
            .submit_edit(
                &id,
                EditRequest {
                    code: "B".to_string(),
                    version: 0,
                    client_id: "client-1".to_string(),
                },
            )
            .unwrap();

        agent.local_edit("C");
        settle().await;

        let state = agent.snapshot();
        assert_eq!(state.code, "B");
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, EditPhase::Idle);

        assert_eq!(
            drain(&mut rx),
            vec![
                AgentEvent::RemoteChange {
                    code: "B".to_string(),
                    language: Language::Javascript,
                    version: 1,
                },
                AgentEvent::Notice(Notice::Conflict { version: 1 }),
            ]
        );
        assert_eq!(server.get_session(&id).unwrap().code, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_change_reaches_other_agent() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport: Arc<dyn SessionTransport> = Arc::new(LocalTransport::new(server.clone()));

        let (writer, mut writer_rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );
        let (reader, mut reader_rx) =
            assert_ok!(SyncAgent::connect(transport, id.clone(), AgentConfig::default()).await);

        writer.local_edit("shared");
        settle().await;

        assert_eq!(
            drain(&mut reader_rx),
            vec![AgentEvent::RemoteChange {
                code: "shared".to_string(),
                language: Language::Javascript,
                version: 1,
            }]
        );
        assert_eq!(reader.snapshot().code, "shared");
        assert!(drain(&mut writer_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_only_advances_version() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let changes = stream::iter(vec![Ok(remote("ignored", 5, Some("me")))])
            .chain(stream::pending())
            .boxed();
        let transport = Arc::new(ScriptedTransport::new(server).with_stream(changes));

        let (agent, mut rx) = assert_ok!(
            SyncAgent::connect_as(transport, id, "me".to_string(), AgentConfig::default()).await
        );
        let original = agent.snapshot().code;
        settle().await;

        let state = agent.snapshot();
        assert_eq!(state.version, 5);
        assert_eq!(state.code, original);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_malformed_stream_items() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let changes = stream::iter(vec![
            Ok(remote("v2", 2, Some("other"))),
            Ok(remote("old", 1, Some("other"))),
            Err(TransportError::Malformed("expected value".to_string())),
            Ok(remote("v3", 3, None)),
        ])
        .chain(stream::pending())
        .boxed();
        let transport = Arc::new(ScriptedTransport::new(server).with_stream(changes));

        let (agent, mut rx) =
            assert_ok!(SyncAgent::connect(transport, id, AgentConfig::default()).await);
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], AgentEvent::RemoteChange { version: 2, .. }));
        assert_eq!(
            events[1],
            AgentEvent::Notice(Notice::MalformedMessage("expected value".to_string()))
        );
        assert!(matches!(&events[2], AgentEvent::RemoteChange { version: 3, .. }));
        assert_eq!(agent.snapshot().code, "v3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_change_discards_pending_edit() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        agent.local_edit("mine");
        server
            .submit_edit(
                &id,
                EditRequest {
                    code: "theirs".to_string(),
                    version: 0,
                    client_id: "client-1".to_string(),
                },
            )
            .unwrap();
        settle().await;

        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);
        let state = agent.snapshot();
        assert_eq!(state.code, "theirs");
        assert_eq!(state.phase, EditPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_reported() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server));
        transport.fail_writes.store(true, Ordering::SeqCst);

        let (agent, mut rx) =
            assert_ok!(SyncAgent::connect(transport, id, AgentConfig::default()).await);

        agent.local_edit("lost");
        settle().await;

        let state = agent.snapshot();
        assert_eq!(state.version, 0);
        assert_eq!(state.phase, EditPhase::Idle);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AgentEvent::Notice(Notice::WriteFailed(_))]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_moves_are_debounced() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let alice = server.join(&id, "Alice").unwrap();
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, mut rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        // Without a participant cursor moves go nowhere
        agent.move_cursor(CursorPosition::new(1, 1));
        settle().await;
        assert_eq!(transport.patches.load(Ordering::SeqCst), 0);

        agent.set_participant(Some(alice.id.clone()));
        for column in 1..=4 {
            agent.move_cursor(CursorPosition::new(2, column));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        settle().await;

        assert_eq!(transport.patches.load(Ordering::SeqCst), 1);
        let participants = server.participants(&id).unwrap();
        assert_eq!(participants[0].cursor, Some(CursorPosition::new(2, 4)));

        agent.set_participant(Some("ghost".to_string()));
        agent.move_cursor(CursorPosition::new(3, 1));
        settle().await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AgentEvent::Notice(Notice::CursorFailed(_))]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_edit() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        agent.local_edit("never sent");
        agent.move_cursor(CursorPosition::new(1, 1));
        agent.shutdown();
        agent.shutdown();
        settle().await;

        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);
        assert_eq!(server.get_session(&id).unwrap().version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_edit() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );
        agent.local_edit("never sent");
        drop(agent);
        settle().await;

        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_reported_and_reconnect() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(
            ScriptedTransport::new(server.clone()).with_stream(stream::empty().boxed()),
        );

        let (agent, mut rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );
        settle().await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AgentEvent::StreamLost(_)]
        ));

        // Missed while disconnected
        server
            .submit_edit(
                &id,
                EditRequest {
                    code: "missed".to_string(),
                    version: 0,
                    client_id: "client-1".to_string(),
                },
            )
            .unwrap();

        assert_ok!(agent.reconnect().await);
        assert_eq!(agent.snapshot().code, "missed");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AgentEvent::RemoteChange { version: 1, .. }]
        ));

        // The new stream is live
        server
            .submit_edit(
                &id,
                EditRequest {
                    code: "live".to_string(),
                    version: 1,
                    client_id: "client-1".to_string(),
                },
            )
            .unwrap();
        settle().await;
        assert_eq!(agent.snapshot().code, "live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_language_change_resets_document() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(ScriptedTransport::new(server.clone()));

        let (agent, mut rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        agent.local_edit("discarded");
        let changed = assert_ok!(agent.change_language(Language::Python).await);
        assert_eq!(changed.version, 1);
        settle().await;

        let state = agent.snapshot();
        assert_eq!(state.language, Language::Python);
        assert_eq!(state.code, Language::Python.template());
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, EditPhase::Idle);
        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);
        // Attributed to this client, so the stream echo is suppressed
        assert!(drain(&mut rx).is_empty());
    }
    fn foreign_edit(server: &SyncServer, id: &str, code: &str, version: u64) {
        server
            .submit_edit(
                id,
                EditRequest {
                    code: code.to_string(),
                    version,
                    client_id: "client-1".to_string(),
                },
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_queued_behind_conflict_is_dropped() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(
            ScriptedTransport::new(server.clone()).with_latency(Duration::from_millis(500)),
        );

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        // "C1" fires at 400ms and is in flight until 900ms
        agent.local_edit("C1");
        tokio::time::sleep(Duration::from_millis(410)).await;
        foreign_edit(&server, &id, "B", 0);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // "C2" fires at 820ms and queues behind the in-flight write
        agent.local_edit("C2");
        settle().await;
        settle().await;

        let session = server.get_session(&id).unwrap();
        let state = agent.snapshot();
        assert_eq!((session.code.as_str(), session.version), ("B", 1));
        assert_eq!((state.code.as_str(), state.version), ("B", 1));
        assert_eq!(state.phase, EditPhase::Idle);
        assert_eq!(transport.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_change_drops_edit_waiting_for_send() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(
            ScriptedTransport::new(server.clone()).with_latency(Duration::from_millis(500)),
        );

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        agent.local_edit("C1");
        tokio::time::sleep(Duration::from_millis(410)).await;
        agent.local_edit("C2");
        // C2's timer has fired and waits for the send lock
        tokio::time::sleep(Duration::from_millis(440)).await;
        foreign_edit(&server, &id, "B", 0);
        settle().await;
        settle().await;

        let session = server.get_session(&id).unwrap();
        let state = agent.snapshot();
        assert_eq!((session.code.as_str(), session.version), ("B", 1));
        assert_eq!((state.code.as_str(), state.version), ("B", 1));
        assert_eq!(transport.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_language_switch_is_discarded() {
        let server = test_server();
        let id = server.create_session("Interview", None).unwrap().id;
        let transport = Arc::new(
            ScriptedTransport::new(server.clone()).with_latency(Duration::from_millis(500)),
        );

        let (agent, _rx) = assert_ok!(
            SyncAgent::connect(transport.clone(), id.clone(), AgentConfig::default()).await
        );

        let (changed, _) = tokio::join!(agent.change_language(Language::Cpp), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            agent.local_edit("typed before the reset");
        });
        let changed = assert_ok!(changed);
        assert_eq!(changed.version, 1);

        assert_eq!(agent.phase(), EditPhase::Idle);
        assert!(!agent.shared.edits.is_pending());

        settle().await;
        let state = agent.snapshot();
        assert_eq!(state.code, Language::Cpp.template());
        assert_eq!(state.version, 1);
        assert_eq!(transport.writes.load(Ordering::SeqCst), 0);
        assert_eq!(server.get_session(&id).unwrap().version, 1);
    }
}
