//! Per-session fan-out of document and presence changes.
//!
//! Each session gets two tokio broadcast channels, created on first subscribe:
//! one for document changes and one for full participant snapshots. Delivery
//! is at-most-once: a subscriber that falls more than `capacity` messages
//! behind skips the overflow, and publishing to a session nobody listens to
//! is a no-op. Dropping a subscription stream releases its receiver slot.

use dashmap::DashMap;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::presence::Participant;
use super::protocol::DocumentChange;
use super::SessionId;

/// Default per-subscriber backlog before messages are dropped
pub const DEFAULT_CAPACITY: usize = 256;

/// Push stream of document changes
pub type DocumentStream = BoxStream<'static, DocumentChange>;

/// Push stream of participant list snapshots
pub type PresenceStream = BoxStream<'static, Arc<Vec<Participant>>>;

#[derive(Debug)]
struct SessionChannels {
    documents: broadcast::Sender<DocumentChange>,
    presence: broadcast::Sender<Arc<Vec<Participant>>>,
}

impl SessionChannels {
    fn new(capacity: usize) -> Self {
        let (documents, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            documents,
            presence,
        }
    }

    fn subscriber_count(&self) -> usize {
        self.documents.receiver_count() + self.presence.receiver_count()
    }
}

/// Subscriber counts for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberCounts {
    pub documents: usize,
    pub presence: usize,
}

#[derive(Debug)]
pub struct ChangeBroadcaster {
    channels: DashMap<SessionId, Arc<SessionChannels>>,
    capacity: usize,
}

impl ChangeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a document change to every current subscriber of the session.
    /// Returns the number of subscribers it was handed to.
    pub fn publish_document(&self, session_id: &str, change: DocumentChange) -> usize {
        let Some(channels) = self.channels(session_id) else {
            return 0;
        };
        // Err only means nobody is listening right now.
        channels.documents.send(change).unwrap_or(0)
    }

    /// Push a full participant snapshot to every current presence subscriber
    pub fn publish_presence(&self, session_id: &str, participants: Vec<Participant>) -> usize {
        let Some(channels) = self.channels(session_id) else {
            return 0;
        };
        channels
            .presence
            .send(Arc::new(participants))
            .unwrap_or(0)
    }

    pub fn subscribe_documents(&self, session_id: &str) -> DocumentStream {
        let rx = self.subscribe_with(session_id, |channels| channels.documents.subscribe());
        debug!(session_id, "Document subscriber attached");
        lossy_stream(rx, session_id.to_string(), "document")
    }

    pub fn subscribe_presence(&self, session_id: &str) -> PresenceStream {
        let rx = self.subscribe_with(session_id, |channels| channels.presence.subscribe());
        debug!(session_id, "Presence subscriber attached");
        lossy_stream(rx, session_id.to_string(), "presence")
    }

    pub fn subscriber_counts(&self, session_id: &str) -> SubscriberCounts {
        self.channels(session_id)
            .map(|channels| SubscriberCounts {
                documents: channels.documents.receiver_count(),
                presence: channels.presence.receiver_count(),
            })
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, session_id: &str) -> bool {
        self.channels(session_id)
            .map(|channels| channels.subscriber_count() > 0)
            .unwrap_or(false)
    }

    pub fn total_subscribers(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().subscriber_count())
            .sum()
    }

    pub fn session_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop channel pairs nobody is subscribed to. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels
            .retain(|_, channels| channels.subscriber_count() > 0);
        let removed = before.saturating_sub(self.channels.len());
        if removed > 0 {
            debug!(removed, "Pruned idle broadcast channels");
        }
        removed
    }

    fn channels(&self, session_id: &str) -> Option<Arc<SessionChannels>> {
        self.channels.get(session_id).map(|entry| entry.value().clone())
    }

    // The receiver is created while the entry guard is held, so `prune` never
    // sees the pair between creation and subscription.
    fn subscribe_with<T, F>(&self, session_id: &str, subscribe: F) -> broadcast::Receiver<T>
    where
        F: FnOnce(&SessionChannels) -> broadcast::Receiver<T>,
    {
        let entry = self
            .channels
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionChannels::new(self.capacity)));
        subscribe(entry.value())
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn lossy_stream<T>(
    rx: broadcast::Receiver<T>,
    session_id: SessionId,
    kind: &'static str,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(rx)
        .filter_map(move |item| {
            let item = match item {
                Ok(value) => Some(value),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %session_id,
                        stream = kind,
                        skipped,
                        "Subscriber lagged, dropping messages"
                    );
                    None
                }
            };
            futures_util::future::ready(item)
        })
        .boxed()
}
