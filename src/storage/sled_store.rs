//! Sled-based storage for session records and participant lists.
//!
//! Two trees, both keyed by session id:
//! - `sessions`: bincode-encoded `Session`
//! - `participants`: bincode-encoded `Vec<Participant>` in join order

use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

use super::StorageConfig;
use crate::sync::presence::Participant;
use crate::sync::session::Session;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_SESSIONS: &str = "sessions";
const TREE_PARTICIPANTS: &str = "participants";

/// Sled-backed session database
#[derive(Clone)]
pub struct SessionDb {
    db: Db,
    sessions: Tree,
    participants: Tree,
}

impl SessionDb {
    /// Open or create a session database
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            });

        if config.temporary {
            sled_config = sled_config.temporary(true);
        } else {
            let path = Path::new(&config.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InitFailed(format!("Failed to create directory: {}", e))
                })?;
            }
            sled_config = sled_config.path(path);
        }

        let db = sled_config.open()?;
        let sessions = db.open_tree(TREE_SESSIONS)?;
        let participants = db.open_tree(TREE_PARTICIPANTS)?;

        Ok(Self {
            db,
            sessions,
            participants,
        })
    }

    /// Throwaway database for tests and ephemeral servers
    pub fn temporary() -> StorageResult<Self> {
        Self::open(&StorageConfig::temporary())
    }

    pub fn save_session(&self, session: &Session) -> StorageResult<()> {
        let bytes = bincode::serialize(session)?;
        self.sessions.insert(session.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn load_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        match self.sessions.get(session_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn session_exists(&self, session_id: &str) -> StorageResult<bool> {
        Ok(self.sessions.contains_key(session_id.as_bytes())?)
    }

    /// Every stored session
    pub fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for item in self.sessions.iter() {
            let (_, value) = item?;
            sessions.push(bincode::deserialize(&value)?);
        }
        Ok(sessions)
    }

    pub fn save_participants(
        &self,
        session_id: &str,
        participants: &[Participant],
    ) -> StorageResult<()> {
        let bytes = bincode::serialize(participants)?;
        self.participants.insert(session_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Stored participant list; empty when none was saved
    pub fn load_participants(&self, session_id: &str) -> StorageResult<Vec<Participant>> {
        match self.participants.get(session_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Delete a session and its participant list
    pub fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        let key = session_id.as_bytes();
        self.sessions.remove(key)?;
        self.participants.remove(key)?;
        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            session_count: self.sessions.len(),
            participant_list_count: self.participants.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub session_count: usize,
    pub participant_list_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for SessionDb {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}
