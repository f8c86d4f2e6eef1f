//! Storage module for persistent session snapshots using Sled.
//!
//! Each session id maps to one bincode-encoded `Session` record and one
//! ordered participant list. Writes happen from the server's background save
//! loop, so the in-memory store stays the source of truth while running.

mod sled_store;

pub use sled_store::{SessionDb, StorageError, StorageResult, StorageStats};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Throwaway database removed on drop (tests)
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/codelive.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
            temporary: false,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// In-memory style database that is deleted when closed
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.path, "./data/codelive.sled");
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert!(!config.temporary);
    }

    #[test]
    fn test_storage_config_builders() {
        let config = StorageConfig::new("/tmp/x.sled")
            .with_cache_size(1024)
            .with_flush_interval_ms(0);
        assert_eq!(config.path, "/tmp/x.sled");
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.flush_interval_ms, 0);
        assert!(StorageConfig::temporary().temporary);
    }
}
