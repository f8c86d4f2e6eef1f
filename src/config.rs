//! Environment-driven server configuration.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::storage::StorageConfig;
use crate::sync::{JoinPolicy, SyncServerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Everything the server binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub storage: StorageConfig,
    pub sync: SyncServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 3000,
            storage: StorageConfig::default(),
            sync: SyncServerConfig::default().with_join_policy(JoinPolicy::RejectDuplicateNames),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup, falling back to defaults for absent keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = parse::<IpAddr, _>(&lookup, "HOST")? {
            config.host = host;
        }
        if let Some(port) = parse::<u16, _>(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SAVE_INTERVAL_SECS")? {
            config.sync.save_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "CLEANUP_INTERVAL_SECS")? {
            config.sync.cleanup_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SESSION_IDLE_SECS")? {
            config.sync.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse::<usize, _>(&lookup, "BROADCAST_CAPACITY")? {
            config.sync.broadcast_capacity = capacity;
        }
        if let Some(max) = parse::<usize, _>(&lookup, "MAX_PARTICIPANTS")? {
            config.sync.max_participants_per_session = max;
        }
        if let Some(unique) = parse::<bool, _>(&lookup, "UNIQUE_PARTICIPANT_NAMES")? {
            config.sync.join_policy = if unique {
                JoinPolicy::RejectDuplicateNames
            } else {
                JoinPolicy::AllowDuplicates
            };
        }

        Ok(config)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr().to_string(), "0.0.0.0:3000");
        assert_eq!(config.storage.path, "./data/codelive.sled");
        assert_eq!(config.sync.join_policy, JoinPolicy::RejectDuplicateNames);
        assert_eq!(config.sync.max_participants_per_session, 50);
        assert_eq!(config.sync.broadcast_capacity, 256);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("STORAGE_PATH", "/var/lib/codelive"),
            ("SAVE_INTERVAL_SECS", "2"),
            ("SESSION_IDLE_SECS", "30"),
            ("UNIQUE_PARTICIPANT_NAMES", "false"),
            ("MAX_PARTICIPANTS", "4"),
        ]))
        .unwrap();

        assert_eq!(config.addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.storage.path, "/var/lib/codelive");
        assert_eq!(config.sync.save_interval, Duration::from_secs(2));
        assert_eq!(config.sync.session_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.sync.join_policy, JoinPolicy::AllowDuplicates);
        assert_eq!(config.sync.max_participants_per_session, 4);
    }

    #[test]
    fn test_invalid_value() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PORT",
                value: "http".to_string()
            }
        );
    }
}
