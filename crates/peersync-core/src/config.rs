//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Name of the redb file inside `data_dir`
pub const DATABASE_FILE: &str = "peersync.redb";

/// Static configuration of one node, fixed at construction.
///
/// The user-tunable sync knobs live in [`crate::policy::SyncPolicy`] instead,
/// because they change at runtime and are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the database and the `logs/` folder
    pub data_dir: PathBuf,
    /// Advertised in handshakes; advisory only
    pub display_name: Option<String>,
    /// Advertised in handshakes; advisory only
    pub device_type: Option<String>,
    /// Keep the node secret across restarts so peers recognize this node
    pub persist_identity: bool,
    pub handshake_timeout: Duration,
    pub exchange_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Attempts made by `connect` before surfacing `PeerUnreachable`
    pub connect_attempts: u32,
    /// Delay before the second attempt; doubled for each further one
    pub connect_backoff: Duration,
    /// Default retention window for `PeerDirectory::prune`
    pub peer_retention: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("peersync-data"),
            display_name: None,
            device_type: None,
            persist_identity: true,
            handshake_timeout: Duration::from_secs(3),
            exchange_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(3),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(100),
            peer_retention: Duration::from_secs(7 * 24 * 60 * 60),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_persist_identity(mut self, persist: bool) -> Self {
        self.persist_identity = persist;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Reject values that would make timeouts or retries meaningless.
    pub fn validate(&self) -> SyncResult<()> {
        let timeouts = [
            ("handshake_timeout", self.handshake_timeout),
            ("exchange_timeout", self.exchange_timeout),
            ("fetch_timeout", self.fetch_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(SyncError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.connect_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.persist_identity);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EngineConfig {
            exchange_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(msg) if msg.contains("exchange_timeout")));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = EngineConfig {
            connect_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let config = EngineConfig::new("/tmp/node-a");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/node-a/peersync.redb"));
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/node-a/logs"));
    }
}
