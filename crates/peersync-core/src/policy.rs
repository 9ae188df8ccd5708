//! Sync policy store
//!
//! Holds the user-tunable sync knobs and the shared sync key. The policy is
//! persisted as one row per key; an update writes every row in one
//! transaction, so readers and the database never observe a torn update.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::crypto::{fingerprint, random_bytes, KeyFingerprint, PayloadCrypto};
use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;

const AUTO_SYNC: &str = "autoSync";
const SYNC_INTERVAL_MS: &str = "syncIntervalMs";
const RESTRICT_TO_WIFI: &str = "restrictToWifi";
const RESTRICT_TO_LOCAL_NETWORK: &str = "restrictToLocalNetwork";
const ENCRYPTION_ENABLED: &str = "encryptionEnabled";
const SYNC_KEY: &str = "syncKey";

/// User-configurable sync behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub auto_sync: bool,
    /// Period of automatic sync passes; always greater than zero
    pub interval_ms: u64,
    pub restrict_to_wifi: bool,
    pub restrict_to_local_network: bool,
    pub encryption_enabled: bool,
    /// Shared secret scoping the sync group
    pub sync_key: Option<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_sync: false,
            interval_ms: 30_000,
            restrict_to_wifi: false,
            restrict_to_local_network: false,
            encryption_enabled: false,
            sync_key: None,
        }
    }
}

impl SyncPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Handshake fingerprint of the current sync key
    pub fn key_fingerprint(&self) -> KeyFingerprint {
        fingerprint(self.sync_key.as_deref())
    }

    /// Cipher for outgoing payloads, `None` when encryption is off.
    ///
    /// Encryption without a sync key is a configuration error.
    pub fn payload_crypto(&self) -> SyncResult<Option<PayloadCrypto>> {
        if !self.encryption_enabled {
            return Ok(None);
        }
        self.decrypting_crypto()?
            .map(Some)
            .ok_or_else(|| SyncError::Crypto("encryption enabled but no sync key set".to_string()))
    }

    /// Cipher for incoming sealed payloads, regardless of our own setting.
    pub fn decrypting_crypto(&self) -> SyncResult<Option<PayloadCrypto>> {
        self.sync_key
            .as_deref()
            .map(PayloadCrypto::from_sync_key)
            .transpose()
    }

    fn apply(mut self, update: &PolicyUpdate) -> Self {
        if let Some(v) = update.auto_sync {
            self.auto_sync = v;
        }
        if let Some(v) = update.interval_ms {
            self.interval_ms = v;
        }
        if let Some(v) = update.restrict_to_wifi {
            self.restrict_to_wifi = v;
        }
        if let Some(v) = update.restrict_to_local_network {
            self.restrict_to_local_network = v;
        }
        if let Some(v) = update.encryption_enabled {
            self.encryption_enabled = v;
        }
        if let Some(v) = &update.sync_key {
            self.sync_key = v.clone();
        }
        self
    }

    fn validate(&self) -> SyncResult<()> {
        if self.interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "syncIntervalMs must be greater than zero".to_string(),
            ));
        }
        if matches!(self.sync_key.as_deref(), Some("")) {
            return Err(SyncError::InvalidConfig("syncKey must not be empty".to_string()));
        }
        if self.encryption_enabled && self.sync_key.is_none() {
            return Err(SyncError::InvalidConfig(
                "encryptionEnabled requires a syncKey".to_string(),
            ));
        }
        Ok(())
    }

    fn to_rows(&self) -> SyncResult<Vec<(&'static str, Vec<u8>)>> {
        fn json<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
            serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
        }
        Ok(vec![
            (AUTO_SYNC, json(&self.auto_sync)?),
            (SYNC_INTERVAL_MS, json(&self.interval_ms)?),
            (RESTRICT_TO_WIFI, json(&self.restrict_to_wifi)?),
            (RESTRICT_TO_LOCAL_NETWORK, json(&self.restrict_to_local_network)?),
            (ENCRYPTION_ENABLED, json(&self.encryption_enabled)?),
            (SYNC_KEY, json(&self.sync_key)?),
        ])
    }

    fn from_rows(rows: Vec<(String, Vec<u8>)>) -> Self {
        let mut policy = Self::default();
        for (key, value) in rows {
            let applied = match key.as_str() {
                AUTO_SYNC => serde_json::from_slice(&value).map(|v| policy.auto_sync = v),
                SYNC_INTERVAL_MS => serde_json::from_slice(&value).map(|v| policy.interval_ms = v),
                RESTRICT_TO_WIFI => {
                    serde_json::from_slice(&value).map(|v| policy.restrict_to_wifi = v)
                }
                RESTRICT_TO_LOCAL_NETWORK => {
                    serde_json::from_slice(&value).map(|v| policy.restrict_to_local_network = v)
                }
                ENCRYPTION_ENABLED => {
                    serde_json::from_slice(&value).map(|v| policy.encryption_enabled = v)
                }
                SYNC_KEY => serde_json::from_slice(&value).map(|v| policy.sync_key = v),
                other => {
                    warn!(key = other, "Ignoring unknown policy key");
                    Ok(())
                }
            };
            if let Err(e) = applied {
                warn!(key = %key, error = %e, "Ignoring unreadable policy value");
            }
        }
        if policy.validate().is_err() {
            warn!("Persisted policy invalid, falling back to defaults for bad fields");
            let defaults = Self::default();
            if policy.interval_ms == 0 {
                policy.interval_ms = defaults.interval_ms;
            }
            if matches!(policy.sync_key.as_deref(), Some("")) {
                policy.sync_key = None;
            }
        }
        policy
    }
}

/// Partial policy update; `None` fields keep their current value.
///
/// `sync_key: Some(None)` clears the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyUpdate {
    pub auto_sync: Option<bool>,
    pub interval_ms: Option<u64>,
    pub restrict_to_wifi: Option<bool>,
    pub restrict_to_local_network: Option<bool>,
    pub encryption_enabled: Option<bool>,
    pub sync_key: Option<Option<String>>,
}

impl PolicyUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = Some(enabled);
        self
    }

    pub fn interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = Some(ms);
        self
    }

    pub fn restrict_to_wifi(mut self, restrict: bool) -> Self {
        self.restrict_to_wifi = Some(restrict);
        self
    }

    pub fn restrict_to_local_network(mut self, restrict: bool) -> Self {
        self.restrict_to_local_network = Some(restrict);
        self
    }

    pub fn encryption_enabled(mut self, enabled: bool) -> Self {
        self.encryption_enabled = Some(enabled);
        self
    }

    pub fn sync_key(mut self, key: Option<String>) -> Self {
        self.sync_key = Some(key);
        self
    }
}

/// Where policy rows are persisted.
pub trait PolicyPersistence: Send + Sync {
    fn load_rows(&self) -> SyncResult<Vec<(String, Vec<u8>)>>;
    /// Write all rows atomically.
    fn save_rows(&self, rows: &[(&str, Vec<u8>)]) -> SyncResult<()>;
}

impl PolicyPersistence for Storage {
    fn load_rows(&self) -> SyncResult<Vec<(String, Vec<u8>)>> {
        self.load_policy_rows()
    }

    fn save_rows(&self, rows: &[(&str, Vec<u8>)]) -> SyncResult<()> {
        self.save_policy_rows(rows)
    }
}

/// Owns the current [`SyncPolicy`].
pub struct PolicyStore {
    current: RwLock<SyncPolicy>,
    persistence: Arc<dyn PolicyPersistence>,
    /// Serializes updates so concurrent writers cannot interleave
    writer: Mutex<()>,
}

impl PolicyStore {
    /// Load the persisted policy, or defaults on first run.
    pub fn load(persistence: Arc<dyn PolicyPersistence>) -> SyncResult<Self> {
        let policy = SyncPolicy::from_rows(persistence.load_rows()?);
        Ok(Self {
            current: RwLock::new(policy),
            persistence,
            writer: Mutex::new(()),
        })
    }

    pub fn get_policy(&self) -> SyncPolicy {
        self.current.read().clone()
    }

    /// Merge `update` onto the current policy and persist it.
    ///
    /// Invalid values fail with `InvalidConfig` and change nothing. A write
    /// failure returns `PolicyPersistenceFailure` but the new policy stays in
    /// effect in memory, so the caller can retry persisting it.
    pub fn update_policy(&self, update: PolicyUpdate) -> SyncResult<SyncPolicy> {
        let _writer = self.writer.lock();

        let next = self.get_policy().apply(&update);
        next.validate()?;
        let rows = next.to_rows()?;

        *self.current.write() = next.clone();

        self.persistence
            .save_rows(&rows)
            .map_err(|e| SyncError::PolicyPersistenceFailure(e.to_string()))?;

        info!(
            auto_sync = next.auto_sync,
            interval_ms = next.interval_ms,
            restrict_to_wifi = next.restrict_to_wifi,
            restrict_to_local_network = next.restrict_to_local_network,
            encryption_enabled = next.encryption_enabled,
            has_sync_key = next.sync_key.is_some(),
            "Sync policy updated"
        );
        Ok(next)
    }

    /// Generate, activate and persist a fresh sync key.
    ///
    /// Handshakes from peers holding the previous key fail from now on. If
    /// the write fails the key is still active and is returned inside
    /// `SyncKeyNotPersisted`.
    pub fn generate_sync_key(&self) -> SyncResult<String> {
        let key = hex::encode(random_bytes());
        match self.update_policy(PolicyUpdate::new().sync_key(Some(key.clone()))) {
            Ok(_) => {}
            Err(SyncError::PolicyPersistenceFailure(reason)) => {
                return Err(SyncError::SyncKeyNotPersisted { key, reason });
            }
            Err(e) => return Err(e),
        }
        info!("Generated new sync key");
        Ok(key)
    }
}
