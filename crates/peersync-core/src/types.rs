//! Core types for peersync

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::content::ContentId;
use crate::error::ErrorKind;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Opaque node identifier.
///
/// Two peers are the same peer iff their ids are equal; display metadata
/// never participates in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

/// Peers are identified exactly like nodes.
pub type PeerId = NodeId;

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and terminal output
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity of the local node, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub public_addresses: Vec<String>,
}

/// Online/offline state of the local node.
///
/// Transitions are strictly `Offline -> Starting -> Online -> Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    Starting,
    Online,
    #[default]
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Starting => write!(f, "starting"),
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Connection state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Discovered => write!(f, "discovered"),
            PeerStatus::Connecting => write!(f, "connecting"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A known peer, as tracked by the peer directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: Option<String>,
    pub status: PeerStatus,
    /// Unix millis of the last status change or sighting
    pub last_seen: i64,
    pub device_type: Option<String>,
    /// Sighted via local-network discovery
    pub is_local: bool,
    /// The last handshake carried our sync key
    pub key_verified: bool,
    pub connection_attempts: u32,
    pub successful_connections: u32,
}

impl PeerRecord {
    pub fn new(id: PeerId, status: PeerStatus) -> Self {
        Self {
            id,
            display_name: None,
            status,
            last_seen: now_millis(),
            device_type: None,
            is_local: false,
            key_verified: false,
            connection_attempts: 0,
            successful_connections: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }

    /// Connected and verified against the current sync key
    pub fn is_sync_target(&self) -> bool {
        self.is_connected() && self.key_verified
    }
}

/// Scope of a logical record: the `(record_type, record_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_type: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(record_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_type, self.record_id)
    }
}

/// Content-addressed pointer to one version of a domain record.
///
/// Never mutated in place: a change is a new `PublishedRecord` with a new
/// `content_id` and a greater `version` under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub record_type: String,
    pub record_id: String,
    pub content_id: ContentId,
    pub version: u64,
}

impl PublishedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.record_id.clone())
    }

    pub fn same_key(&self, other: &PublishedRecord) -> bool {
        self.record_type == other.record_type && self.record_id == other.record_id
    }
}

/// Process-wide sync session state, written only by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub syncing: bool,
    pub last_synced_at: Option<i64>,
    pub connected_peer_count: usize,
    pub last_error: Option<String>,
}

/// Why a single peer failed during a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one `sync_now` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peers_attempted: usize,
    pub peers_succeeded: usize,
    /// Records adopted locally plus records the peers adopted from us
    pub records_merged: usize,
    pub peer_errors: BTreeMap<PeerId, PeerFailure>,
    /// Connected peers skipped because their handshake did not carry our key
    pub excluded: Vec<PeerId>,
    pub cancelled: bool,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.peer_errors.is_empty() && !self.cancelled
    }
}
