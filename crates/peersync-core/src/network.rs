//! Network classification used by policy gating

use parking_lot::RwLock;
use std::fmt;

use crate::policy::SyncPolicy;
use crate::types::PeerRecord;

/// Kind of network the local device is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    Wifi,
    Ethernet,
    Cellular,
    Unknown,
}

impl NetworkKind {
    /// Satisfies `restrictToWifi`
    pub fn is_unmetered(&self) -> bool {
        matches!(self, NetworkKind::Wifi | NetworkKind::Ethernet)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkKind::Wifi => write!(f, "wifi"),
            NetworkKind::Ethernet => write!(f, "ethernet"),
            NetworkKind::Cellular => write!(f, "cellular"),
            NetworkKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Supplies the current network classification.
pub trait NetworkInfo: Send + Sync {
    fn kind(&self) -> NetworkKind;

    /// Whether `peer` is reachable on the local network.
    fn is_local_peer(&self, peer: &PeerRecord) -> bool {
        peer.is_local
    }
}

/// Fixed classification, adjustable at runtime.
#[derive(Debug)]
pub struct StaticNetworkInfo {
    kind: RwLock<NetworkKind>,
}

impl StaticNetworkInfo {
    pub fn new(kind: NetworkKind) -> Self {
        Self {
            kind: RwLock::new(kind),
        }
    }

    pub fn set_kind(&self, kind: NetworkKind) {
        *self.kind.write() = kind;
    }
}

impl Default for StaticNetworkInfo {
    fn default() -> Self {
        Self::new(NetworkKind::Unknown)
    }
}

impl NetworkInfo for StaticNetworkInfo {
    fn kind(&self) -> NetworkKind {
        *self.kind.read()
    }
}

/// Check the network restrictions of `policy` for one peer.
///
/// Returns the restriction that applies, if any.
pub fn policy_restriction(
    policy: &SyncPolicy,
    network: &dyn NetworkInfo,
    peer: &PeerRecord,
) -> Option<String> {
    if policy.restrict_to_wifi {
        let kind = network.kind();
        if !kind.is_unmetered() {
            return Some(format!("wifi only, current network is {}", kind));
        }
    }
    if policy.restrict_to_local_network && !network.is_local_peer(peer) {
        return Some("local network only, peer is not local".to_string());
    }
    None
}
