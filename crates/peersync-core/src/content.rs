//! Content-addressed blob store
//!
//! Blobs are immutable and addressed by their BLAKE3 digest, so identical
//! bytes always map to the same [`ContentId`] and a repeated `put` is a no-op.
//! There is deliberately no update or delete: a changed record is new content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;
use crate::types::PeerId;

/// BLAKE3 digest of a blob.
///
/// Ordered bytewise; the ordering is the tie-breaker for equal versions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    /// Address the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether `data` hashes to this id
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    /// First 8 hex characters, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.short())
    }
}

impl FromStr for ContentId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SyncError::Serialization(format!("content id has {} bytes, expected 32", v.len()))
        })?;
        Ok(Self(arr))
    }
}

/// Something that can retrieve a blob from a remote peer.
///
/// Returns `Ok(None)` when the peer answered but does not hold the blob.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_from(&self, peer: &PeerId, id: &ContentId) -> SyncResult<Option<Vec<u8>>>;
}

/// Local content store backed by redb.
#[derive(Clone)]
pub struct ContentStore {
    storage: Storage,
}

impl ContentStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Store bytes and return their content id.
    pub fn put(&self, data: &[u8]) -> SyncResult<ContentId> {
        let id = ContentId::of(data);
        if self.storage.put_content(&id, data)? {
            debug!(content_id = %id.short(), size = data.len(), "Stored content");
        }
        Ok(id)
    }

    /// Read a blob held locally.
    pub fn get(&self, id: &ContentId) -> SyncResult<Vec<u8>> {
        self.storage
            .get_content(id)?
            .ok_or(SyncError::NotFound(*id))
    }

    pub fn contains(&self, id: &ContentId) -> SyncResult<bool> {
        self.storage.has_content(id)
    }

    /// Number of distinct blobs held locally
    pub fn len(&self) -> SyncResult<u64> {
        self.storage.content_count()
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read a blob locally, falling back to the given peers.
    ///
    /// Each peer gets `timeout` to answer. Bytes that do not hash to `id`
    /// are discarded. Fails with `NotFound` when no peer supplies the blob.
    pub async fn fetch(
        &self,
        id: &ContentId,
        source: &dyn ContentSource,
        peers: &[PeerId],
        timeout: Duration,
    ) -> SyncResult<Vec<u8>> {
        if let Some(data) = self.storage.get_content(id)? {
            return Ok(data);
        }

        for peer in peers {
            match tokio::time::timeout(timeout, source.fetch_from(peer, id)).await {
                Ok(Ok(Some(data))) => {
                    if !id.matches(&data) {
                        warn!(peer = %peer.short(), content_id = %id.short(), "Peer returned content with wrong hash");
                        continue;
                    }
                    self.storage.put_content(id, &data)?;
                    debug!(peer = %peer.short(), content_id = %id.short(), "Fetched content from peer");
                    return Ok(data);
                }
                Ok(Ok(None)) => {
                    debug!(peer = %peer.short(), content_id = %id.short(), "Peer does not hold content");
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer.short(), content_id = %id.short(), error = %e, "Content fetch failed");
                }
                Err(_) => {
                    debug!(peer = %peer.short(), content_id = %id.short(), "Content fetch timed out");
                }
            }
        }

        Err(SyncError::NotFound(*id))
    }
}
