//! Peer directory
//!
//! Tracks every peer this node knows about and drives the handshake that
//! moves a peer to `Connected`. A peer only becomes a sync target after a
//! handshake carrying the current sync key fingerprint succeeds; the key is
//! re-checked on every new connection attempt.
//!
//! Records are persisted on every change and restored as `Disconnected`.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::node::NodeLifecycle;
use crate::policy::PolicyStore;
use crate::storage::Storage;
use crate::sync::events::{EventSender, SyncEvent};
use crate::sync::protocol::{decode_frame, encode_frame, RejectReason, SyncMessage};
use crate::sync::transport::Sighting;
use crate::types::{now_millis, PeerId, PeerRecord, PeerStatus};

/// Advisory metadata a peer sent in its handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMeta {
    pub display_name: Option<String>,
    pub device_type: Option<String>,
}

struct DirectoryInner {
    node: Arc<NodeLifecycle>,
    storage: Storage,
    policy: Arc<PolicyStore>,
    events: EventSender,
    config: EngineConfig,
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
}

#[derive(Clone)]
pub struct PeerDirectory {
    inner: Arc<DirectoryInner>,
}

impl PeerDirectory {
    /// Load persisted peers. Every restored peer starts `Disconnected`.
    pub fn load(
        node: Arc<NodeLifecycle>,
        storage: Storage,
        policy: Arc<PolicyStore>,
        events: EventSender,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let mut peers = HashMap::new();
        for mut peer in storage.list_peers()? {
            peer.status = PeerStatus::Disconnected;
            peers.insert(peer.id.clone(), peer);
        }
        debug!(count = peers.len(), "Loaded peer directory");

        Ok(Self {
            inner: Arc::new(DirectoryInner {
                node,
                storage,
                policy,
                events,
                config,
                peers: Mutex::new(peers),
            }),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.inner.peers.lock().get(peer).cloned()
    }

    /// All known peers, ordered by id.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.inner.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Peers with `status == Connected`, ordered by id.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.list().into_iter().filter(|p| p.is_connected()).collect()
    }

    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.connected_peers().into_iter().map(|p| p.id).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connection management
    // ═══════════════════════════════════════════════════════════════════════

    /// Connect to `peer` and verify the sync key.
    ///
    /// Makes up to `connect_attempts` tries with doubling backoff. A key
    /// mismatch is not retried: the peer stays `Discovered` and
    /// `SyncKeyMismatch` is returned. Exhausted retries leave the peer
    /// `Disconnected` and return `PeerUnreachable`.
    pub async fn connect(&self, peer: &PeerId) -> SyncResult<PeerRecord> {
        self.inner.node.require_online()?;
        self.reject_self(peer)?;
        self.establish(peer, PeerStatus::Disconnected).await
    }

    /// Mark `peer` disconnected. Unknown peers are already disconnected.
    pub fn disconnect(&self, peer: &PeerId) -> SyncResult<()> {
        self.inner.node.require_online()?;
        if self.get(peer).is_none() {
            debug!(peer = %peer.short(), "Disconnect for unknown peer ignored");
            return Ok(());
        }
        self.update(peer, |record| {
            record.status = PeerStatus::Disconnected;
            record.last_seen = now_millis();
        })?;
        info!(peer = %peer.short(), "Peer disconnected");
        Ok(())
    }

    /// Mark every peer disconnected; used when the node goes offline.
    pub fn disconnect_all(&self) -> SyncResult<()> {
        let ids: Vec<PeerId> = self
            .inner
            .peers
            .lock()
            .values()
            .filter(|p| p.status != PeerStatus::Disconnected)
            .map(|p| p.id.clone())
            .collect();
        for id in &ids {
            self.update(id, |record| record.status = PeerStatus::Disconnected)?;
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "Disconnected all peers");
        }
        Ok(())
    }

    /// Remove idle peers last seen before `now - retention`.
    ///
    /// Only `Disconnected` and `Discovered` peers are eligible. Returns the
    /// removed ids.
    pub fn prune(&self, retention: Duration) -> SyncResult<Vec<PeerId>> {
        let retention = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention);
        let mut peers = self.inner.peers.lock();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|p| {
                matches!(p.status, PeerStatus::Disconnected | PeerStatus::Discovered)
                    && p.last_seen < cutoff
            })
            .map(|p| p.id.clone())
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }
        self.inner.storage.delete_peers(&stale)?;
        for id in &stale {
            peers.remove(id);
        }
        info!(count = stale.len(), "Pruned stale peers");
        Ok(stale)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handshake
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-run the handshake with a connected peer before exchanging data.
    ///
    /// On mismatch the peer keeps its status but loses `key_verified`.
    pub async fn verify(&self, peer: &PeerId) -> SyncResult<PeerMeta> {
        match self.handshake(peer).await {
            Ok(meta) => {
                self.update(peer, |record| {
                    record.key_verified = true;
                    record.last_seen = now_millis();
                    apply_meta(record, &meta);
                })?;
                Ok(meta)
            }
            Err(SyncError::SyncKeyMismatch(p)) => {
                self.mark_key_mismatch(&p)?;
                Err(SyncError::SyncKeyMismatch(p))
            }
            Err(e) => Err(e),
        }
    }

    /// Record that the latest handshake with `peer` did not carry our key.
    pub fn mark_key_mismatch(&self, peer: &PeerId) -> SyncResult<()> {
        if self.get(peer).is_none() {
            return Ok(());
        }
        self.update(peer, |record| record.key_verified = false)?;
        warn!(peer = %peer.short(), "Sync key mismatch, peer excluded from sync");
        Ok(())
    }

    /// Record a handshake initiated by `from`.
    ///
    /// A matching key marks the peer connected; a mismatch records it as
    /// unverified without changing an existing status.
    pub fn record_inbound_hello(&self, from: &PeerId, matched: bool, meta: PeerMeta) -> SyncResult<()> {
        if self.is_self(from) {
            return Ok(());
        }
        let known = self.get(from).is_some();
        self.upsert(from, PeerStatus::Discovered, |record| {
            apply_meta(record, &meta);
            record.last_seen = now_millis();
            record.key_verified = matched;
            if matched {
                if !record.is_connected() {
                    record.successful_connections += 1;
                }
                record.status = PeerStatus::Connected;
            }
        })?;
        if !known || matched {
            debug!(peer = %from.short(), matched, "Inbound handshake");
        }
        Ok(())
    }

    async fn establish(&self, peer: &PeerId, on_failure: PeerStatus) -> SyncResult<PeerRecord> {
        // Status stays put until the handshake proves a shared sync key
        self.upsert(peer, PeerStatus::Discovered, |record| {
            record.connection_attempts += 1;
        })?;

        let outcome = self
            .retry_with_backoff("connect", || async {
                self.inner.node.transport().connect(peer).await?;
                self.handshake(peer).await
            })
            .await;

        match outcome {
            Ok(meta) => {
                let record = self.update(peer, |record| {
                    record.status = PeerStatus::Connected;
                    record.key_verified = true;
                    record.last_seen = now_millis();
                    record.successful_connections += 1;
                    apply_meta(record, &meta);
                })?;
                info!(peer = %peer.short(), name = ?record.display_name, "Peer connected");
                Ok(record)
            }
            Err(SyncError::SyncKeyMismatch(p)) => {
                self.update(peer, |record| {
                    record.status = PeerStatus::Discovered;
                    record.key_verified = false;
                })?;
                warn!(peer = %peer.short(), "Handshake rejected, sync key mismatch");
                Err(SyncError::SyncKeyMismatch(p))
            }
            Err(SyncError::NodeOffline) => {
                self.update(peer, |record| record.status = on_failure)?;
                Err(SyncError::NodeOffline)
            }
            Err(e) => {
                self.update(peer, |record| record.status = on_failure)?;
                Err(SyncError::PeerUnreachable {
                    peer: peer.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// One `Hello` round trip under the handshake timeout.
    async fn handshake(&self, peer: &PeerId) -> SyncResult<PeerMeta> {
        let config = &self.inner.config;
        let hello = encode_frame(SyncMessage::Hello {
            key_fingerprint: self.inner.policy.get_policy().key_fingerprint(),
            display_name: config.display_name.clone(),
            device_type: config.device_type.clone(),
        })?;

        let response = tokio::time::timeout(
            config.handshake_timeout,
            self.inner.node.transport().request(peer, hello),
        )
        .await
        .map_err(|_| SyncError::Timeout(format!("handshake with {}", peer.short())))??;

        match decode_frame(&response)? {
            SyncMessage::Welcome {
                display_name,
                device_type,
            } => Ok(PeerMeta {
                display_name,
                device_type,
            }),
            SyncMessage::Rejected {
                reason: RejectReason::KeyMismatch,
            } => Err(SyncError::SyncKeyMismatch(peer.clone())),
            SyncMessage::Rejected {
                reason: RejectReason::NodeOffline,
            } => Err(SyncError::Network(format!("{} is offline", peer.short()))),
            SyncMessage::Rejected { reason } => Err(SyncError::Protocol(reason.to_string())),
            other => Err(SyncError::Protocol(format!(
                "unexpected handshake reply: {}",
                other.kind()
            ))),
        }
    }

    /// Retry retryable failures with exponential backoff (base, 2x, 4x, ...).
    async fn retry_with_backoff<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.inner.config.connect_attempts;
        let base = self.inner.config.connect_backoff;

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = base * 2u32.pow(attempt - 1);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    self.inner.node.require_online()?;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(operation = operation_name, attempt, error = %e, "Operation failed");
                    return Err(e);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local discovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Lazily stream local-network sightings.
    ///
    /// Each sighting upserts the peer as local and attempts a handshake; the
    /// stream yields the resulting record. Calling this again starts a fresh
    /// stream. Cancelling or dropping the stream stops new sightings but
    /// keeps every record already made. The stream also ends when the node
    /// goes offline.
    pub fn discover_local(&self) -> SyncResult<DiscoveryStream> {
        self.inner.node.require_online()?;

        let token = self.inner.node.session_token().child_token();
        let stop = token.clone();
        let directory = self.clone();
        let mut sightings = self.inner.node.transport().discover();

        let stream = async_stream::stream! {
            loop {
                let sighting = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = sightings.next() => match next {
                        Some(sighting) => sighting,
                        None => break,
                    },
                };
                match directory.on_sighting(sighting).await {
                    Ok(Some(record)) => yield record,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to record sighting"),
                }
            }
            debug!("Local discovery stopped");
        };

        info!("Local discovery started");
        Ok(DiscoveryStream {
            inner: Box::pin(stream),
            token,
        })
    }

    async fn on_sighting(&self, sighting: Sighting) -> SyncResult<Option<PeerRecord>> {
        let peer = sighting.peer.clone();
        if self.is_self(&peer) {
            return Ok(None);
        }

        let record = self.upsert(&peer, PeerStatus::Discovered, |record| {
            record.is_local = true;
            record.last_seen = now_millis();
            if record.status == PeerStatus::Disconnected {
                record.status = PeerStatus::Discovered;
            }
            apply_meta(
                record,
                &PeerMeta {
                    display_name: sighting.display_name.clone(),
                    device_type: sighting.device_type.clone(),
                },
            );
        })?;
        debug!(peer = %peer.short(), "Sighted local peer");

        if record.is_sync_target() {
            return Ok(Some(record));
        }

        match self.establish(&peer, PeerStatus::Discovered).await {
            Ok(record) => Ok(Some(record)),
            Err(SyncError::NodeOffline) => Ok(None),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Sighted peer not connected");
                Ok(self.get(&peer))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    fn is_self(&self, peer: &PeerId) -> bool {
        self.inner
            .node
            .identity()
            .map_or(false, |identity| identity.id == *peer)
    }

    fn reject_self(&self, peer: &PeerId) -> SyncResult<()> {
        if self.is_self(peer) {
            return Err(SyncError::InvalidConfig("cannot connect to self".to_string()));
        }
        Ok(())
    }

    /// Apply `change` to an existing peer, persist, and report status moves.
    fn update<F>(&self, peer: &PeerId, change: F) -> SyncResult<PeerRecord>
    where
        F: FnOnce(&mut PeerRecord),
    {
        let mut peers = self.inner.peers.lock();
        let Some(current) = peers.get(peer) else {
            return Err(SyncError::PeerUnreachable {
                peer: peer.clone(),
                reason: "unknown peer".to_string(),
            });
        };
        let previous = Some(current.status);
        let mut next = current.clone();
        change(&mut next);
        self.commit(&mut peers, previous, next)
    }

    /// Like [`Self::update`], inserting a fresh record with `initial` status
    /// for an unknown peer first.
    fn upsert<F>(&self, peer: &PeerId, initial: PeerStatus, change: F) -> SyncResult<PeerRecord>
    where
        F: FnOnce(&mut PeerRecord),
    {
        let mut peers = self.inner.peers.lock();
        let (previous, mut next) = match peers.get(peer) {
            Some(current) => (Some(current.status), current.clone()),
            None => (None, PeerRecord::new(peer.clone(), initial)),
        };
        change(&mut next);
        self.commit(&mut peers, previous, next)
    }

    fn commit(
        &self,
        peers: &mut HashMap<PeerId, PeerRecord>,
        previous: Option<PeerStatus>,
        next: PeerRecord,
    ) -> SyncResult<PeerRecord> {
        self.inner.storage.save_peer(&next)?;
        peers.insert(next.id.clone(), next.clone());
        if previous != Some(next.status) {
            debug!(peer = %next.id.short(), from = ?previous, to = %next.status, "Peer status changed");
            self.inner.events.emit(SyncEvent::PeerStatusChanged {
                peer: next.id.clone(),
                status: next.status,
            });
        }
        Ok(next)
    }
}

fn apply_meta(record: &mut PeerRecord, meta: &PeerMeta) {
    if meta.display_name.is_some() {
        record.display_name = meta.display_name.clone();
    }
    if meta.device_type.is_some() {
        record.device_type = meta.device_type.clone();
    }
}

/// Stream returned by [`PeerDirectory::discover_local`].
pub struct DiscoveryStream {
    inner: Pin<Box<dyn Stream<Item = PeerRecord> + Send>>,
    token: CancellationToken,
}

impl DiscoveryStream {
    /// Stop producing sightings. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for DiscoveryStream {
    type Item = PeerRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::create_test_storage;
    use crate::sync::transport::{InboundHandler, MemoryNetwork, MemoryTransport};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Answers handshakes like a peer holding `key`.
    struct Responder {
        key: Option<String>,
    }

    #[async_trait]
    impl InboundHandler for Responder {
        async fn handle(&self, _from: &PeerId, request: Vec<u8>) -> Vec<u8> {
            let ours = crate::crypto::fingerprint(self.key.as_deref());
            let reply = match decode_frame(&request) {
                Ok(SyncMessage::Hello { key_fingerprint, .. }) if key_fingerprint == ours => {
                    SyncMessage::Welcome {
                        display_name: Some("responder".to_string()),
                        device_type: Some("laptop".to_string()),
                    }
                }
                _ => SyncMessage::Rejected {
                    reason: RejectReason::KeyMismatch,
                },
            };
            encode_frame(reply).unwrap()
        }
    }

    struct Fixture {
        directory: PeerDirectory,
        node: Arc<NodeLifecycle>,
        policy: Arc<PolicyStore>,
        events: EventSender,
        _temp: TempDir,
    }

    async fn fixture(network: &MemoryNetwork, name: &str) -> Fixture {
        let (storage, temp) = create_test_storage();
        let events = EventSender::new(64);
        let node = Arc::new(NodeLifecycle::new(
            Arc::new(network.transport(name)),
            storage.clone(),
            false,
            events.clone(),
        ));
        node.start(Arc::new(Responder { key: None })).await.unwrap();
        let policy = Arc::new(PolicyStore::load(Arc::new(storage.clone())).unwrap());
        let config = EngineConfig {
            connect_backoff: Duration::from_millis(1),
            ..EngineConfig::new(temp.path())
        };
        let directory =
            PeerDirectory::load(node.clone(), storage, policy.clone(), events.clone(), config)
                .unwrap();
        Fixture {
            directory,
            node,
            policy,
            events,
            _temp: temp,
        }
    }

    async fn remote(network: &MemoryNetwork, name: &str, key: Option<&str>) -> NodeLifecycle {
        let (storage, _temp) = create_test_storage();
        let node = NodeLifecycle::new(
            Arc::new(network.transport(name)),
            storage,
            false,
            EventSender::new(4),
        );
        node.start(Arc::new(Responder {
            key: key.map(str::to_string),
        }))
        .await
        .unwrap();
        node
    }

    #[tokio::test]
    async fn test_connect_marks_peer_connected() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;

        let record = f.directory.connect(&PeerId::new("b")).await.unwrap();
        assert_eq!(record.status, PeerStatus::Connected);
        assert!(record.key_verified);
        assert_eq!(record.display_name.as_deref(), Some("responder"));
        assert_eq!(record.successful_connections, 1);
        assert_eq!(f.directory.connected_ids(), vec![PeerId::new("b")]);
    }

    #[tokio::test]
    async fn test_connect_unreachable_after_retries() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;

        let err = f.directory.connect(&PeerId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable { .. }));

        let record = f.directory.get(&PeerId::new("ghost")).unwrap();
        assert_eq!(record.status, PeerStatus::Disconnected);
        assert_eq!(record.connection_attempts, 1);
        assert!(f.directory.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_with_mismatched_key_stays_discovered() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", Some("other-key")).await;
        let mut rx = f.events.subscribe();

        let err = f.directory.connect(&PeerId::new("b")).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncKeyMismatch(_)));
        assert!(!err.is_retryable());

        let record = f.directory.get(&PeerId::new("b")).unwrap();
        assert_eq!(record.status, PeerStatus::Discovered);
        assert!(!record.key_verified);

        let mut history = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::PeerStatusChanged { status, .. } = event {
                history.push(status);
            }
        }
        assert_eq!(history, vec![PeerStatus::Discovered]);
    }

    #[tokio::test]
    async fn test_key_rotation_is_checked_on_next_connect() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;
        let b = PeerId::new("b");

        f.directory.connect(&b).await.unwrap();
        f.policy.generate_sync_key().unwrap();

        assert!(matches!(
            f.directory.verify(&b).await,
            Err(SyncError::SyncKeyMismatch(_))
        ));
        let record = f.directory.get(&b).unwrap();
        assert_eq!(record.status, PeerStatus::Connected);
        assert!(!record.is_sync_target());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;
        let b = PeerId::new("b");

        f.directory.connect(&b).await.unwrap();
        f.directory.disconnect(&b).unwrap();
        f.directory.disconnect(&b).unwrap();
        f.directory.disconnect(&PeerId::new("never-seen")).unwrap();

        assert_eq!(f.directory.get(&b).unwrap().status, PeerStatus::Disconnected);
        assert!(f.directory.get(&PeerId::new("never-seen")).is_none());
    }

    #[tokio::test]
    async fn test_offline_operations_fail_without_mutation() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;
        f.node.stop().await;

        let b = PeerId::new("b");
        assert!(matches!(f.directory.connect(&b).await, Err(SyncError::NodeOffline)));
        assert!(matches!(f.directory.disconnect(&b), Err(SyncError::NodeOffline)));
        assert!(matches!(f.directory.discover_local(), Err(SyncError::NodeOffline)));
        assert!(f.directory.list().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_connected_and_recent_peers() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;
        f.directory.connect(&PeerId::new("b")).await.unwrap();
        let _ = f.directory.connect(&PeerId::new("gone")).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = f.directory.prune(Duration::from_millis(10)).unwrap();
        assert_eq!(removed, vec![PeerId::new("gone")]);
        assert!(f.directory.get(&PeerId::new("b")).is_some());

        assert!(f.directory.prune(Duration::from_secs(3600)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_with_unbounded_retention_removes_nothing() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _ = f.directory.connect(&PeerId::new("gone")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(f.directory.prune(Duration::MAX).unwrap().is_empty());
        assert!(f.directory.get(&PeerId::new("gone")).is_some());
    }

    #[tokio::test]
    async fn test_peers_reload_disconnected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("peers.redb");
        let network = MemoryNetwork::new();
        let _b = remote(&network, "b", None).await;
        let events = EventSender::new(8);

        {
            let storage = Storage::new(&path).unwrap();
            let node = Arc::new(NodeLifecycle::new(
                Arc::new(network.transport("a")),
                storage.clone(),
                false,
                events.clone(),
            ));
            node.start(Arc::new(Responder { key: None })).await.unwrap();
            let policy = Arc::new(PolicyStore::load(Arc::new(storage.clone())).unwrap());
            let directory = PeerDirectory::load(
                node.clone(),
                storage,
                policy,
                events.clone(),
                EngineConfig::new(temp.path()),
            )
            .unwrap();
            directory.connect(&PeerId::new("b")).await.unwrap();
            node.stop().await;
        }

        let storage = Storage::new(&path).unwrap();
        let node = Arc::new(NodeLifecycle::new(
            Arc::new(MemoryTransport::detached()),
            storage.clone(),
            false,
            events.clone(),
        ));
        let policy = Arc::new(PolicyStore::load(Arc::new(storage.clone())).unwrap());
        let directory =
            PeerDirectory::load(node, storage, policy, events, EngineConfig::new(temp.path()))
                .unwrap();
        let peer = directory.get(&PeerId::new("b")).unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(peer.display_name.as_deref(), Some("responder"));
    }

    #[tokio::test]
    async fn test_discover_local_connects_sighted_peers() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let _b = remote(&network, "b", None).await;

        let mut discovery = f.directory.discover_local().unwrap();
        let first = discovery.next().await.unwrap();
        assert_eq!(first.id, PeerId::new("b"));
        assert!(first.is_local);
        assert_eq!(first.status, PeerStatus::Connected);

        let _c = remote(&network, "c", Some("other")).await;
        let second = discovery.next().await.unwrap();
        assert_eq!(second.id, PeerId::new("c"));
        assert_eq!(second.status, PeerStatus::Discovered);

        discovery.cancel();
        assert!(discovery.next().await.is_none());
        assert_eq!(f.directory.list().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_ends_discovery() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;

        let mut discovery = f.directory.discover_local().unwrap();
        f.node.stop().await;
        assert!(discovery.next().await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_hello_records_peer() {
        let network = MemoryNetwork::new();
        let f = fixture(&network, "a").await;
        let meta = PeerMeta {
            display_name: Some("phone".to_string()),
            device_type: None,
        };

        f.directory
            .record_inbound_hello(&PeerId::new("x"), false, meta.clone())
            .unwrap();
        let record = f.directory.get(&PeerId::new("x")).unwrap();
        assert_eq!(record.status, PeerStatus::Discovered);
        assert!(!record.key_verified);

        f.directory
            .record_inbound_hello(&PeerId::new("x"), true, meta)
            .unwrap();
        assert!(f.directory.get(&PeerId::new("x")).unwrap().is_sync_target());
    }
}
