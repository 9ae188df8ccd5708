//! Sync coordinator
//!
//! Runs sync passes against connected peers and answers the passes other
//! nodes run against us.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncCoordinator                                                │
//! │  ├── sync_now()          one pass, at most one at a time        │
//! │  │   └── per peer: Hello -> Exchange -> integrate -> Offer      │
//! │  ├── InboundHandler      answers Hello/Exchange/Offer/Fetch     │
//! │  ├── ContentSource       Fetch round trips for missing blobs    │
//! │  └── spawn_auto_sync()   interval task bound to the session     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A pass pulls the peer's headers changed since our `received` checkpoint,
//! resolves each against the local index, then offers back our own changes
//! since the `offered` checkpoint plus every local winner the peer does not
//! have. Checkpoints advance only after the peer finished without error.
//!
//! Per-peer failures are recorded in the [`SyncReport`] and never abort the
//! pass. Stopping the node cancels the pass; records already adopted stay
//! adopted.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Adoption, PublishBus};
use crate::config::EngineConfig;
use crate::content::{ContentId, ContentSource, ContentStore};
use crate::error::{SyncError, SyncResult};
use crate::network::{policy_restriction, NetworkInfo};
use crate::node::NodeLifecycle;
use crate::peers::{PeerDirectory, PeerMeta};
use crate::policy::{PolicyStore, SyncPolicy};
use crate::records::RecordIndex;
use crate::resolver::{resolve_records, Candidate, ConflictResolver};
use crate::storage::{Checkpoint, Storage};
use crate::sync::events::{EventSender, SyncEvent};
use crate::sync::protocol::{decode_frame, encode_frame, RejectReason, SyncMessage};
use crate::sync::transport::InboundHandler;
use crate::types::{now_millis, PeerFailure, PeerId, PublishedRecord, RecordKey, SyncReport, SyncSession};

pub struct SyncCoordinator {
    node: Arc<NodeLifecycle>,
    peers: PeerDirectory,
    bus: PublishBus,
    content: ContentStore,
    index: Arc<RecordIndex>,
    storage: Storage,
    policy: Arc<PolicyStore>,
    network: Arc<dyn NetworkInfo>,
    resolver: Arc<dyn ConflictResolver>,
    events: EventSender,
    config: EngineConfig,
    in_flight: AtomicBool,
    session: RwLock<SyncSession>,
    last_report: RwLock<Option<SyncReport>>,
    /// Exchanges started by this node, for observing pass overlap
    exchanges: AtomicUsize,
}

/// Clears the in-flight flag even if the pass future is dropped.
struct InFlightGuard<'a>(&'a SyncCoordinator);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.session.write().syncing = false;
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Arc<NodeLifecycle>,
        peers: PeerDirectory,
        bus: PublishBus,
        content: ContentStore,
        index: Arc<RecordIndex>,
        storage: Storage,
        policy: Arc<PolicyStore>,
        network: Arc<dyn NetworkInfo>,
        resolver: Arc<dyn ConflictResolver>,
        events: EventSender,
        config: EngineConfig,
    ) -> Self {
        Self {
            node,
            peers,
            bus,
            content,
            index,
            storage,
            policy,
            network,
            resolver,
            events,
            config,
            in_flight: AtomicBool::new(false),
            session: RwLock::new(SyncSession::default()),
            last_report: RwLock::new(None),
            exchanges: AtomicUsize::new(0),
        }
    }

    pub fn session(&self) -> SyncSession {
        self.session.read().clone()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of peer exchanges this node has started.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync pass
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one sync pass against every connected peer.
    ///
    /// Fails with `NodeOffline` or `NoPeers` before touching the session,
    /// and with `SyncInProgress` when another pass is running.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.node.require_online()?;
        let targets = self.peers.connected_peers();
        if targets.is_empty() {
            return Err(SyncError::NoPeers);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let _guard = InFlightGuard(self);

        self.session.write().syncing = true;
        self.events.emit(SyncEvent::SyncStarted {
            peer_count: targets.len(),
        });
        info!(peers = targets.len(), "Sync pass started");

        let token = self.node.session_token();
        let policy = self.policy.get_policy();
        let mut report = SyncReport {
            started_at: now_millis(),
            ..Default::default()
        };

        for peer in targets {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let id = peer.id.clone();

            if let Some(reason) = policy_restriction(&policy, self.network.as_ref(), &peer) {
                debug!(peer = %id.short(), %reason, "Peer skipped by policy");
                record_failure(
                    &mut report,
                    &id,
                    SyncError::PolicyRestricted {
                        peer: id.clone(),
                        reason,
                    },
                );
                continue;
            }

            let verified = tokio::select! {
                _ = token.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                result = self.peers.verify(&id) => result,
            };
            match verified {
                Ok(_) => {}
                Err(SyncError::SyncKeyMismatch(_)) => {
                    report.excluded.push(id);
                    continue;
                }
                Err(e) => {
                    report.peers_attempted += 1;
                    record_failure(&mut report, &id, e);
                    continue;
                }
            }

            report.peers_attempted += 1;
            let exchange = tokio::time::timeout(self.config.exchange_timeout, self.exchange(&id, &policy));
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                result = exchange => result.unwrap_or_else(|_| {
                    Err(SyncError::Timeout(format!("exchange with {}", id.short())))
                }),
            };
            match outcome {
                Ok(merged) => {
                    report.peers_succeeded += 1;
                    report.records_merged += merged;
                    debug!(peer = %id.short(), merged, "Peer synced");
                }
                Err(e) => record_failure(&mut report, &id, e),
            }
        }

        report.finished_at = now_millis();
        self.finish(report.clone());
        Ok(report)
    }

    fn finish(&self, report: SyncReport) {
        let last_error = if report.cancelled {
            Some("sync cancelled".to_string())
        } else {
            report
                .peer_errors
                .iter()
                .next()
                .map(|(peer, failure)| format!("{}: {}", peer.short(), failure.message))
        };

        {
            let mut session = self.session.write();
            session.syncing = false;
            session.last_synced_at = Some(report.finished_at);
            session.connected_peer_count = report.peers_succeeded;
            session.last_error = last_error.clone();
        }
        *self.last_report.write() = Some(report.clone());

        let failed = report.cancelled
            || (report.peers_succeeded == 0 && !report.peer_errors.is_empty());
        if failed {
            warn!(
                attempted = report.peers_attempted,
                errors = report.peer_errors.len(),
                cancelled = report.cancelled,
                "Sync pass failed"
            );
            self.events.emit(SyncEvent::SyncFailed {
                message: last_error.unwrap_or_default(),
            });
        } else {
            info!(
                attempted = report.peers_attempted,
                succeeded = report.peers_succeeded,
                merged = report.records_merged,
                excluded = report.excluded.len(),
                "Sync pass completed"
            );
            self.events.emit(SyncEvent::SyncCompleted(report));
        }
    }

    /// Pull, integrate and offer with one peer. Returns records merged on
    /// either side.
    async fn exchange(&self, peer: &PeerId, policy: &SyncPolicy) -> SyncResult<usize> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let key_fingerprint = policy.key_fingerprint();
        let checkpoint = self.storage.load_checkpoint(peer)?;

        let reply = self
            .call(
                peer,
                SyncMessage::Exchange {
                    key_fingerprint,
                    since: checkpoint.received,
                },
            )
            .await?;
        let (remote, remote_head) = match reply {
            SyncMessage::Headers { records, head_seq } => (records, head_seq),
            other => return Err(unexpected(peer, other)),
        };
        debug!(peer = %peer.short(), headers = remote.len(), since = checkpoint.received, "Received headers");

        let mut merged = 0;
        let mut contested: Vec<RecordKey> = Vec::new();
        for header in &remote {
            match self.integrate(peer, header).await? {
                Adoption::Adopted(winner) => {
                    merged += 1;
                    if winner != *header {
                        contested.push(winner.key());
                    }
                }
                Adoption::Kept(_) => contested.push(header.key()),
                Adoption::Unchanged => {}
            }
        }

        let (changed, local_head) = self.index.changed_since(checkpoint.offered);
        let mut offers: BTreeMap<RecordKey, PublishedRecord> = BTreeMap::new();
        for key in changed.iter().map(PublishedRecord::key).chain(contested) {
            if let Some(current) = self.index.get(&key) {
                offers.insert(key, current);
            }
        }
        offers.retain(|_, record| !remote.contains(record));

        let mut complete = true;
        if !offers.is_empty() {
            let count = offers.len();
            let reply = self
                .call(
                    peer,
                    SyncMessage::Offer {
                        key_fingerprint,
                        records: offers.into_values().collect(),
                    },
                )
                .await?;
            match reply {
                SyncMessage::Accepted { adopted, failed } => {
                    debug!(peer = %peer.short(), offered = count, adopted, "Offer accepted");
                    merged += adopted as usize;
                    if !failed.is_empty() {
                        // Keep the checkpoint so the whole exchange is replayed next pass
                        warn!(
                            peer = %peer.short(),
                            failed = failed.len(),
                            "Peer could not adopt offered records, checkpoint held"
                        );
                        complete = false;
                    }
                }
                other => return Err(unexpected(peer, other)),
            }
        }

        if !complete {
            return Ok(merged);
        }
        self.storage.save_checkpoint(
            peer,
            &Checkpoint {
                received: remote_head,
                offered: local_head,
            },
        )?;
        Ok(merged)
    }

    /// Resolve one remote header against the local index.
    ///
    /// Content is fetched from `peer` only when the remote side can win.
    async fn integrate(&self, peer: &PeerId, header: &PublishedRecord) -> SyncResult<Adoption> {
        let local = self.index.get(&header.key());
        if let Some(local) = &local {
            if local == header {
                return Ok(Adoption::Unchanged);
            }
            if !self.resolver.needs_payloads() {
                let resolved = resolve_records(
                    self.resolver.as_ref(),
                    Candidate::new(local),
                    Candidate::new(header),
                );
                if resolved.record == *local {
                    return Ok(Adoption::Kept(local.clone()));
                }
            }
        }

        self.content
            .fetch(&header.content_id, self, &[peer.clone()], self.config.fetch_timeout)
            .await?;
        self.bus
            .adopt(header, None, self.resolver.as_ref(), Some(peer))
    }

    async fn call(&self, peer: &PeerId, message: SyncMessage) -> SyncResult<SyncMessage> {
        let request = encode_frame(message)?;
        let response = self.node.transport().request(peer, request).await?;
        match decode_frame(&response)? {
            SyncMessage::Rejected { reason } => Err(rejection(peer, reason)),
            reply => Ok(reply),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Automatic sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `sync_now` every policy interval while `autoSync` is on.
    ///
    /// The policy is re-read each tick. A tick that finds a pass running is
    /// skipped. The task ends when the current node session ends.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let token = self.node.session_token();

        tokio::spawn(async move {
            loop {
                let interval = coordinator.policy.get_policy().interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !coordinator.policy.get_policy().auto_sync {
                    continue;
                }
                match coordinator.sync_now().await {
                    Ok(report) => debug!(
                        succeeded = report.peers_succeeded,
                        merged = report.records_merged,
                        "Automatic sync finished"
                    ),
                    Err(SyncError::SyncInProgress) => debug!("Automatic sync skipped, pass in progress"),
                    Err(SyncError::NoPeers) | Err(SyncError::NodeOffline) => {}
                    Err(e) => warn!(error = %e, "Automatic sync failed"),
                }
            }
            debug!("Automatic sync stopped");
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Responder
    // ═══════════════════════════════════════════════════════════════════════

    async fn respond(&self, from: &PeerId, message: SyncMessage) -> SyncMessage {
        if !self.node.is_online() {
            return SyncMessage::Rejected {
                reason: RejectReason::NodeOffline,
            };
        }
        let policy = self.policy.get_policy();
        let ours = policy.key_fingerprint();

        if let SyncMessage::Hello {
            key_fingerprint,
            display_name,
            device_type,
        } = message
        {
            let matched = key_fingerprint == ours;
            let meta = PeerMeta {
                display_name,
                device_type,
            };
            if let Err(e) = self.peers.record_inbound_hello(from, matched, meta) {
                warn!(peer = %from.short(), error = %e, "Failed to record inbound handshake");
            }
            if !matched {
                debug!(peer = %from.short(), "Rejected handshake with foreign sync key");
                return SyncMessage::Rejected {
                    reason: RejectReason::KeyMismatch,
                };
            }
            return SyncMessage::Welcome {
                display_name: self.config.display_name.clone(),
                device_type: self.config.device_type.clone(),
            };
        }

        if message.key_fingerprint() != Some(&ours) {
            return SyncMessage::Rejected {
                reason: RejectReason::KeyMismatch,
            };
        }

        match message {
            SyncMessage::Exchange { since, .. } => {
                // A peer ahead of our log saw a previous incarnation of it
                let since = if since > self.index.head_seq() { 0 } else { since };
                let (records, head_seq) = self.index.changed_since(since);
                SyncMessage::Headers { records, head_seq }
            }
            SyncMessage::Offer { records, .. } => {
                let mut adopted = 0u32;
                let mut failed = Vec::new();
                for header in &records {
                    match self.integrate(from, header).await {
                        Ok(Adoption::Adopted(_)) => adopted += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                peer = %from.short(),
                                record = %header.key(),
                                error = %e,
                                "Failed to adopt offered record"
                            );
                            failed.push(header.key());
                        }
                    }
                }
                SyncMessage::Accepted { adopted, failed }
            }
            SyncMessage::Fetch { content_id, .. } => self.serve_content(&policy, &content_id),
            other => SyncMessage::Rejected {
                reason: RejectReason::Internal(format!("unexpected request: {}", other.kind())),
            },
        }
    }

    fn serve_content(&self, policy: &SyncPolicy, content_id: &ContentId) -> SyncMessage {
        let bytes = match self.content.get(content_id) {
            Ok(bytes) => bytes,
            Err(SyncError::NotFound(_)) => {
                return SyncMessage::Missing {
                    content_id: *content_id,
                }
            }
            Err(e) => {
                return SyncMessage::Rejected {
                    reason: RejectReason::Internal(e.to_string()),
                }
            }
        };

        let sealed = policy
            .payload_crypto()
            .and_then(|crypto| crypto.map(|c| c.encrypt(&bytes)).transpose());
        match sealed {
            Ok(Some(bytes)) => SyncMessage::Content {
                bytes,
                encrypted: true,
            },
            Ok(None) => SyncMessage::Content {
                bytes,
                encrypted: false,
            },
            Err(e) => SyncMessage::Rejected {
                reason: RejectReason::Internal(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl InboundHandler for SyncCoordinator {
    async fn handle(&self, from: &PeerId, request: Vec<u8>) -> Vec<u8> {
        let reply = match decode_frame(&request) {
            Ok(message) => self.respond(from, message).await,
            Err(e) => SyncMessage::Rejected {
                reason: RejectReason::Internal(e.to_string()),
            },
        };
        encode_frame(reply).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode reply");
            Vec::new()
        })
    }
}

#[async_trait]
impl ContentSource for SyncCoordinator {
    async fn fetch_from(&self, peer: &PeerId, id: &ContentId) -> SyncResult<Option<Vec<u8>>> {
        let policy = self.policy.get_policy();
        let reply = self
            .call(
                peer,
                SyncMessage::Fetch {
                    key_fingerprint: policy.key_fingerprint(),
                    content_id: *id,
                },
            )
            .await?;

        match reply {
            SyncMessage::Content {
                bytes,
                encrypted: false,
            } => Ok(Some(bytes)),
            SyncMessage::Content {
                bytes,
                encrypted: true,
            } => {
                let crypto = policy.decrypting_crypto()?.ok_or_else(|| {
                    SyncError::Crypto("sealed payload but no sync key set".to_string())
                })?;
                crypto.decrypt(&bytes).map(Some)
            }
            SyncMessage::Missing { .. } => Ok(None),
            other => Err(unexpected(peer, other)),
        }
    }
}

fn record_failure(report: &mut SyncReport, peer: &PeerId, error: SyncError) {
    warn!(peer = %peer.short(), error = %error, "Peer sync failed");
    report.peer_errors.insert(
        peer.clone(),
        PeerFailure {
            kind: error.kind(),
            message: error.to_string(),
        },
    );
}

fn rejection(peer: &PeerId, reason: RejectReason) -> SyncError {
    match reason {
        RejectReason::KeyMismatch => SyncError::SyncKeyMismatch(peer.clone()),
        RejectReason::NodeOffline => SyncError::PeerUnreachable {
            peer: peer.clone(),
            reason: "peer is offline".to_string(),
        },
        RejectReason::PolicyRestricted => SyncError::PolicyRestricted {
            peer: peer.clone(),
            reason: "rejected by peer policy".to_string(),
        },
        RejectReason::Internal(message) => SyncError::Protocol(message),
    }
}

fn unexpected(peer: &PeerId, message: SyncMessage) -> SyncError {
    SyncError::Protocol(format!(
        "unexpected reply from {}: {}",
        peer.short(),
        message.kind()
    ))
}
