//! Node lifecycle: identity and online/offline state
//!
//! Status moves strictly `Offline -> Starting -> Online -> Offline`. Every
//! operation that needs the network calls [`NodeLifecycle::require_online`]
//! first and fails fast with `NodeOffline` otherwise.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::random_bytes;
use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;
use crate::sync::events::{EventSender, SyncEvent};
use crate::sync::transport::{InboundHandler, Transport};
use crate::types::{NodeIdentity, NodeStatus};

/// Owns the local node identity and its online/offline state.
pub struct NodeLifecycle {
    transport: Arc<dyn Transport>,
    storage: Storage,
    persist_identity: bool,
    status: watch::Sender<NodeStatus>,
    /// Serializes start/stop so a concurrent second `start` waits
    gate: tokio::sync::Mutex<()>,
    secret: Mutex<Option<[u8; 32]>>,
    identity: Mutex<Option<NodeIdentity>>,
    session: Mutex<CancellationToken>,
    events: EventSender,
}

impl NodeLifecycle {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Storage,
        persist_identity: bool,
        events: EventSender,
    ) -> Self {
        let (status, _) = watch::channel(NodeStatus::Offline);
        let session = CancellationToken::new();
        session.cancel();
        Self {
            transport,
            storage,
            persist_identity,
            status,
            gate: tokio::sync::Mutex::new(()),
            secret: Mutex::new(None),
            identity: Mutex::new(None),
            session: Mutex::new(session),
            events,
        }
    }

    /// Bring the node online and return its identity.
    ///
    /// Idempotent when already online. If the transport fails to start the
    /// node settles at `Offline` and `TransportUnavailable` is returned.
    pub async fn start(&self, handler: Arc<dyn InboundHandler>) -> SyncResult<NodeIdentity> {
        let _gate = self.gate.lock().await;

        if self.status() == NodeStatus::Online {
            if let Some(identity) = self.identity() {
                return Ok(identity);
            }
        }

        self.set_status(NodeStatus::Starting);

        let secret = match self.load_or_create_secret() {
            Ok(secret) => secret,
            Err(e) => {
                self.set_status(NodeStatus::Offline);
                return Err(e);
            }
        };

        let addresses = match self.transport.start(secret, handler).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "Transport failed to start");
                self.set_status(NodeStatus::Offline);
                return Err(match e {
                    SyncError::TransportUnavailable(msg) => SyncError::TransportUnavailable(msg),
                    other => SyncError::TransportUnavailable(other.to_string()),
                });
            }
        };

        let identity = {
            let mut cached = self.identity.lock();
            cached
                .get_or_insert_with(|| NodeIdentity {
                    id: self.transport.node_id(&secret),
                    public_addresses: addresses,
                })
                .clone()
        };

        *self.session.lock() = CancellationToken::new();
        self.set_status(NodeStatus::Online);
        info!(node = %identity.id, addresses = ?identity.public_addresses, "Node online");
        Ok(identity)
    }

    /// Take the node offline from any state. Never fails.
    ///
    /// Cancels the current session token first so in-flight work observes
    /// cancellation before the transport goes away.
    pub async fn stop(&self) {
        self.session.lock().cancel();

        let _gate = self.gate.lock().await;
        if self.status() == NodeStatus::Offline {
            debug!("Stop requested while already offline");
            return;
        }

        self.transport.stop().await;
        self.set_status(NodeStatus::Offline);
        info!("Node offline");
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NodeStatus::Online
    }

    /// Fail with `NodeOffline` unless the node is online.
    pub fn require_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::NodeOffline)
        }
    }

    /// Identity assigned at first start; fixed for the process lifetime.
    pub fn identity(&self) -> Option<NodeIdentity> {
        self.identity.lock().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    /// Token cancelled when the current online session ends.
    pub fn session_token(&self) -> CancellationToken {
        self.session.lock().clone()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn set_status(&self, status: NodeStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Node status changed");
            self.events.emit(SyncEvent::NodeStatusChanged(status));
        }
    }

    fn load_or_create_secret(&self) -> SyncResult<[u8; 32]> {
        let mut cached = self.secret.lock();
        if let Some(secret) = *cached {
            return Ok(secret);
        }

        let secret = if self.persist_identity {
            match self.storage.load_secret_key()? {
                Some(secret) => {
                    debug!("Loaded persisted node secret");
                    secret
                }
                None => {
                    let secret = random_bytes();
                    self.storage.save_secret_key(&secret)?;
                    info!("Generated and persisted new node secret");
                    secret
                }
            }
        } else {
            random_bytes()
        };

        *cached = Some(secret);
        Ok(secret)
    }
}
