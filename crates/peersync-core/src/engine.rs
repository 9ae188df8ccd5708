//! Main SyncEngine - the primary entry point for peersync
//!
//! SyncEngine wires the components of one node together:
//! - Storage (redb) for identity, policy, records, content and peers
//! - NodeLifecycle for identity and online/offline state
//! - PeerDirectory, PublishBus and SyncCoordinator on top of a Transport
//!
//! Each engine is an independent instance; several can run in one process,
//! which is how the convergence tests drive multiple nodes.
//!
//! # Example
//!
//! ```ignore
//! use peersync_core::{EngineConfig, SyncEngine};
//!
//! let engine = SyncEngine::builder(EngineConfig::new("~/.peersync/data")).open()?;
//! engine.start().await?;
//!
//! engine.publish("task", &task)?;
//! let _sub = engine.subscribe("task", |delivery| println!("{:?}", delivery.record));
//!
//! engine.connect(&peer_id).await?;
//! let report = engine.sync_now().await?;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{Delivery, PublishBus, Record, Subscription};
use crate::config::EngineConfig;
use crate::content::{ContentId, ContentStore};
use crate::error::SyncResult;
use crate::network::{NetworkInfo, StaticNetworkInfo};
use crate::node::NodeLifecycle;
use crate::peers::{DiscoveryStream, PeerDirectory};
use crate::policy::{PolicyStore, PolicyUpdate, SyncPolicy};
use crate::records::RecordIndex;
use crate::resolver::{ConflictResolver, LastWriterWins};
use crate::storage::Storage;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::events::{EventSender, SyncEvent};
use crate::sync::iroh::IrohTransport;
use crate::sync::transport::{InboundHandler, Transport};
use crate::types::{NodeIdentity, NodeStatus, PeerId, PeerRecord, PublishedRecord, SyncReport, SyncSession};

/// Collaborators injected into a [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    network_info: Option<Arc<dyn NetworkInfo>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SyncEngineBuilder {
    /// Transport to run on; defaults to [`IrohTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Network classification for policy gating; defaults to `Unknown`.
    pub fn network_info(mut self, network_info: Arc<dyn NetworkInfo>) -> Self {
        self.network_info = Some(network_info);
        self
    }

    /// Conflict resolver; defaults to [`LastWriterWins`].
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Open the database under `config.data_dir` and assemble the engine.
    ///
    /// The node is left offline; call [`SyncEngine::start`].
    pub fn open(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Storage::new(config.database_path())?;
        let events = EventSender::new(config.event_capacity);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(IrohTransport::new()));
        let network = self
            .network_info
            .unwrap_or_else(|| Arc::new(StaticNetworkInfo::default()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(LastWriterWins));

        let node = Arc::new(NodeLifecycle::new(
            transport,
            storage.clone(),
            config.persist_identity,
            events.clone(),
        ));
        let content = ContentStore::new(storage.clone());
        let index = Arc::new(RecordIndex::load(storage.clone())?);
        let policy = Arc::new(PolicyStore::load(Arc::new(storage.clone()))?);
        let peers = PeerDirectory::load(
            node.clone(),
            storage.clone(),
            policy.clone(),
            events.clone(),
            config.clone(),
        )?;
        let bus = PublishBus::new(node.clone(), content.clone(), index.clone(), events.clone());
        let coordinator = Arc::new(SyncCoordinator::new(
            node.clone(),
            peers.clone(),
            bus.clone(),
            content.clone(),
            index.clone(),
            storage.clone(),
            policy.clone(),
            network,
            resolver,
            events.clone(),
            config.clone(),
        ));

        info!(
            data_dir = %config.data_dir.display(),
            records = index.len(),
            peers = peers.list().len(),
            "Engine opened"
        );

        Ok(SyncEngine {
            config,
            storage,
            node,
            content,
            index,
            policy,
            peers,
            bus,
            coordinator,
            events,
            auto_sync: Mutex::new(None),
        })
    }
}

/// One peersync node.
pub struct SyncEngine {
    config: EngineConfig,
    storage: Storage,
    node: Arc<NodeLifecycle>,
    content: ContentStore,
    index: Arc<RecordIndex>,
    policy: Arc<PolicyStore>,
    peers: PeerDirectory,
    bus: PublishBus,
    coordinator: Arc<SyncCoordinator>,
    events: EventSender,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            transport: None,
            network_info: None,
            resolver: None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Bring the node online and start the automatic sync task.
    pub async fn start(&self) -> SyncResult<NodeIdentity> {
        let handler: Arc<dyn InboundHandler> = self.coordinator.clone();
        let identity = self.node.start(handler).await?;

        let mut auto_sync = self.auto_sync.lock();
        if auto_sync.as_ref().map_or(true, |task| task.is_finished()) {
            *auto_sync = Some(self.coordinator.spawn_auto_sync());
        }
        Ok(identity)
    }

    /// Take the node offline. Cancels a running pass and disconnects every
    /// peer; peer records are kept.
    pub async fn stop(&self) {
        self.node.stop().await;
        if let Some(task) = self.auto_sync.lock().take() {
            task.abort();
        }
        if let Err(e) = self.peers.disconnect_all() {
            warn!(error = %e, "Failed to persist peer disconnects");
        }
    }

    pub fn node_status(&self) -> NodeStatus {
        self.node.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.node.watch_status()
    }

    pub fn identity(&self) -> Option<NodeIdentity> {
        self.node.identity()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.node.transport()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Policy
    // ═══════════════════════════════════════════════════════════════════════

    pub fn policy(&self) -> SyncPolicy {
        self.policy.get_policy()
    }

    pub fn update_policy(&self, update: PolicyUpdate) -> SyncResult<SyncPolicy> {
        self.policy.update_policy(update)
    }

    pub fn generate_sync_key(&self) -> SyncResult<String> {
        self.policy.generate_sync_key()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Records and content
    // ═══════════════════════════════════════════════════════════════════════

    pub fn publish<R: Record>(&self, record_type: &str, record: &R) -> SyncResult<ContentId> {
        self.bus.publish(record_type, record)
    }

    pub fn publish_raw(&self, record_type: &str, record_id: &str, payload: Vec<u8>) -> SyncResult<ContentId> {
        self.bus.publish_raw(record_type, record_id, payload)
    }

    pub fn subscribe<F>(&self, record_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        self.bus.subscribe(record_type, callback)
    }

    pub fn record(&self, record_type: &str, record_id: &str) -> Option<PublishedRecord> {
        self.bus.get(record_type, record_id)
    }

    pub fn read<T: serde::de::DeserializeOwned>(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> SyncResult<Option<T>> {
        self.bus.read(record_type, record_id)
    }

    pub fn records(&self, record_type: Option<&str>) -> Vec<PublishedRecord> {
        self.bus.records(record_type)
    }

    /// Current log sequence of the local record index
    pub fn head_seq(&self) -> u64 {
        self.index.head_seq()
    }

    /// Store a blob without publishing a record for it.
    pub fn put_content(&self, data: &[u8]) -> SyncResult<ContentId> {
        self.content.put(data)
    }

    /// Read a blob, asking connected peers when it is not held locally.
    pub async fn get_content(&self, id: &ContentId) -> SyncResult<Vec<u8>> {
        let peers = if self.node.is_online() {
            self.peers.connected_ids()
        } else {
            Vec::new()
        };
        self.content
            .fetch(id, self.coordinator.as_ref(), &peers, self.config.fetch_timeout)
            .await
    }

    pub fn content_count(&self) -> SyncResult<u64> {
        self.content.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.list()
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(id)
    }

    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.peers.connected_peers()
    }

    pub async fn connect(&self, peer: &PeerId) -> SyncResult<PeerRecord> {
        self.peers.connect(peer).await
    }

    pub fn disconnect(&self, peer: &PeerId) -> SyncResult<()> {
        self.peers.disconnect(peer)
    }

    pub fn discover_local(&self) -> SyncResult<DiscoveryStream> {
        self.peers.discover_local()
    }

    /// Remove idle peers; `None` uses the configured retention.
    pub fn prune_peers(&self, retention: Option<Duration>) -> SyncResult<Vec<PeerId>> {
        self.peers
            .prune(retention.unwrap_or(self.config.peer_retention))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.coordinator.sync_now().await
    }

    pub fn session(&self) -> SyncSession {
        self.coordinator.session()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.coordinator.last_report()
    }

    /// Peer exchanges started by this node so far
    pub fn exchange_count(&self) -> usize {
        self.coordinator.exchange_count()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.node.session_token().cancel();
        if let Some(task) = self.auto_sync.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::sync::transport::{MemoryNetwork, MemoryTransport};
    use crate::types::PeerStatus;
    use tempfile::TempDir;

    fn open(temp: &TempDir, transport: Arc<dyn Transport>) -> SyncEngine {
        SyncEngine::builder(EngineConfig::new(temp.path()))
            .transport(transport)
            .open()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::new(temp.path().join("nested").join("node"));
        let engine = SyncEngine::builder(config.clone())
            .transport(Arc::new(MemoryTransport::detached()))
            .open()
            .unwrap();
        assert!(config.database_path().exists());
        assert_eq!(engine.node_status(), NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            connect_attempts: 0,
            ..EngineConfig::new(temp.path())
        };
        let result = SyncEngine::builder(config)
            .transport(Arc::new(MemoryTransport::detached()))
            .open();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let temp = TempDir::new().unwrap();
        let id = {
            let engine = open(&temp, Arc::new(MemoryTransport::detached()));
            engine.start().await.unwrap();
            let id = engine.publish_raw("task", "1", b"persisted".to_vec()).unwrap();
            engine.stop().await;
            id
        };

        let engine = open(&temp, Arc::new(MemoryTransport::detached()));
        let record = engine.record("task", "1").unwrap();
        assert_eq!(record.content_id, id);
        assert_eq!(engine.get_content(&id).await.unwrap(), b"persisted");
        assert_eq!(engine.head_seq(), 1);
    }

    #[tokio::test]
    async fn test_stop_disconnects_peers_but_keeps_records() {
        let network = MemoryNetwork::new();
        let ta = TempDir::new().unwrap();
        let tb = TempDir::new().unwrap();
        let a = open(&ta, Arc::new(network.transport("a")));
        let b = open(&tb, Arc::new(network.transport("b")));
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.connect(&PeerId::new("b")).await.unwrap();
        assert_eq!(a.connected_peers().len(), 1);

        a.stop().await;
        assert!(a.connected_peers().is_empty());
        assert_eq!(
            a.peer(&PeerId::new("b")).unwrap().status,
            PeerStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_events_report_lifecycle() {
        let temp = TempDir::new().unwrap();
        let engine = open(&temp, Arc::new(MemoryTransport::detached()));
        let mut events = engine.subscribe_events();

        engine.start().await.unwrap();
        engine.stop().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::NodeStatusChanged(status) = event {
                seen.push(status);
            }
        }
        assert_eq!(
            seen,
            vec![NodeStatus::Starting, NodeStatus::Online, NodeStatus::Offline]
        );
    }
}
