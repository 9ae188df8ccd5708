//! Pluggable transport seam
//!
//! The sync logic only needs request/response delivery between node ids and a
//! feed of local-network sightings. [`Transport`] captures exactly that, so
//! tests run several engines in one process over a [`MemoryNetwork`] while
//! real nodes use [`crate::sync::iroh::IrohTransport`].

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::{NodeId, PeerId};

/// A peer noticed on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub peer: PeerId,
    pub display_name: Option<String>,
    pub device_type: Option<String>,
}

impl Sighting {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            display_name: None,
            device_type: None,
        }
    }
}

pub type SightingStream = Pin<Box<dyn Stream<Item = Sighting> + Send>>;

/// Answers requests arriving from peers.
///
/// `from` is authenticated by the transport.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, from: &PeerId, request: Vec<u8>) -> Vec<u8>;
}

/// Request/response delivery between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Node id this transport will use for the given secret key
    fn node_id(&self, secret: &[u8; 32]) -> NodeId;

    /// Bind and start serving `handler`; returns the public addresses.
    async fn start(
        &self,
        secret: [u8; 32],
        handler: Arc<dyn InboundHandler>,
    ) -> SyncResult<Vec<String>>;

    /// Stop serving. Stopping a stopped transport is a no-op.
    async fn stop(&self);

    /// Check that `peer` can be reached.
    async fn connect(&self, peer: &PeerId) -> SyncResult<()>;

    /// Send one request frame and wait for the response frame.
    async fn request(&self, peer: &PeerId, request: Vec<u8>) -> SyncResult<Vec<u8>>;

    /// Stream of local-network sightings, excluding this node.
    fn discover(&self) -> SightingStream;
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory transport
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, Arc<dyn InboundHandler>>,
    blocked: HashSet<(NodeId, NodeId)>,
    /// Remaining one-way request failures per (from, to)
    dropped: HashMap<(NodeId, NodeId), usize>,
    latency: Duration,
}

fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// In-process switchboard connecting [`MemoryTransport`]s.
///
/// Delivery is direct and deterministic. Pairs of nodes can be partitioned
/// with [`MemoryNetwork::set_reachable`], and every node that starts is
/// announced as a sighting to all other members.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    sightings: broadcast::Sender<Sighting>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (sightings, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            sightings,
        }
    }

    /// Create a transport whose node id is `name`.
    pub fn transport(&self, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            fixed_id: Some(NodeId::new(name)),
            id: Mutex::new(None),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Partition or heal the link between two nodes.
    pub fn set_reachable(&self, a: &NodeId, b: &NodeId, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.blocked.remove(&pair(a, b));
        } else {
            state.blocked.insert(pair(a, b));
        }
    }

    /// Fail the next `count` requests sent from `from` to `to`. The reverse
    /// direction is unaffected.
    pub fn drop_requests(&self, from: &NodeId, to: &NodeId, count: usize) {
        self.state
            .lock()
            .dropped
            .insert((from.clone(), to.clone()), count);
    }

    /// Delay applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn is_online(&self, id: &NodeId) -> bool {
        self.state.lock().nodes.contains_key(id)
    }

    fn reachable(state: &NetworkState, a: &NodeId, b: &NodeId) -> bool {
        !state.blocked.contains(&pair(a, b))
    }

    fn route(
        &self,
        from: &NodeId,
        to: &PeerId,
    ) -> SyncResult<(Arc<dyn InboundHandler>, Duration)> {
        let mut state = self.state.lock();
        if !Self::reachable(&state, from, to) {
            return Err(SyncError::Network(format!("{} is partitioned from {}", to, from)));
        }
        if let Some(remaining) = state.dropped.get_mut(&(from.clone(), to.clone())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Network(format!("request from {} to {} dropped", from, to)));
            }
        }
        state
            .nodes
            .get(to)
            .map(|handler| (handler.clone(), state.latency))
            .ok_or_else(|| SyncError::Network(format!("no route to {}", to)))
    }
}

/// A [`Transport`] attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    /// Name-based id; `None` derives the id from the secret key
    fixed_id: Option<NodeId>,
    id: Mutex<Option<NodeId>>,
    fail_start: AtomicBool,
}

impl MemoryTransport {
    /// A transport on its own private network, with the id derived from the
    /// node secret. Useful for single-node tooling.
    pub fn detached() -> Self {
        Self {
            network: MemoryNetwork::new(),
            fixed_id: None,
            id: Mutex::new(None),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make subsequent `start` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn local_id(&self) -> SyncResult<NodeId> {
        self.id
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Network("transport not started".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn node_id(&self, secret: &[u8; 32]) -> NodeId {
        match &self.fixed_id {
            Some(id) => id.clone(),
            None => NodeId::new(hex::encode(blake3::hash(secret).as_bytes())),
        }
    }

    async fn start(
        &self,
        secret: [u8; 32],
        handler: Arc<dyn InboundHandler>,
    ) -> SyncResult<Vec<String>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SyncError::Network("memory transport refused to start".to_string()));
        }
        let id = self.node_id(&secret);
        self.network.state.lock().nodes.insert(id.clone(), handler);
        *self.id.lock() = Some(id.clone());
        debug!(node = %id, "Memory transport started");

        let _ = self.network.sightings.send(Sighting::new(id.clone()));
        Ok(vec![format!("memory://{}", id)])
    }

    async fn stop(&self) {
        let id = self.id.lock().take();
        if let Some(id) = id {
            self.network.state.lock().nodes.remove(&id);
            debug!(node = %id, "Memory transport stopped");
        }
    }

    async fn connect(&self, peer: &PeerId) -> SyncResult<()> {
        let from = self.local_id()?;
        self.network.route(&from, peer).map(|_| ())
    }

    async fn request(&self, peer: &PeerId, request: Vec<u8>) -> SyncResult<Vec<u8>> {
        let from = self.local_id()?;
        let (handler, latency) = self.network.route(&from, peer)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(handler.handle(&from, request).await)
    }

    fn discover(&self) -> SightingStream {
        let network = self.network.clone();
        let local = self.id.lock().clone();
        let mut rx = network.sightings.subscribe();

        let present: Vec<NodeId> = {
            let state = network.state.lock();
            state.nodes.keys().cloned().collect()
        };

        Box::pin(stream! {
            let visible = |peer: &NodeId| -> bool {
                match &local {
                    Some(me) => {
                        let state = network.state.lock();
                        peer != me && MemoryNetwork::reachable(&state, me, peer)
                    }
                    None => true,
                }
            };

            for peer in present {
                if visible(&peer) {
                    yield Sighting::new(peer);
                }
            }
            loop {
                match rx.recv().await {
                    Ok(sighting) => {
                        if visible(&sighting.peer) {
                            yield sighting;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, from: &PeerId, request: Vec<u8>) -> Vec<u8> {
            let mut response = from.as_str().as_bytes().to_vec();
            response.extend(request);
            response
        }
    }

    #[tokio::test]
    async fn test_request_is_delivered_with_sender_id() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        a.start([1; 32], Arc::new(Echo)).await.unwrap();
        b.start([2; 32], Arc::new(Echo)).await.unwrap();

        let response = a.request(&PeerId::new("b"), b"!".to_vec()).await.unwrap();
        assert_eq!(response, b"a!".to_vec());
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        a.start([1; 32], Arc::new(Echo)).await.unwrap();
        b.start([2; 32], Arc::new(Echo)).await.unwrap();

        network.set_reachable(&NodeId::new("a"), &NodeId::new("b"), false);
        assert!(a.connect(&PeerId::new("b")).await.is_err());
        assert!(b.request(&PeerId::new("a"), vec![]).await.is_err());

        network.set_reachable(&NodeId::new("b"), &NodeId::new("a"), true);
        assert!(a.connect(&PeerId::new("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_stopped_node_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        a.start([1; 32], Arc::new(Echo)).await.unwrap();
        b.start([2; 32], Arc::new(Echo)).await.unwrap();
        b.stop().await;

        assert!(!network.is_online(&NodeId::new("b")));
        assert!(a.connect(&PeerId::new("b")).await.is_err());
        assert!(b.request(&PeerId::new("a"), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_start() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        a.set_fail_start(true);
        assert!(a.start([1; 32], Arc::new(Echo)).await.is_err());
        assert!(!network.is_online(&NodeId::new("a")));
    }

    #[tokio::test]
    async fn test_discover_sees_present_and_new_nodes() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let c = network.transport("c");
        a.start([1; 32], Arc::new(Echo)).await.unwrap();
        b.start([2; 32], Arc::new(Echo)).await.unwrap();

        let mut sightings = a.discover();
        assert_eq!(sightings.next().await.unwrap().peer, PeerId::new("b"));

        c.start([3; 32], Arc::new(Echo)).await.unwrap();
        assert_eq!(sightings.next().await.unwrap().peer, PeerId::new("c"));
    }

    #[test]
    fn test_detached_id_derived_from_secret() {
        let t = MemoryTransport::detached();
        assert_eq!(t.node_id(&[5; 32]), t.node_id(&[5; 32]));
        assert_ne!(t.node_id(&[5; 32]), t.node_id(&[6; 32]));
    }
}
