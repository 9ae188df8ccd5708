//! QUIC transport over iroh
//!
//! Each request opens a connection on [`SYNC_ALPN`], sends one frame on a
//! bi-directional stream and reads one frame back. Peer ids are the hex
//! encoding of the remote endpoint's public key, so `from` is authenticated
//! by the QUIC handshake.
//!
//! Local-network sightings come from iroh's mDNS discovery, advertised under
//! [`LOCAL_SERVICE_NAME`] so only peersync nodes see each other. Peers that
//! connect inbound are announced as sightings too.

use async_stream::stream;
use async_trait::async_trait;
use ::iroh::discovery::mdns::{DiscoveryEvent, MdnsDiscovery};
use ::iroh::discovery::static_provider::StaticProvider;
use ::iroh::endpoint::Connection;
use ::iroh::protocol::{AcceptError, ProtocolHandler, Router};
use ::iroh::{Endpoint, EndpointAddr, PublicKey, SecretKey};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{InboundHandler, Sighting, SightingStream, Transport};
use crate::error::{SyncError, SyncResult};
use crate::types::{NodeId, PeerId};

/// ALPN for the peersync request/response protocol
pub const SYNC_ALPN: &[u8] = b"/peersync/sync/1";

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// mDNS service name peersync endpoints advertise under
pub const LOCAL_SERVICE_NAME: &str = "peersync1";

/// Parse a peer id back into an iroh endpoint id.
pub fn endpoint_id(peer: &PeerId) -> SyncResult<PublicKey> {
    let bytes = hex::decode(peer.as_str())
        .map_err(|e| SyncError::Network(format!("Invalid peer id {}: {}", peer, e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SyncError::Network(format!("Invalid peer id {}: expected 32 bytes", peer)))?;
    PublicKey::from_bytes(&arr)
        .map_err(|e| SyncError::Network(format!("Invalid peer id {}: {}", peer, e)))
}

fn peer_id(key: &PublicKey) -> PeerId {
    PeerId::new(hex::encode(key.as_bytes()))
}

struct Running {
    endpoint: Endpoint,
    router: Router,
    /// Stops the mDNS forwarding task
    local: CancellationToken,
}

/// Peers already announced as sightings in the current session.
type Seen = Arc<Mutex<HashSet<PeerId>>>;

/// [`Transport`] backed by an iroh endpoint and router.
pub struct IrohTransport {
    running: tokio::sync::Mutex<Option<Running>>,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    sightings: broadcast::Sender<Sighting>,
    local_discovery: bool,
}

impl Default for IrohTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl IrohTransport {
    pub fn new() -> Self {
        let (sightings, _) = broadcast::channel(64);
        Self {
            running: tokio::sync::Mutex::new(None),
            static_provider: StaticProvider::new(),
            sightings,
            local_discovery: true,
        }
    }

    /// Enable or disable mDNS discovery on the local network (on by default).
    pub fn with_local_discovery(mut self, enabled: bool) -> Self {
        self.local_discovery = enabled;
        self
    }

    /// Register a peer's address so it can be dialled without DNS discovery.
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// This node's full address, once started.
    pub async fn endpoint_addr(&self) -> Option<EndpointAddr> {
        self.running.lock().await.as_ref().map(|r| r.endpoint.addr())
    }

    /// Register mDNS discovery on `endpoint` and forward what it finds to
    /// the sighting channel until `token` is cancelled.
    ///
    /// A network without multicast support only loses local discovery.
    fn spawn_local_discovery(&self, endpoint: &Endpoint, seen: Seen, token: CancellationToken) {
        let mdns = match MdnsDiscovery::builder()
            .service_name(LOCAL_SERVICE_NAME)
            .build(endpoint.id())
        {
            Ok(mdns) => mdns,
            Err(e) => {
                warn!(error = ?e, "Local network discovery unavailable");
                return;
            }
        };
        endpoint.discovery().add(mdns.clone());
        let own = peer_id(&endpoint.id());
        let sightings = self.sightings.clone();

        tokio::spawn(async move {
            let mut events = mdns.subscribe().await;
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Some(sighting) = local_sighting(&event, &own, &seen) {
                    debug!(peer = %sighting.peer.short(), "Peer sighted on local network");
                    let _ = sightings.send(sighting);
                }
            }
            debug!("Local network discovery stopped");
        });
        info!(service = LOCAL_SERVICE_NAME, "Local network discovery enabled");
    }

    async fn endpoint(&self) -> SyncResult<Endpoint> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.endpoint.clone())
            .ok_or_else(|| SyncError::Network("transport not started".to_string()))
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn node_id(&self, secret: &[u8; 32]) -> NodeId {
        peer_id(&SecretKey::from(*secret).public())
    }

    async fn start(
        &self,
        secret: [u8; 32],
        handler: Arc<dyn InboundHandler>,
    ) -> SyncResult<Vec<String>> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(addresses(&r.endpoint.addr()));
        }

        let endpoint = Endpoint::builder()
            .secret_key(SecretKey::from(secret))
            .alpns(vec![SYNC_ALPN.to_vec()])
            .discovery(self.static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::TransportUnavailable(format!("Failed to bind endpoint: {}", e)))?;

        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let seen: Seen = Arc::new(Mutex::new(HashSet::new()));
        let local = CancellationToken::new();
        if self.local_discovery {
            self.spawn_local_discovery(&endpoint, seen.clone(), local.clone());
        }

        let protocol = SyncProtocolHandler {
            handler,
            sightings: self.sightings.clone(),
            seen,
        };
        let router = Router::builder(endpoint.clone())
            .accept(SYNC_ALPN, protocol)
            .spawn();
        info!("Router spawned");

        let addrs = addresses(&endpoint.addr());
        *running = Some(Running {
            endpoint,
            router,
            local,
        });
        Ok(addrs)
    }

    async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(Running {
            endpoint,
            router,
            local,
        }) = running
        {
            local.cancel();
            if let Err(e) = router.shutdown().await {
                warn!(error = ?e, "Failed to shutdown router cleanly");
            }
            endpoint.close().await;
            info!("Iroh transport stopped");
        }
    }

    async fn connect(&self, peer: &PeerId) -> SyncResult<()> {
        let endpoint = self.endpoint().await?;
        let id = endpoint_id(peer)?;
        let conn = endpoint
            .connect(id, SYNC_ALPN)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to connect to {}: {}", peer.short(), e)))?;
        conn.close(0u32.into(), b"probe");
        Ok(())
    }

    async fn request(&self, peer: &PeerId, request: Vec<u8>) -> SyncResult<Vec<u8>> {
        let endpoint = self.endpoint().await?;
        let id = endpoint_id(peer)?;

        let conn = endpoint
            .connect(id, SYNC_ALPN)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to connect to {}: {}", peer.short(), e)))?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to open bi stream: {}", e)))?;

        send.write_all(&request)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to send request: {}", e)))?;
        send.finish()
            .map_err(|e| SyncError::Network(format!("Failed to finish send stream: {}", e)))?;

        let response = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read response: {}", e)))?;

        conn.close(0u32.into(), b"done");
        Ok(response)
    }

    fn discover(&self) -> SightingStream {
        let mut rx = self.sightings.subscribe();
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(sighting) => yield sighting,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Map an mDNS event to a new sighting.
///
/// Each peer is announced once until it expires; our own advertisement is
/// ignored.
fn local_sighting(event: &DiscoveryEvent, own: &PeerId, seen: &Seen) -> Option<Sighting> {
    match event {
        DiscoveryEvent::Discovered { endpoint_info, .. } => {
            let peer = peer_id(&endpoint_info.endpoint_id);
            if peer == *own || !seen.lock().insert(peer.clone()) {
                return None;
            }
            Some(Sighting::new(peer))
        }
        DiscoveryEvent::Expired { endpoint_id } => {
            seen.lock().remove(&peer_id(endpoint_id));
            None
        }
    }
}

fn addresses(addr: &EndpointAddr) -> Vec<String> {
    addr.relay_urls()
        .map(|url| url.to_string())
        .chain(addr.ip_addrs().map(|a| a.to_string()))
        .collect()
}

/// Router-side handler for [`SYNC_ALPN`] connections.
#[derive(Clone)]
struct SyncProtocolHandler {
    handler: Arc<dyn InboundHandler>,
    sightings: broadcast::Sender<Sighting>,
    seen: Seen,
}

impl std::fmt::Debug for SyncProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocolHandler").finish_non_exhaustive()
    }
}

impl SyncProtocolHandler {
    async fn handle_connection(&self, connection: Connection) -> Result<(), SyncError> {
        let peer = peer_id(&connection.remote_id());

        if self.seen.lock().insert(peer.clone()) {
            let _ = self.sightings.send(Sighting::new(peer.clone()));
        }

        let (mut send, mut recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                // Reachability probes close without opening a stream
                debug!(peer = %peer.short(), error = %e, "Connection closed without request");
                return Ok(());
            }
        };

        let request = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read request: {}", e)))?;

        let response = self.handler.handle(&peer, request).await;

        send.write_all(&response)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to write response: {}", e)))?;
        send.finish()
            .map_err(|e| SyncError::Network(format!("Failed to finish stream: {}", e)))?;

        // Let the requester read the response before the connection drops
        let _ = tokio::time::timeout(CLOSE_GRACE, connection.closed()).await;
        Ok(())
    }
}

impl ProtocolHandler for SyncProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let this = self.clone();
        async move {
            debug!(peer = %conn.remote_id(), "Router accepting sync connection");
            if let Err(e) = this.handle_connection(conn).await {
                warn!(error = ?e, "Failed to handle sync connection");
                return Err(AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}
