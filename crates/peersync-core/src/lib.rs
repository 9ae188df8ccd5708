//! peersync core library
//!
//! Peer-to-peer record synchronization for local-first applications. Each
//! node keeps its own content-addressed copy of every record and exchanges
//! versions directly with peers that share its sync key; there is no server
//! of record.
//!
//! ## Overview
//!
//! - **Content store**: blobs addressed by their BLAKE3 hash
//! - **Publish/subscribe bus**: typed records in, versioned deliveries out
//! - **Sync coordinator**: pairwise passes that converge every replica
//! - **Conflict resolver**: last-writer-wins by default, pluggable
//!
//! ## Quick Start
//!
//! ```ignore
//! use peersync_core::{EngineConfig, Record, SyncEngine};
//!
//! #[derive(serde::Serialize)]
//! struct Task { id: String, title: String }
//!
//! impl Record for Task {
//!     fn id(&self) -> String { self.id.clone() }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::builder(EngineConfig::new("~/.peersync/data")).open()?;
//!     engine.start().await?;
//!
//!     let _sub = engine.subscribe("task", |delivery| {
//!         println!("task {} is now v{}", delivery.record.record_id, delivery.record.version);
//!     });
//!     engine.publish("task", &Task { id: "1".into(), title: "Plant garden".into() })?;
//!
//!     let report = engine.sync_now().await?;
//!     println!("{} peers synced", report.peers_succeeded);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod content;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod network;
pub mod node;
pub mod peers;
pub mod policy;
pub mod records;
pub mod resolver;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use bus::{Adoption, Delivery, PublishBus, Record, Subscription};
pub use config::EngineConfig;
pub use content::{ContentId, ContentStore};
pub use crypto::PayloadCrypto;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use network::{NetworkInfo, NetworkKind, StaticNetworkInfo};
pub use node::NodeLifecycle;
pub use peers::{DiscoveryStream, PeerDirectory};
pub use policy::{PolicyStore, PolicyUpdate, SyncPolicy};
pub use resolver::{Candidate, ConflictResolver, LastWriterWins, Resolution};
pub use storage::Storage;
pub use sync::{MemoryNetwork, MemoryTransport, SyncEvent, Transport};
pub use types::*;
