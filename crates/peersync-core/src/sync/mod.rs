//! Synchronization layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncCoordinator (coordinator.rs)                               │
//! │  ├── runs sync passes, answers peers' passes                    │
//! │  └── emits SyncEvents (events.rs)                               │
//! │                                                                 │
//! │  SyncMessage / WireMessage (protocol.rs)                        │
//! │  └── versioned postcard frames, one request -> one response     │
//! │                                                                 │
//! │  Transport (transport.rs)                                       │
//! │  ├── MemoryTransport: in-process switchboard for tests          │
//! │  └── IrohTransport (iroh.rs): QUIC, one bi-stream per request   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod coordinator;
pub mod events;
pub mod iroh;
pub mod protocol;
pub mod transport;

pub use coordinator::SyncCoordinator;
pub use events::{EventSender, SyncEvent};
pub use iroh::{IrohTransport, SYNC_ALPN};
pub use protocol::{RejectReason, SyncMessage, WireMessage};
pub use transport::{InboundHandler, MemoryNetwork, MemoryTransport, Sighting, Transport};
