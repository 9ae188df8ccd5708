//! Sync event types for the read-only status surface
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEvent                                                      │
//! │  ├── NodeStatusChanged: starting / online / offline             │
//! │  ├── PeerStatusChanged: a peer record changed status            │
//! │  ├── SyncStarted / SyncCompleted / SyncFailed: pass lifecycle   │
//! │  └── RecordAdopted: a remote or merged version became current   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use tokio::sync::broadcast;

use crate::types::{NodeStatus, PeerId, PeerStatus, PublishedRecord, SyncReport};

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    NodeStatusChanged(NodeStatus),
    PeerStatusChanged { peer: PeerId, status: PeerStatus },
    SyncStarted { peer_count: usize },
    SyncCompleted(SyncReport),
    /// The pass was cancelled or no attempted peer succeeded
    SyncFailed { message: String },
    RecordAdopted {
        record: PublishedRecord,
        /// The peer the record came from, `None` for a local merge
        from: Option<PeerId>,
    },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::NodeStatusChanged(status) => write!(f, "node {}", status),
            SyncEvent::PeerStatusChanged { peer, status } => {
                write!(f, "peer {} {}", peer.short(), status)
            }
            SyncEvent::SyncStarted { peer_count } => {
                write!(f, "sync started ({} peers)", peer_count)
            }
            SyncEvent::SyncCompleted(report) => write!(
                f,
                "sync completed ({}/{} peers, {} merged)",
                report.peers_succeeded, report.peers_attempted, report.records_merged
            ),
            SyncEvent::SyncFailed { message } => write!(f, "sync failed: {}", message),
            SyncEvent::RecordAdopted { record, .. } => write!(
                f,
                "adopted {}#{} v{}",
                record.record_type, record.record_id, record.version
            ),
        }
    }
}

/// Cloneable sender half shared by all components.
///
/// Sending never fails from the caller's point of view: with no receivers the
/// event is dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = SyncEvent::PeerStatusChanged {
            peer: PeerId::new("0123456789abcdef"),
            status: PeerStatus::Connected,
        };
        assert_eq!(event.to_string(), "peer 01234567 connected");

        let report = SyncReport {
            peers_attempted: 2,
            peers_succeeded: 1,
            records_merged: 4,
            ..Default::default()
        };
        assert_eq!(
            SyncEvent::SyncCompleted(report).to_string(),
            "sync completed (1/2 peers, 4 merged)"
        );
    }

    #[tokio::test]
    async fn test_emit_without_receivers_is_silent() {
        let events = EventSender::new(4);
        events.emit(SyncEvent::NodeStatusChanged(NodeStatus::Online));

        let mut rx = events.subscribe();
        events.emit(SyncEvent::SyncFailed {
            message: "no peers".into(),
        });
        match rx.recv().await.unwrap() {
            SyncEvent::SyncFailed { message } => assert_eq!(message, "no peers"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
