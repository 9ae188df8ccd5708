//! Publication/subscription bus
//!
//! The domain layer publishes typed records here and subscribes to record
//! types. Both local publishes and versions adopted during sync flow through
//! the same commit path, so subscribers see every distinct version exactly
//! once and, per record id, in non-decreasing version order.
//!
//! Deliveries are queued while the index lock is held and dispatched after it
//! is released by a single drainer at a time. A callback may itself publish;
//! the nested delivery is queued behind the current one instead of running
//! re-entrantly.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::content::{ContentId, ContentStore};
use crate::error::{SyncError, SyncResult};
use crate::node::NodeLifecycle;
use crate::records::RecordIndex;
use crate::resolver::{resolve_records, Candidate, ConflictResolver};
use crate::sync::events::{EventSender, SyncEvent};
use crate::types::{PeerId, PublishedRecord, RecordKey};

/// A domain object the bus can publish.
///
/// The only contract is a stable id; the payload is whatever `serde`
/// serializes.
pub trait Record: Serialize {
    fn id(&self) -> String;
}

/// One version handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub record: PublishedRecord,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Deserialize the payload as a domain type.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Result of offering a version to the local index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adoption {
    /// The offered or a merged version is now current
    Adopted(PublishedRecord),
    /// The local version won and is unchanged
    Kept(PublishedRecord),
    /// The offered version was already current
    Unchanged,
}

type Callback = Arc<dyn Fn(&Delivery) + Send + Sync>;

struct Subscriber {
    id: u64,
    record_type: String,
    active: AtomicBool,
    callback: Callback,
}

struct BusInner {
    node: Arc<NodeLifecycle>,
    content: ContentStore,
    index: Arc<RecordIndex>,
    events: EventSender,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Delivery>>,
    draining: AtomicBool,
}

/// Handle returned by [`PublishBus::subscribe`].
pub struct Subscription {
    entry: Arc<Subscriber>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Stop further deliveries. Idempotent; a callback already running
    /// finishes normally.
    pub fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().retain(|s| s.id != self.entry.id);
        }
        debug!(record_type = %self.entry.record_type, "Unsubscribed");
    }

    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct PublishBus {
    inner: Arc<BusInner>,
}

impl PublishBus {
    pub fn new(
        node: Arc<NodeLifecycle>,
        content: ContentStore,
        index: Arc<RecordIndex>,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                node,
                content,
                index,
                events,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Serialize `record` as JSON and publish it under `record_type`.
    pub fn publish<R: Record>(&self, record_type: &str, record: &R) -> SyncResult<ContentId> {
        self.inner.node.require_online()?;
        let payload =
            serde_json::to_vec(record).map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.publish_raw(record_type, &record.id(), payload)
    }

    /// Publish an already-serialized payload.
    ///
    /// The new version is one greater than the current local version of the
    /// record. Fails with `NodeOffline` unless the node is online.
    pub fn publish_raw(
        &self,
        record_type: &str,
        record_id: &str,
        payload: Vec<u8>,
    ) -> SyncResult<ContentId> {
        self.inner.node.require_online()?;
        if record_type.is_empty() || record_id.is_empty() {
            return Err(SyncError::InvalidConfig(
                "record type and id must not be empty".to_string(),
            ));
        }

        let content_id = self.inner.content.put(&payload)?;
        let key = RecordKey::new(record_type, record_id);

        let record = {
            let mut index = self.inner.index.lock();
            let version = index.current(&key).map_or(1, |r| r.version + 1);
            let record = PublishedRecord {
                record_type: record_type.to_string(),
                record_id: record_id.to_string(),
                content_id,
                version,
            };
            index.commit(record.clone())?;
            self.inner.enqueue(Delivery {
                record: record.clone(),
                payload,
            });
            record
        };
        self.inner.drain();

        debug!(
            record_type,
            record_id,
            version = record.version,
            content_id = %content_id.short(),
            "Published record"
        );
        Ok(content_id)
    }

    /// Register `callback` for every new version of `record_type`.
    pub fn subscribe<F>(&self, record_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let entry = Arc::new(Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            record_type: record_type.to_string(),
            active: AtomicBool::new(true),
            callback: Arc::new(callback),
        });
        self.inner.subscribers.lock().push(entry.clone());
        debug!(record_type, "Subscribed");
        Subscription {
            entry,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Resolve `candidate` against the local version and commit the winner.
    ///
    /// The whole read-resolve-write runs under the index lock. The
    /// candidate's content must already be stored locally or be passed in
    /// `payload`.
    pub fn adopt(
        &self,
        candidate: &PublishedRecord,
        payload: Option<&[u8]>,
        resolver: &dyn ConflictResolver,
        from: Option<&PeerId>,
    ) -> SyncResult<Adoption> {
        let content = &self.inner.content;
        if let Some(bytes) = payload {
            if !candidate.content_id.matches(bytes) {
                return Err(SyncError::Protocol(format!(
                    "payload does not match content id {}",
                    candidate.content_id.short()
                )));
            }
            content.put(bytes)?;
        }

        let adopted = {
            let mut index = self.inner.index.lock();
            let current = index.current(&candidate.key()).cloned();

            let (winner, winner_payload) = match current {
                None => (candidate.clone(), None),
                Some(current) if current == *candidate => return Ok(Adoption::Unchanged),
                Some(current) => {
                    let resolved = if resolver.needs_payloads() {
                        let local_bytes = content.get(&current.content_id)?;
                        let remote_bytes = content.get(&candidate.content_id)?;
                        resolve_records(
                            resolver,
                            Candidate::with_payload(&current, &local_bytes),
                            Candidate::with_payload(candidate, &remote_bytes),
                        )
                    } else {
                        resolve_records(resolver, Candidate::new(&current), Candidate::new(candidate))
                    };
                    if resolved.record == current {
                        return Ok(Adoption::Kept(current));
                    }
                    if resolved.record.version < current.version {
                        warn!(
                            record_type = %current.record_type,
                            record_id = %current.record_id,
                            local = current.version,
                            resolved = resolved.record.version,
                            "Resolver picked an older version, keeping local"
                        );
                        return Ok(Adoption::Kept(current));
                    }
                    (resolved.record, resolved.merged_payload)
                }
            };

            let delivered = match winner_payload {
                Some(bytes) => {
                    content.put(&bytes)?;
                    bytes
                }
                None => content.get(&winner.content_id)?,
            };

            index.commit(winner.clone())?;
            self.inner.enqueue(Delivery {
                record: winner.clone(),
                payload: delivered,
            });
            winner
        };
        self.inner.drain();

        debug!(
            record_type = %adopted.record_type,
            record_id = %adopted.record_id,
            version = adopted.version,
            from = ?from.map(|p| p.short()),
            "Adopted record"
        );
        self.inner.events.emit(SyncEvent::RecordAdopted {
            record: adopted.clone(),
            from: from.cloned(),
        });
        Ok(Adoption::Adopted(adopted))
    }

    /// Current version of a record
    pub fn get(&self, record_type: &str, record_id: &str) -> Option<PublishedRecord> {
        self.inner.index.get(&RecordKey::new(record_type, record_id))
    }

    /// Read and decode the current version of a record held locally.
    pub fn read<T: DeserializeOwned>(&self, record_type: &str, record_id: &str) -> SyncResult<Option<T>> {
        let Some(record) = self.get(record_type, record_id) else {
            return Ok(None);
        };
        let bytes = self.inner.content.get(&record.content_id)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    pub fn records(&self, record_type: Option<&str>) -> Vec<PublishedRecord> {
        self.inner.index.list(record_type)
    }
}

impl BusInner {
    fn enqueue(&self, delivery: Delivery) {
        self.queue.lock().push_back(delivery);
    }

    fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.queue.lock().pop_front();
                let Some(delivery) = next else { break };

                let targets: Vec<Arc<Subscriber>> = self
                    .subscribers
                    .lock()
                    .iter()
                    .filter(|s| s.record_type == delivery.record.record_type)
                    .cloned()
                    .collect();
                for subscriber in targets {
                    if subscriber.active.load(Ordering::SeqCst) {
                        (subscriber.callback)(&delivery);
                    }
                }
            }
            self.draining.store(false, Ordering::Release);
            // Another thread may have enqueued after our last pop
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}
