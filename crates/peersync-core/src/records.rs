//! Local record index
//!
//! Maps each `(record_type, record_id)` to its current [`PublishedRecord`]
//! and keeps a per-node log sequence that increases on every change. All
//! writes go through [`IndexGuard`], which holds the index lock for the whole
//! read-decide-write of one change.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

use crate::error::SyncResult;
use crate::storage::{Storage, StoredRecord};
use crate::types::{PublishedRecord, RecordKey};

struct IndexState {
    entries: HashMap<RecordKey, StoredRecord>,
    head_seq: u64,
}

pub struct RecordIndex {
    state: Mutex<IndexState>,
    storage: Storage,
}

impl RecordIndex {
    /// Load the persisted index.
    pub fn load(storage: Storage) -> SyncResult<Self> {
        let (stored, head_seq) = storage.load_records()?;
        let entries = stored
            .into_iter()
            .map(|entry| (entry.record.key(), entry))
            .collect();
        Ok(Self {
            state: Mutex::new(IndexState { entries, head_seq }),
            storage,
        })
    }

    /// Exclusive access for a read-decide-write.
    pub fn lock(&self) -> IndexGuard<'_> {
        IndexGuard {
            state: self.state.lock(),
            storage: &self.storage,
        }
    }

    pub fn get(&self, key: &RecordKey) -> Option<PublishedRecord> {
        self.state.lock().entries.get(key).map(|e| e.record.clone())
    }

    /// Current records, optionally filtered by type, ordered by key.
    pub fn list(&self, record_type: Option<&str>) -> Vec<PublishedRecord> {
        let state = self.state.lock();
        let mut records: Vec<PublishedRecord> = state
            .entries
            .values()
            .filter(|e| record_type.map_or(true, |t| e.record.record_type == t))
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| {
            (&a.record_type, &a.record_id).cmp(&(&b.record_type, &b.record_id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head_seq(&self) -> u64 {
        self.state.lock().head_seq
    }

    /// Records changed after log sequence `seq`, in log order, with the
    /// head sequence they were read at.
    pub fn changed_since(&self, seq: u64) -> (Vec<PublishedRecord>, u64) {
        let state = self.state.lock();
        let mut changed: Vec<&StoredRecord> =
            state.entries.values().filter(|e| e.seq > seq).collect();
        changed.sort_by_key(|e| e.seq);
        (
            changed.into_iter().map(|e| e.record.clone()).collect(),
            state.head_seq,
        )
    }
}

/// Holds the index lock; dropped to release it.
pub struct IndexGuard<'a> {
    state: MutexGuard<'a, IndexState>,
    storage: &'a Storage,
}

impl IndexGuard<'_> {
    pub fn current(&self, key: &RecordKey) -> Option<&PublishedRecord> {
        self.state.entries.get(key).map(|e| &e.record)
    }

    /// Make `record` the current version of its key.
    ///
    /// Persists first, so memory never runs ahead of disk. Returns the new
    /// log sequence.
    pub fn commit(&mut self, record: PublishedRecord) -> SyncResult<u64> {
        let seq = self.state.head_seq + 1;
        let entry = StoredRecord { record, seq };
        self.storage.commit_record(&entry)?;
        self.state.head_seq = seq;
        self.state.entries.insert(entry.record.key(), entry);
        Ok(seq)
    }
}
