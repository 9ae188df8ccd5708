//! Persistent storage using redb.
//!
//! One database per node holds:
//! - Node identity (endpoint secret key)
//! - Sync policy, one row per configuration key
//! - The local record index and its log sequence
//! - Content blobs (content-addressed)
//! - Peer records and per-peer sync checkpoints

use crate::error::SyncError;
use crate::types::PublishedRecord;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

mod content;
mod peers;

use content::CONTENT_TABLE;
use peers::{CHECKPOINTS_TABLE, PEERS_TABLE};

pub use peers::Checkpoint;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const POLICY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("policy");
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SECRET_KEY: &str = "endpoint_secret_key";
const LOG_SEQ_KEY: &str = "log_seq";

/// A record index entry as persisted: the current version of one logical
/// record and the log sequence at which it last changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: PublishedRecord,
    pub seq: u64,
}

fn record_key(record_type: &str, record_id: &str) -> String {
    format!("{}\0{}", record_type, record_id)
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and all tables if they don't exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(POLICY_TABLE)?;
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(CONTENT_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
            let _ = write_txn.open_table(CHECKPOINTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the node's secret key so its id survives restarts.
    pub fn save_secret_key(&self, secret_key: &[u8; 32]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(SECRET_KEY, secret_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the node's secret key, `None` on first start.
    pub fn load_secret_key(&self) -> Result<Option<[u8; 32]>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(SECRET_KEY)? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() != 32 {
                    return Err(SyncError::Storage(format!(
                        "stored secret key has {} bytes, expected 32",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Policy Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Write policy rows in a single transaction.
    pub fn save_policy_rows(&self, rows: &[(&str, Vec<u8>)]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(POLICY_TABLE)?;
            for (key, value) in rows {
                table.insert(*key, value.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_policy_rows(&self) -> Result<Vec<(String, Vec<u8>)>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(POLICY_TABLE)?;

        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            rows.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record Index Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist one index entry and advance the log sequence to its `seq`.
    pub fn commit_record(&self, entry: &StoredRecord) -> Result<(), SyncError> {
        let serialized =
            postcard::to_allocvec(entry).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let key = record_key(&entry.record.record_type, &entry.record.record_id);

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut records = write_txn.open_table(RECORDS_TABLE)?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            records.insert(key.as_str(), serialized.as_slice())?;
            meta.insert(LOG_SEQ_KEY, entry.seq)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the full record index and the current log sequence.
    pub fn load_records(&self) -> Result<(Vec<StoredRecord>, u64), SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let records = read_txn.open_table(RECORDS_TABLE)?;
        let meta = read_txn.open_table(META_TABLE)?;

        let mut entries = Vec::new();
        for entry in records.iter()? {
            let (_, value) = entry?;
            let stored: StoredRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            entries.push(stored);
        }
        let head_seq = meta.get(LOG_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
        Ok((entries, head_seq))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::content::ContentId;
    use tempfile::TempDir;

    pub(crate) fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn stored(record_id: &str, version: u64, seq: u64) -> StoredRecord {
        StoredRecord {
            record: PublishedRecord {
                record_type: "task".to_string(),
                record_id: record_id.to_string(),
                content_id: ContentId::of(record_id.as_bytes()),
                version,
            },
            seq,
        }
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_secret_key_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let key = [7u8; 32];

        {
            let storage = Storage::new(&db_path).unwrap();
            assert!(storage.load_secret_key().unwrap().is_none());
            storage.save_secret_key(&key).unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.load_secret_key().unwrap(), Some(key));
    }

    #[test]
    fn test_policy_rows_roundtrip() {
        let (storage, _temp) = create_test_storage();
        storage
            .save_policy_rows(&[("autoSync", b"true".to_vec()), ("syncIntervalMs", b"5000".to_vec())])
            .unwrap();

        let mut rows = storage.load_policy_rows().unwrap();
        rows.sort();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("autoSync".to_string(), b"true".to_vec()));
    }

    #[test]
    fn test_commit_record_overwrites_and_tracks_seq() {
        let (storage, _temp) = create_test_storage();
        storage.commit_record(&stored("1", 1, 1)).unwrap();
        storage.commit_record(&stored("2", 1, 2)).unwrap();
        storage.commit_record(&stored("1", 2, 3)).unwrap();

        let (entries, head_seq) = storage.load_records().unwrap();
        assert_eq!(head_seq, 3);
        assert_eq!(entries.len(), 2);
        let first = entries.iter().find(|e| e.record.record_id == "1").unwrap();
        assert_eq!(first.record.version, 2);
        assert_eq!(first.seq, 3);
    }

    #[test]
    fn test_empty_index() {
        let (storage, _temp) = create_test_storage();
        let (entries, head_seq) = storage.load_records().unwrap();
        assert!(entries.is_empty());
        assert_eq!(head_seq, 0);
    }
}
