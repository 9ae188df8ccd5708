//! Content blob storage
//!
//! Blobs are keyed by the hex form of their BLAKE3 content id and are never
//! rewritten once present.

use crate::content::ContentId;
use crate::error::SyncError;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::Storage;

/// Table for content blobs (key: content id hex, value: raw bytes)
pub(crate) const CONTENT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("content");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Content Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a blob under its id unless already present.
    ///
    /// Returns `true` if the blob was newly inserted.
    pub fn put_content(&self, id: &ContentId, data: &[u8]) -> Result<bool, SyncError> {
        let key = id.to_hex();
        let db = self.db_handle();
        let db_guard = db.read();

        let write_txn = db_guard.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(CONTENT_TABLE)?;
            let exists = table.get(key.as_str())?.is_some();
            if !exists {
                table.insert(key.as_str(), data)?;
            }
            !exists
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    pub fn get_content(&self, id: &ContentId) -> Result<Option<Vec<u8>>, SyncError> {
        let key = id.to_hex();
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CONTENT_TABLE)?;

        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    pub fn has_content(&self, id: &ContentId) -> Result<bool, SyncError> {
        let key = id.to_hex();
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CONTENT_TABLE)?;

        Ok(table.get(key.as_str())?.is_some())
    }

    /// Number of distinct blobs stored
    pub fn content_count(&self) -> Result<u64, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CONTENT_TABLE)?;
        Ok(table.len()?)
    }
}
