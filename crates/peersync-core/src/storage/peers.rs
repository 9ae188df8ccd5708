//! Peer records and per-peer sync checkpoints

use crate::error::SyncError;
use crate::types::{PeerId, PeerRecord};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::Storage;

/// Table for peer records (key: peer id, value: postcard PeerRecord)
pub(crate) const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");

/// Table for sync checkpoints (key: peer id, value: postcard Checkpoint)
pub(crate) const CHECKPOINTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("checkpoints");

/// How far this node has synced with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The peer's log sequence up to which its headers were pulled
    pub received: u64,
    /// Our own log sequence up to which records were offered to the peer
    pub offered: u64,
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Peer Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a peer record, overwriting any previous one with the same id.
    pub fn save_peer(&self, peer: &PeerRecord) -> Result<(), SyncError> {
        let serialized =
            postcard::to_allocvec(peer).map_err(|e| SyncError::Serialization(e.to_string()))?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            table.insert(peer.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let peer: PeerRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            peers.push(peer);
        }
        Ok(peers)
    }

    /// Remove peer records and their checkpoints.
    pub fn delete_peers(&self, ids: &[PeerId]) -> Result<(), SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut peers = write_txn.open_table(PEERS_TABLE)?;
            let mut checkpoints = write_txn.open_table(CHECKPOINTS_TABLE)?;
            for id in ids {
                peers.remove(id.as_str())?;
                checkpoints.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoint Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_checkpoint(&self, peer: &PeerId, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let serialized = postcard::to_allocvec(checkpoint)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINTS_TABLE)?;
            table.insert(peer.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the checkpoint for a peer; a peer never synced with starts at zero.
    pub fn load_checkpoint(&self, peer: &PeerId) -> Result<Checkpoint, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CHECKPOINTS_TABLE)?;

        match table.get(peer.as_str())? {
            Some(v) => postcard::from_bytes(v.value())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Ok(Checkpoint::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::create_test_storage;
    use crate::types::PeerStatus;

    #[test]
    fn test_save_and_list_peers() {
        let (storage, _temp) = create_test_storage();
        let mut peer = PeerRecord::new(PeerId::new("peer-a"), PeerStatus::Connected);
        peer.display_name = Some("Laptop".to_string());
        storage.save_peer(&peer).unwrap();

        peer.status = PeerStatus::Disconnected;
        storage.save_peer(&peer).unwrap();

        let peers = storage.list_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Disconnected);
        assert_eq!(peers[0].display_name.as_deref(), Some("Laptop"));
    }

    #[test]
    fn test_checkpoint_defaults_to_zero() {
        let (storage, _temp) = create_test_storage();
        let cp = storage.load_checkpoint(&PeerId::new("unknown")).unwrap();
        assert_eq!(cp, Checkpoint::default());
    }

    #[test]
    fn test_delete_peer_removes_checkpoint() {
        let (storage, _temp) = create_test_storage();
        let id = PeerId::new("peer-a");
        storage
            .save_peer(&PeerRecord::new(id.clone(), PeerStatus::Discovered))
            .unwrap();
        storage
            .save_checkpoint(&id, &Checkpoint { received: 4, offered: 9 })
            .unwrap();

        storage.delete_peers(&[id.clone()]).unwrap();

        assert!(storage.list_peers().unwrap().is_empty());
        assert_eq!(storage.load_checkpoint(&id).unwrap(), Checkpoint::default());
    }
}
