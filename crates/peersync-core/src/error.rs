//! Error types for peersync

use thiserror::Error;

use crate::content::ContentId;
use crate::types::PeerId;

/// Main error type for peersync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The node is not `online`; the operation was refused without side effects
    #[error("Node is offline")]
    NodeOffline,

    /// The underlying transport failed to start
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A peer could not be reached (handshake or request failed after retries)
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable {
        /// The peer that could not be reached
        peer: PeerId,
        /// Transport-level reason
        reason: String,
    },

    /// A sync pass is already running on this node
    #[error("A sync pass is already in progress")]
    SyncInProgress,

    /// No connected peers to sync with
    #[error("No connected peers to sync with")]
    NoPeers,

    /// Content is neither stored locally nor available from any connected peer
    #[error("Content not found: {0}")]
    NotFound(ContentId),

    /// The in-memory policy changed but could not be written to disk
    #[error("Failed to persist sync policy: {0}")]
    PolicyPersistenceFailure(String),

    /// A freshly generated sync key is active in memory but was not written
    /// to disk. `key` is the new key so the caller can still share it.
    #[error("Generated sync key not persisted: {reason}")]
    SyncKeyNotPersisted { key: String, reason: String },

    /// The peer's handshake does not carry our sync key
    #[error("Sync key mismatch with peer {0}")]
    SyncKeyMismatch(PeerId),

    /// Exchange with the peer is not allowed by the current sync policy
    #[error("Sync with peer {peer} restricted by policy: {reason}")]
    PolicyRestricted {
        /// The excluded peer
        peer: PeerId,
        /// Which restriction applied
        reason: String,
    },

    /// A bounded operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled because the node stopped
    #[error("Operation cancelled")]
    Cancelled,

    /// The peer sent a message we did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine configuration or policy value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Flat classification of [`SyncError`] for callers that only need to decide
/// between retrying and surfacing the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NodeOffline,
    TransportUnavailable,
    PeerUnreachable,
    SyncInProgress,
    NoPeers,
    NotFound,
    PolicyPersistenceFailure,
    SyncKeyMismatch,
    PolicyRestricted,
    Timeout,
    Cancelled,
    Protocol,
    Storage,
    Serialization,
    Crypto,
    Network,
    InvalidConfig,
}

impl SyncError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NodeOffline => ErrorKind::NodeOffline,
            SyncError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            SyncError::PeerUnreachable { .. } => ErrorKind::PeerUnreachable,
            SyncError::SyncInProgress => ErrorKind::SyncInProgress,
            SyncError::NoPeers => ErrorKind::NoPeers,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::PolicyPersistenceFailure(_) | SyncError::SyncKeyNotPersisted { .. } => {
                ErrorKind::PolicyPersistenceFailure
            }
            SyncError::SyncKeyMismatch(_) => ErrorKind::SyncKeyMismatch,
            SyncError::PolicyRestricted { .. } => ErrorKind::PolicyRestricted,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::Storage(_)
            | SyncError::Database(_)
            | SyncError::Transaction(_)
            | SyncError::Table(_)
            | SyncError::StorageOp(_)
            | SyncError::Commit(_)
            | SyncError::Io(_) => ErrorKind::Storage,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::Crypto(_) => ErrorKind::Crypto,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransportUnavailable
                | ErrorKind::PeerUnreachable
                | ErrorKind::SyncInProgress
                | ErrorKind::NoPeers
                | ErrorKind::NotFound
                | ErrorKind::PolicyPersistenceFailure
                | ErrorKind::Timeout
                | ErrorKind::Network
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
