//! Request/response sync protocol
//!
//! Messages are serialized with postcard inside a versioned [`WireMessage`].
//! Every request carries the fingerprint of the sender's sync key; a responder
//! whose key differs answers `Rejected { KeyMismatch }` and reveals nothing.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                                  Responder
//!   |--- Hello {fp, name} ----------------------->|
//!   |<-- Welcome {name} ---------------------------|
//!   |--- Exchange {fp, since} -------------------->|
//!   |<-- Headers {records newer than since, head} -|
//!   |    (fetch + resolve + adopt locally)         |
//!   |--- Offer {fp, records} --------------------->|
//!   |<-- Fetch {fp, content_id} -------------------|  (responder pulls content)
//!   |--- Content {bytes} ------------------------->|
//!   |<-- Accepted {adopted, failed} ---------------|
//! ```

use serde::{Deserialize, Serialize};

use crate::content::ContentId;
use crate::crypto::KeyFingerprint;
use crate::error::SyncError;
use crate::types::{PublishedRecord, RecordKey};

/// Why a responder refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The request's key fingerprint does not match ours
    KeyMismatch,
    /// The responder is not online
    NodeOffline,
    /// The responder's policy forbids syncing on its current network
    PolicyRestricted,
    /// Anything else; the message is informational
    Internal(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::KeyMismatch => write!(f, "sync key mismatch"),
            RejectReason::NodeOffline => write!(f, "node offline"),
            RejectReason::PolicyRestricted => write!(f, "restricted by policy"),
            RejectReason::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

/// Messages exchanged between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Handshake; re-sent before every sync with a peer
    Hello {
        key_fingerprint: KeyFingerprint,
        display_name: Option<String>,
        device_type: Option<String>,
    },

    /// Successful handshake answer
    Welcome {
        display_name: Option<String>,
        device_type: Option<String>,
    },

    /// Ask for headers changed after the responder's log sequence `since`
    Exchange {
        key_fingerprint: KeyFingerprint,
        since: u64,
    },

    /// Headers in log order plus the responder's current log sequence
    Headers {
        records: Vec<PublishedRecord>,
        head_seq: u64,
    },

    /// Headers the initiator wants the responder to resolve and adopt
    Offer {
        key_fingerprint: KeyFingerprint,
        records: Vec<PublishedRecord>,
    },

    /// How many offered records the responder adopted, and the keys it
    /// could not integrate
    Accepted {
        adopted: u32,
        failed: Vec<RecordKey>,
    },

    /// Request a content blob
    Fetch {
        key_fingerprint: KeyFingerprint,
        content_id: ContentId,
    },

    /// Blob bytes, sealed with the payload key when `encrypted`
    Content { bytes: Vec<u8>, encrypted: bool },

    /// The responder does not hold the requested blob
    Missing { content_id: ContentId },

    Rejected { reason: RejectReason },
}

impl SyncMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::Welcome { .. } => "welcome",
            SyncMessage::Exchange { .. } => "exchange",
            SyncMessage::Headers { .. } => "headers",
            SyncMessage::Offer { .. } => "offer",
            SyncMessage::Accepted { .. } => "accepted",
            SyncMessage::Fetch { .. } => "fetch",
            SyncMessage::Content { .. } => "content",
            SyncMessage::Missing { .. } => "missing",
            SyncMessage::Rejected { .. } => "rejected",
        }
    }

    /// Fingerprint carried by a request, `None` for responses
    pub fn key_fingerprint(&self) -> Option<&KeyFingerprint> {
        match self {
            SyncMessage::Hello { key_fingerprint, .. }
            | SyncMessage::Exchange { key_fingerprint, .. }
            | SyncMessage::Offer { key_fingerprint, .. }
            | SyncMessage::Fetch { key_fingerprint, .. } => Some(key_fingerprint),
            _ => None,
        }
    }
}

/// Wrapper for versioned messages
///
/// New protocol versions are added as variants without breaking the framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(SyncMessage),
}

impl WireMessage {
    pub fn new(msg: SyncMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn into_inner(self) -> SyncMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

/// Frame a message for the transport.
pub fn encode_frame(msg: SyncMessage) -> Result<Vec<u8>, SyncError> {
    WireMessage::new(msg)
        .encode()
        .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))
}

/// Unframe a message received from the transport.
pub fn decode_frame(bytes: &[u8]) -> Result<SyncMessage, SyncError> {
    WireMessage::decode(bytes)
        .map(WireMessage::into_inner)
        .map_err(|e| SyncError::Protocol(format!("Failed to decode message: {}", e)))
}
