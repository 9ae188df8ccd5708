//! Conflict resolution between two versions of the same logical record
//!
//! A resolver must be pure, deterministic and commutative: whichever node
//! runs it, and in whichever argument order, the same winner comes out. That
//! is what lets replicas converge without coordination. [`LastWriterWins`] is
//! the structural default; domain-aware resolvers plug in through
//! [`ConflictResolver`].

use std::cmp::Ordering;

use crate::content::ContentId;
use crate::types::PublishedRecord;

/// One side of a conflict.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub record: &'a PublishedRecord,
    /// Raw payload, present when the resolver asked for payloads
    pub payload: Option<&'a [u8]>,
}

impl<'a> Candidate<'a> {
    pub fn new(record: &'a PublishedRecord) -> Self {
        Self {
            record,
            payload: None,
        }
    }

    pub fn with_payload(record: &'a PublishedRecord, payload: &'a [u8]) -> Self {
        Self {
            record,
            payload: Some(payload),
        }
    }
}

/// Decision returned by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the first argument
    Left,
    /// Keep the second argument
    Right,
    /// A newly synthesized payload. Its version is raised to at least the
    /// larger input version.
    Merged { version: u64, payload: Vec<u8> },
}

/// Strategy for resolving two diverging versions of one record.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, a: Candidate<'_>, b: Candidate<'_>) -> Resolution;

    /// Whether `resolve` reads payloads. When false, callers may resolve on
    /// headers alone and skip fetching content for the losing side.
    fn needs_payloads(&self) -> bool {
        false
    }
}

/// Last-writer-wins by version, ties broken by content id bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl LastWriterWins {
    fn order(a: &PublishedRecord, b: &PublishedRecord) -> Ordering {
        a.version
            .cmp(&b.version)
            .then_with(|| a.content_id.cmp(&b.content_id))
    }
}

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, a: Candidate<'_>, b: Candidate<'_>) -> Resolution {
        match Self::order(a.record, b.record) {
            Ordering::Less => Resolution::Right,
            _ => Resolution::Left,
        }
    }
}

/// The winning record of a resolution, plus its payload when synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub record: PublishedRecord,
    pub merged_payload: Option<Vec<u8>>,
}

/// Run `resolver` and materialize the winning record.
///
/// A merged payload whose content equals the higher-versioned input collapses
/// to that input, so an idempotent merge never bumps versions on repeated
/// syncs. Content equal only to the lower-versioned input is re-stamped at or
/// above the higher version.
pub fn resolve_records(
    resolver: &dyn ConflictResolver,
    a: Candidate<'_>,
    b: Candidate<'_>,
) -> Resolved {
    match resolver.resolve(a, b) {
        Resolution::Left => Resolved {
            record: a.record.clone(),
            merged_payload: None,
        },
        Resolution::Right => Resolved {
            record: b.record.clone(),
            merged_payload: None,
        },
        Resolution::Merged { version, payload } => {
            let content_id = ContentId::of(&payload);
            let floor = a.record.version.max(b.record.version);
            for input in [a.record, b.record] {
                if content_id == input.content_id && input.version == floor {
                    return Resolved {
                        record: input.clone(),
                        merged_payload: None,
                    };
                }
            }
            Resolved {
                record: PublishedRecord {
                    record_type: a.record.record_type.clone(),
                    record_id: a.record.record_id.clone(),
                    content_id,
                    version: version.max(floor),
                },
                merged_payload: Some(payload),
            }
        }
    }
}
