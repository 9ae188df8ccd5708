//! Structured logging with per-node JSONL files.
//!
//! Every node appends to its own file so several nodes on one machine can be
//! compared side by side:
//!
//! ```text
//! <data_dir>/logs/
//! ├── 2026-10-16_3f9a0c1d.jsonl
//! └── 2026-10-16_b71e44a2.jsonl
//! ```
//!
//! ```bash
//! # Everything one peer did, across nodes
//! jq 'select(.fields.peer == "b71e44a2")' logs/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_entries, NodeLogWriter};

use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{SyncError, SyncResult};

/// Filter directive for a `-v` count: warn, info, debug, then trace.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: console output plus the node's JSONL file.
///
/// `RUST_LOG` overrides the verbosity. Returns the JSONL file path.
pub fn init_logging(logs_dir: impl AsRef<Path>, node: &str, verbosity: u8) -> SyncResult<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));
    let jsonl = JsonlLayer::new(logs_dir, node)?;
    let path = jsonl.log_path().to_path_buf();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .try_init()
        .map_err(|e| SyncError::InvalidConfig(format!("logging already initialized: {}", e)))?;

    Ok(path)
}
