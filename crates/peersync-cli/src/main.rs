//! peersync CLI
//!
//! Thin wrapper around peersync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! peersync info
//!
//! # Show or change the sync policy
//! peersync policy show
//! peersync policy set --auto-sync true --interval-ms 10000
//! peersync policy new-key
//!
//! # Publish a record and list what is stored
//! peersync publish task 1 '{"title":"Buy groceries"}'
//! peersync records --type task
//!
//! # Inspect known peers
//! peersync peers list
//! peersync peers prune --days 7
//!
//! # Run a node until Ctrl+C
//! peersync serve --connect <peer-id> --discover
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use peersync_core::logging::init_logging;
use peersync_core::sync::IrohTransport;
use peersync_core::{
    EngineConfig, MemoryTransport, PeerId, PolicyUpdate, SyncEngine, SyncEvent, SyncPolicy,
    Transport,
};
use tracing::info;

/// peersync - peer-to-peer record sync
#[derive(Parser)]
#[command(name = "peersync")]
#[command(version = "0.1.0")]
#[command(about = "peersync - peer-to-peer record sync")]
#[command(
    long_about = "Replicates small JSON records between devices over direct peer connections, with no server of record."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.peersync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Display name announced to peers
    #[arg(short, long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Sync policy management
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Publish a JSON record
    Publish {
        /// Record type, e.g. "task"
        record_type: String,
        /// Record id, unique within its type
        record_id: String,
        /// JSON payload
        json: String,
    },

    /// List stored records
    Records {
        /// Only show records of this type
        #[arg(short = 't', long = "type")]
        record_type: Option<String>,
    },

    /// Peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Start serving/syncing as a persistent P2P node
    Serve {
        /// Peer ids to connect to at startup
        #[arg(short, long)]
        connect: Vec<String>,

        /// Look for peers on the local network
        #[arg(long)]
        discover: bool,

        /// Run one sync pass right after connecting
        #[arg(long)]
        sync: bool,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the current policy
    Show,
    /// Change policy fields; omitted fields are left as they are
    Set {
        #[arg(long)]
        auto_sync: Option<bool>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        wifi_only: Option<bool>,
        #[arg(long)]
        local_only: Option<bool>,
        #[arg(long)]
        encryption: Option<bool>,
        /// Shared sync key
        #[arg(long, conflicts_with = "clear_key")]
        sync_key: Option<String>,
        /// Remove the sync key
        #[arg(long)]
        clear_key: bool,
    },
    /// Generate and store a fresh sync key
    NewKey,
}

#[derive(Subcommand)]
enum PeersAction {
    /// List known peers
    List,
    /// Forget peers that have been idle longer than the retention period
    Prune {
        /// Retention in days (default: configured retention)
        #[arg(long)]
        days: Option<u64>,
    },
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peersync")
        .join("data")
}

fn print_policy(policy: &SyncPolicy) {
    println!("Sync policy:");
    println!("  Auto sync: {}", policy.auto_sync);
    println!("  Interval: {} ms", policy.interval_ms);
    println!("  Wi-Fi only: {}", policy.restrict_to_wifi);
    println!("  Local network only: {}", policy.restrict_to_local_network);
    println!("  Encryption: {}", policy.encryption_enabled);
    match policy.key_fingerprint() {
        Some(fp) => {
            let short: String = fp[..8].iter().map(|b| format!("{:02x}", b)).collect();
            println!("  Sync key: set (fingerprint {})", short);
        }
        None => println!("  Sync key: (none)"),
    }
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let mut config = EngineConfig::new(data_dir.clone());
    if let Some(name) = &cli.name {
        config = config.with_display_name(name.clone());
    }
    let log_name = cli.name.clone().unwrap_or_else(|| "peersync".to_string());
    let log_path = init_logging(config.logs_dir(), &log_name, cli.verbose)?;
    info!(path = %log_path.display(), "Logging initialized");

    match cli.command {
        Commands::Info => {
            let engine = SyncEngine::builder(config).open()?;
            let session = engine.session();

            println!("peersync v0.1.0");
            println!();
            println!("Node:");
            // The id the node will use on its next start
            match engine.storage().load_secret_key()? {
                Some(secret) => println!("  ID: {}", engine.transport().node_id(&secret)),
                None => println!("  ID: (generated on first serve)"),
            }
            println!("  Status: {}", engine.node_status());
            if let Some(name) = &engine.config().display_name {
                println!("  Name: {}", name);
            }
            println!();
            print_policy(&engine.policy());
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Records: {}", engine.records(None).len());
            println!("Blobs: {}", engine.content_count()?);
            println!("Known peers: {}", engine.peers().len());
            match session.last_synced_at {
                Some(at) => println!("Last sync: {}", format_time(at)),
                None => println!("Last sync: never"),
            }
        }

        Commands::Policy { action } => {
            let engine = SyncEngine::builder(config).open()?;
            match action {
                PolicyAction::Show => print_policy(&engine.policy()),

                PolicyAction::Set {
                    auto_sync,
                    interval_ms,
                    wifi_only,
                    local_only,
                    encryption,
                    sync_key,
                    clear_key,
                } => {
                    let mut update = PolicyUpdate::new();
                    if let Some(v) = auto_sync {
                        update = update.auto_sync(v);
                    }
                    if let Some(v) = interval_ms {
                        update = update.interval_ms(v);
                    }
                    if let Some(v) = wifi_only {
                        update = update.restrict_to_wifi(v);
                    }
                    if let Some(v) = local_only {
                        update = update.restrict_to_local_network(v);
                    }
                    if let Some(v) = encryption {
                        update = update.encryption_enabled(v);
                    }
                    if let Some(key) = sync_key {
                        update = update.sync_key(Some(key));
                    } else if clear_key {
                        update = update.sync_key(None);
                    }

                    let policy = engine.update_policy(update)?;
                    println!("Policy updated.");
                    println!();
                    print_policy(&policy);
                }

                PolicyAction::NewKey => {
                    let key = engine.generate_sync_key()?;
                    println!("New sync key generated.");
                    println!();
                    println!("  {}", key);
                    println!();
                    println!("Share it with the devices that should sync with this one.");
                    println!("Peers holding the old key are no longer synced with.");
                }
            }
        }

        Commands::Publish {
            record_type,
            record_id,
            json,
        } => {
            let value: serde_json::Value = serde_json::from_str(&json)
                .map_err(|e| anyhow::anyhow!("Invalid JSON payload: {}", e))?;

            // Publishing needs an online node but not a network
            let engine = SyncEngine::builder(config)
                .transport(Arc::new(MemoryTransport::detached()))
                .open()?;
            engine.start().await?;
            let result = engine.publish_raw(&record_type, &record_id, serde_json::to_vec(&value)?);
            engine.stop().await;
            let content_id = result?;

            let version = engine
                .record(&record_type, &record_id)
                .map(|r| r.version)
                .unwrap_or_default();
            println!("Published {}#{} v{}", record_type, record_id, version);
            println!("  Content: {}", content_id);
        }

        Commands::Records { record_type } => {
            let engine = SyncEngine::builder(config).open()?;
            let records = engine.records(record_type.as_deref());
            if records.is_empty() {
                println!("No records found.");
            } else {
                println!("Records ({}):", records.len());
                println!();
                for record in records {
                    let payload = engine
                        .read::<serde_json::Value>(&record.record_type, &record.record_id)
                        .ok()
                        .flatten()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "(content missing)".to_string());
                    println!(
                        "  {}#{} v{} [{}] {}",
                        record.record_type,
                        record.record_id,
                        record.version,
                        record.content_id.short(),
                        payload
                    );
                }
            }
        }

        Commands::Peers { action } => {
            let engine = SyncEngine::builder(config).open()?;
            match action {
                PeersAction::List => {
                    let peers = engine.peers();
                    if peers.is_empty() {
                        println!("No peers found.");
                    } else {
                        println!("Known peers ({}):", peers.len());
                        println!();
                        for peer in peers {
                            let name = peer
                                .display_name
                                .clone()
                                .unwrap_or_else(|| "(unnamed)".to_string());
                            println!(
                                "  {} - {} [{}]{}{} last seen {}",
                                peer.id.short(),
                                name,
                                peer.status,
                                if peer.is_local { " local" } else { "" },
                                if peer.key_verified { " verified" } else { "" },
                                format_time(peer.last_seen)
                            );
                        }
                    }
                }

                PeersAction::Prune { days } => {
                    let retention = days
                        .map(|d| {
                            d.checked_mul(24 * 60 * 60)
                                .map(Duration::from_secs)
                                .ok_or_else(|| anyhow::anyhow!("Retention of {} days is too large", d))
                        })
                        .transpose()?;
                    let removed = engine.prune_peers(retention)?;
                    println!("Pruned {} peer(s).", removed.len());
                    for id in removed {
                        println!("  {}", id.short());
                    }
                }
            }
        }

        Commands::Serve {
            connect,
            discover,
            sync,
        } => {
            println!("Starting peersync...");
            println!();

            let engine = SyncEngine::builder(config)
                .transport(Arc::new(IrohTransport::new()))
                .open()?;
            let mut events = engine.subscribe_events();
            let identity = engine.start().await?;

            println!("Node:");
            println!("  ID: {}", identity.id);
            for addr in &identity.public_addresses {
                println!("  Address: {}", addr);
            }
            println!();

            for peer in &connect {
                match engine.connect(&PeerId::new(peer.as_str())).await {
                    Ok(record) => println!("Connected to {} [{}]", record.id.short(), record.status),
                    Err(e) => println!("Could not connect to {}: {}", peer, e),
                }
            }

            let mut discovery = if discover {
                Some(engine.discover_local()?)
            } else {
                None
            };

            if sync {
                match engine.sync_now().await {
                    Ok(report) => println!(
                        "Initial sync: {}/{} peers, {} merged",
                        report.peers_succeeded, report.peers_attempted, report.records_merged
                    ),
                    Err(e) => println!("Initial sync skipped: {}", e),
                }
            }

            println!("Data directory: {}", data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(SyncEvent::SyncCompleted(report)) if !report.is_clean() => {
                            println!("[Sync] {} peer error(s)", report.peer_errors.len());
                            for (peer, failure) in &report.peer_errors {
                                println!("  {}: {}", peer.short(), failure);
                            }
                        }
                        Ok(event) => println!("[Event] {}", event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            println!("[Event] {} event(s) dropped", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    Some(peer) = async {
                        match discovery.as_mut() {
                            Some(stream) => stream.next().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        println!("[Discovery] {} on the local network", peer.id.short());
                    }
                }
            }

            println!("Shutting down...");
            engine.stop().await;
            println!("Goodbye.");
        }
    }

    Ok(())
}
