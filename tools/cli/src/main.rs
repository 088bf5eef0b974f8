//! docmirror CLI - Command line interface for the mirror engine.
//!
//! Registers remote collections, triggers and inspects syncs, and queues
//! local edits against a local SQLite mirror.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use docmirror_common::{CollectionId, ItemId};
use docmirror_remote::{HttpRemote, ItemPatch};
use docmirror_store::{
    CollectionKind, HistoryQuery, MirrorStore, NewRegistration, SyncAttemptRecord,
};
use docmirror_sync::{CollectionStatusView, MirrorConfig, MirrorEngine, Resolution, SyncEvent};

#[derive(Parser)]
#[command(name = "docmirror")]
#[command(about = "docmirror - Local mirror of a remote document store")]
#[command(version)]
struct Cli {
    /// Path to the mirror database.
    #[arg(long, default_value = "docmirror.db")]
    db: PathBuf,

    /// Path to a JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API token of the remote.
    #[arg(long, env = "DOCMIRROR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a remote collection.
    Register {
        /// Remote collection id.
        id: String,

        /// Display label.
        #[arg(short, long)]
        label: String,

        /// Collection kind: task_list, calendar, ledger or generic.
        #[arg(short, long, default_value = "generic")]
        kind: String,

        /// Sync interval in seconds.
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },

    /// Change label, kind or interval of a registration.
    Update {
        id: String,

        #[arg(short, long)]
        label: Option<String>,

        #[arg(short, long)]
        kind: Option<String>,

        /// Sync interval in seconds.
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Re-enable a collection and clear its failure streak.
    Enable { id: String },

    /// Stop syncing a collection.
    Disable { id: String },

    /// Show the status of one or all collections.
    Status { id: Option<String> },

    /// Show past sync attempts, newest first.
    History {
        #[arg(long)]
        collection: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the mirrored copy of an item.
    Item { id: String },

    /// Queue a local edit to push on the next sync.
    Edit {
        id: String,

        /// Property assignment `name=value`; values are parsed as JSON when possible.
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        /// New content body.
        #[arg(long)]
        content: Option<String>,
    },

    /// List items waiting for conflict resolution.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        id: String,

        /// Which side wins: remote or local.
        #[arg(long)]
        keep: String,
    },

    /// Sync one collection now.
    Sync { id: String },

    /// Sync every collection that is due.
    Run,

    /// Run the scheduler until interrupted.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the flag.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let needs_remote = matches!(
        cli.command,
        Commands::Sync { .. } | Commands::Run | Commands::Daemon
    );
    let engine = open_engine(&cli, needs_remote)?;

    match cli.command {
        Commands::Register {
            id,
            label,
            kind,
            interval,
        } => cmd_register(&engine, &id, label, &kind, interval).await,

        Commands::Update {
            id,
            label,
            kind,
            interval,
        } => cmd_update(&engine, &id, label, kind, interval).await,

        Commands::Enable { id } => {
            engine.enable(&collection_id(&id)?).await?;
            println!("Enabled {}", id);
            Ok(())
        }

        Commands::Disable { id } => {
            engine.disable(&collection_id(&id)?).await?;
            println!("Disabled {}", id);
            Ok(())
        }

        Commands::Status { id } => cmd_status(&engine, id.as_deref()),

        Commands::History {
            collection,
            offset,
            limit,
        } => cmd_history(&engine, collection.as_deref(), offset, limit),

        Commands::Item { id } => cmd_item(&engine, &id),

        Commands::Edit { id, set, content } => cmd_edit(&engine, &id, &set, content),

        Commands::Conflicts => cmd_conflicts(&engine),

        Commands::Resolve { id, keep } => cmd_resolve(&engine, &id, &keep),

        Commands::Sync { id } => cmd_sync(&engine, &id).await,

        Commands::Run => cmd_run(&engine).await,

        Commands::Daemon => cmd_daemon(&engine).await,
    }
}

/// Build the engine from the global flags.
fn open_engine(cli: &Cli, needs_remote: bool) -> Result<MirrorEngine> {
    let config = match &cli.config {
        Some(path) => MirrorConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MirrorConfig::default(),
    };

    let token = match &cli.token {
        Some(token) => token.clone(),
        None if needs_remote => {
            anyhow::bail!("A remote token is required (--token or DOCMIRROR_TOKEN)")
        }
        None => String::new(),
    };

    let store = open_store(&cli.db)?;
    let remote = HttpRemote::new(&config.remote, token).context("Failed to create remote client")?;
    MirrorEngine::new(config, store, Arc::new(remote)).context("Failed to create engine")
}

fn open_store(path: &Path) -> Result<Arc<MirrorStore>> {
    let store = MirrorStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn collection_id(raw: &str) -> Result<CollectionId> {
    CollectionId::new(raw).context("Invalid collection id")
}

fn item_id(raw: &str) -> Result<ItemId> {
    ItemId::new(raw).context("Invalid item id")
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Register a collection.
async fn cmd_register(
    engine: &MirrorEngine,
    id: &str,
    label: String,
    kind: &str,
    interval: u64,
) -> Result<()> {
    let registration = engine
        .register(NewRegistration {
            id: collection_id(id)?,
            label,
            kind: kind.parse::<CollectionKind>()?,
            sync_interval: Duration::from_secs(interval),
        })
        .await
        .context("Failed to register collection")?;

    println!("Collection registered!");
    println!("  ID: {}", registration.id);
    println!("  Label: {}", registration.label);
    println!("  Kind: {}", registration.kind);
    println!("  Interval: {}s", registration.sync_interval.as_secs());

    Ok(())
}

/// Update a registration, keeping unspecified fields.
async fn cmd_update(
    engine: &MirrorEngine,
    id: &str,
    label: Option<String>,
    kind: Option<String>,
    interval: Option<u64>,
) -> Result<()> {
    let id = collection_id(id)?;
    let current = engine
        .store()
        .get_registration(&id)?
        .with_context(|| format!("Collection {} is not registered", id))?;

    let kind = match kind {
        Some(kind) => kind.parse::<CollectionKind>()?,
        None => current.kind,
    };
    let updated = engine
        .update_registration(NewRegistration {
            id,
            label: label.unwrap_or(current.label),
            kind,
            sync_interval: interval
                .map(Duration::from_secs)
                .unwrap_or(current.sync_interval),
        })
        .await
        .context("Failed to update collection")?;

    println!(
        "Updated {} ({}, every {}s)",
        updated.id,
        updated.kind,
        updated.sync_interval.as_secs()
    );
    Ok(())
}

fn print_status(view: &CollectionStatusView) {
    let mut flags = Vec::new();
    if !view.enabled {
        flags.push("disabled");
    }
    if view.suspended {
        flags.push("suspended");
    }

    println!("{} ({}, {})", view.id, view.label, view.kind);
    println!("  Status: {} {}", view.status, flags.join(" "));
    println!("  Last success: {}", fmt_time(view.last_successful));
    println!("  Last attempt: {}", fmt_time(view.last_attempted));
    println!("  Failures in a row: {}", view.consecutive_failures);
    println!("  Circuit: {}", view.circuit);
    if let Some(error) = &view.last_error {
        println!("  Last error: {}", error);
    }
}

/// Show collection status.
fn cmd_status(engine: &MirrorEngine, id: Option<&str>) -> Result<()> {
    match id {
        Some(id) => print_status(&engine.status(&collection_id(id)?)?),
        None => {
            let statuses = engine.statuses()?;
            if statuses.is_empty() {
                println!("No collections registered.");
            }
            for view in &statuses {
                print_status(view);
            }
        }
    }
    Ok(())
}

fn print_record(record: &SyncAttemptRecord) {
    let c = &record.counts;
    println!(
        "{} {} {:<8} {:<9} fetched {} created {} updated {} unchanged {} conflicted {} errored {} archived {} pushed {}",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        record.collection_id,
        record.status.as_str(),
        record.trigger.as_str(),
        c.fetched,
        c.created,
        c.updated,
        c.unchanged,
        c.conflicted,
        c.errored,
        c.archived,
        c.pushed
    );
    if let Some(summary) = &record.error_summary {
        println!("    {}", summary);
    }
}

/// Show attempt history.
fn cmd_history(
    engine: &MirrorEngine,
    collection: Option<&str>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let query = HistoryQuery {
        collection: collection.map(collection_id).transpose()?,
        offset,
        limit,
    };
    let records = engine.history(&query)?;
    if records.is_empty() {
        println!("No sync attempts recorded.");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

/// Show one mirrored item.
fn cmd_item(engine: &MirrorEngine, id: &str) -> Result<()> {
    let id = item_id(id)?;
    let snapshot = engine
        .item(&id)?
        .with_context(|| format!("Item {} is not mirrored", id))?;

    println!("{} in {}", snapshot.item_id, snapshot.collection_id);
    println!("  Remote edited: {}", snapshot.remote_last_edited);
    println!("  Synced: {}", snapshot.synced_at);
    if snapshot.archived {
        println!("  Archived");
    }
    if snapshot.conflict {
        println!("  In conflict");
    }
    println!(
        "  Properties: {}",
        serde_json::to_string_pretty(&snapshot.properties)?
    );
    if let Some(content) = &snapshot.content {
        println!("  Content:\n{}", content);
    }
    Ok(())
}

/// Parse `name=value`; the value is JSON if it parses, a string otherwise.
fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected NAME=VALUE, got '{}'", raw))?;
    if name.is_empty() {
        anyhow::bail!("Property name cannot be empty in '{}'", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Queue a local edit.
fn cmd_edit(
    engine: &MirrorEngine,
    id: &str,
    set: &[String],
    content: Option<String>,
) -> Result<()> {
    let mut patch = ItemPatch::default();
    for raw in set {
        let (name, value) = parse_assignment(raw)?;
        patch = patch.with_property(name, value);
    }
    if let Some(content) = content {
        patch = patch.with_content(content);
    }

    let edit = engine
        .queue_local_edit(&item_id(id)?, patch)
        .context("Failed to queue edit")?;
    println!("Edit {} queued for {}", edit.id, edit.item_id);
    Ok(())
}

/// List conflicts.
fn cmd_conflicts(engine: &MirrorEngine) -> Result<()> {
    let conflicts = engine.conflicts()?;
    if conflicts.is_empty() {
        println!("No conflicts.");
    }
    for entry in &conflicts {
        let snapshot = &entry.snapshot;
        println!("{} in {}", snapshot.item_id, snapshot.collection_id);
        if let Some(detail) = &snapshot.conflict_detail {
            println!("  Remote edited: {}", detail.remote_last_edited);
            println!("  Detected: {}", detail.detected_at);
        }
        if let Some(edit) = &entry.pending_edit {
            println!(
                "  Local edit {}: {}",
                edit.id,
                serde_json::to_string(&edit.patch)?
            );
        }
    }
    Ok(())
}

/// Resolve a conflict.
fn cmd_resolve(engine: &MirrorEngine, id: &str, keep: &str) -> Result<()> {
    let resolution: Resolution = keep.parse()?;
    let snapshot = engine
        .resolve_conflict(&item_id(id)?, resolution)
        .context("Failed to resolve conflict")?;
    println!("Resolved {} keeping {}", snapshot.item_id, resolution);
    Ok(())
}

/// Force one collection.
async fn cmd_sync(engine: &MirrorEngine, id: &str) -> Result<()> {
    let id = collection_id(id)?;
    info!("Syncing {}", id);

    let result = engine.force_sync(&id).await;
    engine.shutdown().await;
    let record = result.context("Sync failed")?;

    print_record(&record);
    Ok(())
}

/// Run every due collection once.
async fn cmd_run(engine: &MirrorEngine) -> Result<()> {
    let result = engine.run_due().await;
    engine.shutdown().await;
    let records = result.context("Run failed")?;

    if records.is_empty() {
        println!("Nothing is due.");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

/// Run the scheduler until Ctrl-C.
async fn cmd_daemon(engine: &MirrorEngine) -> Result<()> {
    let mut events = engine.subscribe();
    engine.start().context("Failed to start scheduler")?;
    info!("Scheduler running; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::Completed(record)) => print_record(&record),
                Ok(SyncEvent::Failed { collection, error, .. }) => {
                    warn!("{} is failing: {}", collection, error);
                }
                Ok(SyncEvent::Recovered { collection, previous_failures }) => {
                    info!("{} recovered after {} failures", collection, previous_failures);
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
