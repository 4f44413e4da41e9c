//! Harborsync CLI - operator interface for the offline sync store.
//!
//! Inspects and drives the local queue, conflicts and records of a
//! harborsync session against an HTTP backend.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use harborsync_common::{Collection, ConflictStrategy, Method, Priority, ResourceId};
use harborsync_store::CollectionSnapshot;
use harborsync_sync::{
    NewRequest, Resolution, SyncAllReport, SyncConfig, SyncContext, SyncEngine,
};

const DEFAULT_BACKEND: &str = "http://localhost:8080/api";

#[derive(Parser)]
#[command(name = "harborsync")]
#[command(about = "Harborsync - offline-first sync for the dashboard backend")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: <data dir>/harborsync/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the config file.
    #[arg(short, long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show network, queue and staleness status.
    Status,

    /// List queued requests in dispatch order.
    Queue,

    /// Queue a change without contacting the backend.
    Enqueue {
        #[arg(short, long)]
        collection: Collection,

        #[arg(short, long)]
        id: ResourceId,

        /// POST, PUT, PATCH or DELETE.
        #[arg(short, long, default_value = "PUT")]
        method: Method,

        /// JSON body; required except for DELETE.
        #[arg(short = 'd', long)]
        body: Option<String>,

        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },

    /// Push queued changes and refresh from the backend.
    Sync {
        /// Only this collection (default: all configured).
        #[arg(short, long)]
        collection: Option<Collection>,

        /// server-wins, client-wins or manual.
        #[arg(short, long)]
        strategy: Option<ConflictStrategy>,
    },

    /// Push queued changes without pulling.
    Process,

    /// List unresolved conflicts.
    Conflicts {
        #[arg(short, long, default_value = "containers")]
        collection: Collection,
    },

    /// Resolve a conflict held for manual resolution.
    Resolve {
        #[arg(short, long)]
        collection: Collection,

        #[arg(short, long)]
        id: ResourceId,

        #[arg(short, long, value_enum)]
        keep: Keep,

        /// Merged JSON value, with `--keep merged`.
        #[arg(long)]
        value: Option<String>,
    },

    /// Retry a failed request.
    Retry {
        request_id: String,
    },

    /// Drop a failed request.
    Discard {
        request_id: String,
    },

    /// Show storage statistics.
    Stats {
        #[arg(short, long, default_value = "containers")]
        collection: Collection,
    },

    /// Delete every record, conflict and queued request of a collection.
    Clear {
        #[arg(short, long)]
        collection: Collection,

        /// Confirm the irreversible deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Write a collection snapshot to a file.
    Export {
        #[arg(short, long)]
        collection: Collection,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace a collection with a snapshot file.
    Import {
        #[arg(short, long)]
        collection: Collection,

        #[arg(short, long)]
        input: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Keep {
    Local,
    Server,
    Merged,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "harborsync", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref(), cli.backend)?;
    let context = SyncContext::connect(config).context("Failed to open sync context")?;
    if let Some(reason) = context.degraded_reason() {
        eprintln!("Warning: local storage is read-only ({})", reason);
    }
    let engine = context.engine();

    match cli.command {
        Commands::Status => cmd_status(&context).await,
        Commands::Queue => cmd_queue(engine).await,
        Commands::Enqueue {
            collection,
            id,
            method,
            body,
            priority,
        } => cmd_enqueue(engine, collection, id, method, body.as_deref(), priority).await,
        Commands::Sync {
            collection,
            strategy,
        } => cmd_sync(engine, collection, strategy).await,
        Commands::Process => {
            let report = engine.process_pending_requests().await?;
            print_report(&report);
            Ok(())
        }
        Commands::Conflicts { collection } => cmd_conflicts(engine, &collection),
        Commands::Resolve {
            collection,
            id,
            keep,
            value,
        } => cmd_resolve(engine, &collection, &id, keep, value.as_deref()).await,
        Commands::Retry { request_id } => {
            let request = engine.retry_failed(&request_id).await?;
            println!("Request {} queued again ({} {})", request.id, request.method, request.url());
            Ok(())
        }
        Commands::Discard { request_id } => {
            let request = engine.discard_failed(&request_id).await?;
            println!("Request {} discarded ({} {})", request.id, request.method, request.url());
            Ok(())
        }
        Commands::Stats { collection } => cmd_stats(engine, &collection),
        Commands::Clear { collection, yes } => {
            if !yes {
                bail!("Refusing to clear {} without --yes", collection);
            }
            engine.clear(&collection, true).await?;
            println!("Cleared {}", collection);
            Ok(())
        }
        Commands::Export { collection, output } => cmd_export(engine, &collection, &output),
        Commands::Import { collection, input } => cmd_import(engine, &collection, &input).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn default_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Could not determine the data directory")?
        .join("harborsync"))
}

fn load_config(path: Option<&Path>, backend: Option<String>) -> Result<SyncConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_dir()?.join("config.json"),
    };
    debug!("Using config {}", path.display());

    let mut config = SyncConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if config.database_path.is_none() {
        config.database_path = Some(default_dir()?.join("sync.db"));
    }
    if let Some(url) = backend {
        config.backend_url = Some(url);
    }
    if config.backend_url.is_none() {
        config.backend_url = Some(DEFAULT_BACKEND.to_string());
    }
    Ok(config)
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("Invalid JSON")
}

async fn cmd_status(context: &SyncContext) -> Result<()> {
    let engine = context.engine();
    let reachable = engine.transport().probe().await.is_ok();
    engine.network().force(reachable);

    let status = engine.queue_status().await?;
    println!("Sync status:");
    println!(
        "  Backend: {} ({})",
        engine.config().backend_url.as_deref().unwrap_or("-"),
        if engine.network_status() { "online" } else { "offline" }
    );
    println!(
        "  Queue: {} requests ({} high, {} medium, {} low)",
        status.total, status.by_priority.high, status.by_priority.medium, status.by_priority.low
    );
    println!("  Failed: {}", status.failed);
    println!("  Conflicts: {}", status.conflicts);
    match engine.data_age(None)? {
        Some(age) => println!("  Last sync: {} ({}s ago)", format_last_sync(&status), age.num_seconds()),
        None => println!("  Last sync: never"),
    }
    if let Some(reason) = context.degraded_reason() {
        println!("  Storage: read-only ({})", reason);
    }
    Ok(())
}

fn format_last_sync(status: &harborsync_sync::QueueStatus) -> String {
    status
        .last_sync
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_queue(engine: &SyncEngine) -> Result<()> {
    let requests = engine.queued_requests().await;
    if requests.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("Queued requests:");
    for request in requests {
        let error = request
            .last_error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  {} [{}] {} {} ({:?}, attempt {}/{}){}",
            request.id,
            request.priority,
            request.method,
            request.url(),
            request.status,
            request.retry_count,
            request.max_retries,
            error
        );
    }
    Ok(())
}

async fn cmd_enqueue(
    engine: &SyncEngine,
    collection: Collection,
    id: ResourceId,
    method: Method,
    body: Option<&str>,
    priority: Priority,
) -> Result<()> {
    let mut new = NewRequest::new(collection, id, method).with_priority(priority);
    if let Some(body) = body {
        new = new.with_body(parse_json(body)?);
    }

    let request = engine.submit(new).await?;
    info!("Queued {} {}", request.method, request.url());
    println!("Queued request {}", request.id);
    Ok(())
}

async fn cmd_sync(
    engine: &SyncEngine,
    collection: Option<Collection>,
    strategy: Option<ConflictStrategy>,
) -> Result<()> {
    match collection {
        Some(collection) => {
            let result = engine.sync_collection(&collection, strategy).await?;
            println!(
                "{}: {} ({} pushed, {} pulled, {} conflicts, {} failed)",
                result.collection,
                if result.success { "ok" } else { "failed" },
                result.processed,
                result.pulled,
                result.conflicts,
                result.failed
            );
            if let Some(error) = result.error {
                println!("  Error: {}", error);
            }
        }
        None => print_report(&engine.sync_all(strategy).await?),
    }
    Ok(())
}

fn print_report(report: &SyncAllReport) {
    println!("Sync finished in {:.1?}: {:?}", report.duration, report.outcome);
    for result in report.results.values() {
        println!(
            "  {}: {} pushed, {} pulled, {} conflicts, {} failed{}",
            result.collection,
            result.processed,
            result.pulled,
            result.conflicts,
            result.failed,
            result
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
}

fn cmd_conflicts(engine: &SyncEngine, collection: &Collection) -> Result<()> {
    let conflicts = engine.conflict_items(collection)?;
    if conflicts.is_empty() {
        println!("No conflicts in {}.", collection);
        return Ok(());
    }

    for item in conflicts {
        println!("{}/{} ({}, detected {})", item.collection, item.id, item.strategy, item.detected_at);
        println!("  Local:  {}", item.local_data);
        match (&item.server_data, item.server_revision) {
            (Some(data), Some(revision)) => println!("  Server: {} (revision {})", data, revision),
            (Some(data), None) => println!("  Server: {}", data),
            (None, _) => println!("  Server: (not fetched)"),
        }
    }
    Ok(())
}

async fn cmd_resolve(
    engine: &SyncEngine,
    collection: &Collection,
    id: &ResourceId,
    keep: Keep,
    value: Option<&str>,
) -> Result<()> {
    let resolution = match (keep, value) {
        (Keep::Local, _) => Resolution::KeepLocal,
        (Keep::Server, _) => Resolution::KeepServer,
        (Keep::Merged, Some(value)) => Resolution::Merged(parse_json(value)?),
        (Keep::Merged, None) => bail!("--keep merged requires --value"),
    };

    engine.resolve_conflict(collection, id, resolution).await?;
    println!("Resolved {}/{}", collection, id);
    Ok(())
}

fn cmd_stats(engine: &SyncEngine, collection: &Collection) -> Result<()> {
    let stats = engine.storage_stats(collection)?;
    println!("Storage for {}:", collection);
    println!("  Records: {}", stats.total);
    println!("  Synced: {}", stats.synced);
    println!("  Pending: {}", stats.pending);
    println!("  Conflicts: {}", stats.conflicts);
    println!("  Size: {}", format_size(stats.total_size));
    Ok(())
}

fn cmd_export(engine: &SyncEngine, collection: &Collection, output: &Path) -> Result<()> {
    let snapshot = engine.export(collection)?;
    std::fs::write(output, snapshot.to_json()?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Exported {} records of {} to {}",
        snapshot.records.len(),
        collection,
        output.display()
    );
    Ok(())
}

async fn cmd_import(engine: &SyncEngine, collection: &Collection, input: &Path) -> Result<()> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let snapshot = CollectionSnapshot::from_json(&json)?;
    let queued = engine.import(collection, &snapshot).await?;
    println!(
        "Imported {} records into {} ({} requests queued)",
        snapshot.records.len(),
        collection,
        queued
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
