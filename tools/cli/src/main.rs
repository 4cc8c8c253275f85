//! TwinSync CLI - Command line interface for reconciliation passes.
//!
//! Both replicas are JSON snapshot files loaded into the in-memory stores;
//! watermarks live in a state directory between runs.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use twinsync_store::{LocalSnapshot, MemoryLocalStore, MemoryRemoteStore, RemoteSnapshot};
use twinsync_sync::watermark::is_initial;
use twinsync_sync::{
    Clock, FileWatermarkStore, RelationshipValidator, SyncConfig, SyncEngine, SyncResult,
    SyncStats, SystemClock, WatermarkStore,
};

#[derive(Parser)]
#[command(name = "twinsync")]
#[command(about = "TwinSync - Two-way contact and record reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass between two snapshot files.
    Sync {
        /// Local replica snapshot (created if missing).
        #[arg(short, long)]
        local: PathBuf,

        /// Remote replica snapshot (created if missing).
        #[arg(short, long)]
        remote: PathBuf,

        /// Directory holding the watermarks.
        #[arg(short, long)]
        state_dir: PathBuf,

        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Identifier tagged on remote writes.
        #[arg(short, long)]
        device_id: Option<String>,
    },

    /// Show the stored watermarks.
    Status {
        /// Directory holding the watermarks.
        #[arg(short, long)]
        state_dir: PathBuf,
    },

    /// Forget all watermarks; the next pass is a first sync.
    Reset {
        /// Directory holding the watermarks.
        #[arg(short, long)]
        state_dir: PathBuf,
    },

    /// Check that every local record points at an existing contact.
    Validate {
        /// Local replica snapshot.
        #[arg(short, long)]
        local: PathBuf,

        /// Remote replica snapshot whose live contacts also count.
        #[arg(short, long)]
        remote: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Sync {
            local,
            remote,
            state_dir,
            config,
            device_id,
        } => cmd_sync(&local, &remote, &state_dir, config.as_deref(), device_id).await,

        Commands::Status { state_dir } => cmd_status(&state_dir).await,

        Commands::Reset { state_dir } => cmd_reset(&state_dir).await,

        Commands::Validate { local, remote } => cmd_validate(&local, remote.as_deref()).await,
    }
}

/// Read a JSON snapshot, or the empty snapshot when the file does not exist.
async fn read_snapshot<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("Failed to access {}", path.display()))?
    {
        info!("{} does not exist, starting empty", path.display());
        return Ok(T::default());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid snapshot {}", path.display()))
}

async fn write_snapshot<T: serde::Serialize>(path: &Path, snapshot: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("Failed to encode snapshot")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Run one sync pass.
async fn cmd_sync(
    local_path: &Path,
    remote_path: &Path,
    state_dir: &Path,
    config_path: Option<&Path>,
    device_id: Option<String>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => SyncConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let local = Arc::new(MemoryLocalStore::from_snapshot(
        read_snapshot::<LocalSnapshot>(local_path).await?,
    ));
    let remote = Arc::new(
        MemoryRemoteStore::from_snapshot(read_snapshot::<RemoteSnapshot>(remote_path).await?)
            .context("Failed to load remote snapshot")?,
    );
    let watermarks = Arc::new(
        FileWatermarkStore::open(state_dir)
            .await
            .context("Failed to open state directory")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(match device_id {
        Some(id) => SystemClock::new(id),
        None => SystemClock::generated(),
    });

    let report = |fraction: f64, status: &str| {
        println!("[{:>3.0}%] {}", fraction * 100.0, status);
    };
    let engine = SyncEngine::new(local.clone(), remote.clone(), watermarks, config)
        .with_clock(clock)
        .with_progress(Arc::new(report));

    info!("Syncing as device {}", engine.device_id());
    let result = engine.perform_sync().await;

    write_snapshot(local_path, &local.snapshot()?).await?;
    write_snapshot(remote_path, &remote.snapshot()?).await?;

    match result {
        SyncResult::Success(stats) => {
            println!("\nSync completed successfully.");
            print_stats(&stats);
            Ok(())
        }
        SyncResult::PartialSuccess(stats, errors) => {
            println!("\nSync completed with {} errors.", errors.len());
            print_stats(&stats);
            for err in &errors {
                println!("  ! {}", err);
            }
            Ok(())
        }
        SyncResult::Failure(err) => Err(anyhow::Error::new(err).context("Sync failed")),
    }
}

fn print_stats(stats: &SyncStats) {
    for (label, counts) in [("Contacts", &stats.contacts), ("Records", &stats.records)] {
        println!(
            "  {:<9} {} inserted, {} updated, {} deleted",
            format!("{}:", label),
            counts.inserted,
            counts.updated,
            counts.deleted
        );
    }
    println!(
        "  Conflicts: {} detected, {} resolved",
        stats.conflicts_detected, stats.conflicts_resolved
    );
    println!("  Transferred: {} bytes", stats.bytes_transferred);
    println!("  Retries: {}", stats.retry_attempts);
    println!(
        "  Time: {:?} ({:?} waiting on remote)",
        stats.elapsed, stats.network_latency
    );
}

fn format_watermark(at: DateTime<Utc>) -> String {
    if is_initial(at) {
        "never".to_string()
    } else {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Show watermarks.
async fn cmd_status(state_dir: &Path) -> Result<()> {
    let store = FileWatermarkStore::open(state_dir)
        .await
        .context("Failed to open state directory")?;
    let marks = store.all().await?;

    println!("Watermarks ({}):", store.path().display());
    for (collection, direction, at) in marks.pairs() {
        println!(
            "  {:<10} {:<9} {}",
            collection.as_str(),
            direction.as_str(),
            format_watermark(at)
        );
    }

    Ok(())
}

/// Reset watermarks.
async fn cmd_reset(state_dir: &Path) -> Result<()> {
    let store = FileWatermarkStore::open(state_dir)
        .await
        .context("Failed to open state directory")?;
    store.reset().await.context("Failed to reset watermarks")?;

    println!("Watermarks reset. The next sync is a first sync.");
    Ok(())
}

/// Report records with unresolved contacts.
async fn cmd_validate(local_path: &Path, remote_path: Option<&Path>) -> Result<()> {
    let local: LocalSnapshot = read_snapshot(local_path).await?;

    let mut validator = RelationshipValidator::new().with_contacts(&local.contacts);
    if let Some(path) = remote_path {
        let remote: RemoteSnapshot = read_snapshot(path).await?;
        validator = validator.with_contact_ids(
            remote
                .contacts
                .iter()
                .filter(|row| !row.is_deleted())
                .map(|row| row.id()),
        );
    }

    let violations = validator.validate(&local.records);
    if violations.is_empty() {
        println!("All {} records are linked.", local.records.len());
        return Ok(());
    }

    println!("{} of {} records are unlinked:", violations.len(), local.records.len());
    for violation in &violations {
        println!("  ! {}", violation);
    }
    anyhow::bail!("{} relationship violations", violations.len())
}
