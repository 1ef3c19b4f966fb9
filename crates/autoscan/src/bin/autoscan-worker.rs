//! autoscan-worker: runs the autoscan subsystem as a standalone process.
//!
//! Host settings come from `AUTOSCAN_*` environment variables (profiled via
//! `AUTOSCAN_PROFILE`); command-line flags override them. Ingest settings
//! come from a TOML document that is reloaded on change. Events
//! are written to stdout as JSON lines; dispositions and manual file
//! commands are read from stdin:
//!
//! - `finalize <id> <add|remove|delay>`
//! - `delete <path>`
//! - `manage <path>`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};
use uuid::Uuid;

use canvas_autoscan::{AutoscanContext, Finalizer, SettingsFile, SettingsReconciler, Trashed};
use canvas_core::config::load_dotenv;
use canvas_core::{Disposition, WorkerConfig};

// ── CLI ─────────────────────────────────────────────────────────────

/// Autoscan worker: directory watching and staged file ingestion.
#[derive(Parser, Debug)]
#[command(name = "autoscan-worker", version, about)]
struct Cli {
    /// Application data directory (ledger, trash, default settings).
    /// Overrides `AUTOSCAN_DATA_DIR`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the autoscan.toml settings document.
    /// Overrides `AUTOSCAN_SETTINGS`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Window for collapsing bursts of settings changes, in milliseconds.
    /// Overrides `AUTOSCAN_COALESCE_MS`.
    #[arg(long)]
    coalesce_ms: Option<u64>,
}

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Finalize(Uuid, Disposition),
    Delete(PathBuf),
    Manage(PathBuf),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    match verb {
        "finalize" => {
            let mut parts = rest.split_whitespace();
            let id = Uuid::parse_str(parts.next()?).ok()?;
            let disposition = Disposition::parse(parts.next().unwrap_or_default());
            Some(Command::Finalize(id, disposition))
        }
        "delete" if !rest.is_empty() => Some(Command::Delete(PathBuf::from(rest))),
        "manage" if !rest.is_empty() => Some(Command::Manage(PathBuf::from(rest))),
        _ => None,
    }
}

async fn run_command(finalizer: &Finalizer, command: Command) {
    match command {
        Command::Finalize(id, disposition) => match finalizer.finalize(id, disposition).await {
            Ok(outcome) => info!(id = %id, ?outcome, "finalized"),
            Err(e) => warn!(id = %id, error = %e, "finalize failed"),
        },
        Command::Delete(path) => match finalizer.delete(&path).await {
            Ok(Trashed::System) => info!(path = %path.display(), "deleted to system trash"),
            Ok(Trashed::Folder(target)) => info!(path = %path.display(), trash = %target.display(), "deleted"),
            Err(e) => warn!(path = %path.display(), error = %e, "delete failed"),
        },
        Command::Manage(path) => match finalizer.move_to_managed(&path).await {
            Ok(target) => info!(path = %path.display(), to = %target.display(), "moved to managed storage"),
            Err(e) => warn!(path = %path.display(), error = %e, "manage failed"),
        },
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut worker = WorkerConfig::from_env();
    if let Some(dir) = cli.data_dir {
        worker.set_data_dir(dir);
    }
    if let Some(path) = cli.settings {
        worker.settings_path = path;
    }
    if let Some(ms) = cli.coalesce_ms {
        worker.coalesce_ms = ms;
    }
    worker.log_summary();

    let settings = SettingsFile::new(&worker.settings_path);
    let initial = settings.load_or_init(&worker.data_dir)?;
    let stream = settings.watch()?;

    let ctx = Arc::new(AutoscanContext::open(&worker, &initial.manager.storage_location)?);

    // Events → stdout
    let mut events = ctx.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to serialize event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // stdin → commands
    let finalizer = Finalizer::new(Arc::clone(&ctx));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_command(&line) {
                    Some(command) => run_command(&finalizer, command).await,
                    None => warn!(input = %line.trim(), "unrecognised command"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.notify_one();
        }
    });

    let mut reconciler = SettingsReconciler::new(Arc::clone(&ctx))
        .with_writer(Arc::new(settings.clone()))
        .with_coalesce(Duration::from_millis(worker.coalesce_ms));

    info!("autoscan-worker starting");
    reconciler.run(stream.subscribe(), shutdown).await;
    info!("autoscan-worker exited cleanly");
    Ok(())
}
