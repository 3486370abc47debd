//! logloom-watch - directory watch daemon
//!
//! Watches a directory for conversation log changes and ingests them
//! automatically. SIGINT/SIGTERM shut the daemon down cleanly: the
//! observer stops, in-flight work finishes, and the process exits 0.

use anyhow::{Context, Result};
use clap::Parser;
use logloom_core::db::repo;
use logloom_core::watch::DaemonManager;
use logloom_core::{new_id, Config, Database, WatchConfigRecord};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "logloom-watch")]
#[command(about = "Watch a directory and ingest conversation logs automatically")]
#[command(version)]
struct Args {
    /// Target workspace id
    #[arg(long)]
    workspace_id: String,

    /// Directory to watch
    #[arg(long)]
    directory: PathBuf,

    /// Project name hint for ingested conversations
    #[arg(long)]
    project: Option<String>,

    /// Developer username to attribute conversations to
    #[arg(long)]
    developer: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        logloom_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("logloom-watch starting");

    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let directory = args
        .directory
        .canonicalize()
        .with_context(|| format!("directory does not exist: {}", args.directory.display()))?;

    // Reuse the watch config row for this (workspace, directory) if one
    // exists; otherwise create it.
    let record = db
        .transaction(|tx| {
            let existing = repo::list_watch_configs(tx, &args.workspace_id)?
                .into_iter()
                .find(|c| c.directory == directory.to_string_lossy());
            if let Some(existing) = existing {
                return Ok(existing);
            }
            let record = WatchConfigRecord {
                id: new_id(),
                workspace_id: args.workspace_id.clone(),
                directory: directory.to_string_lossy().to_string(),
                project_name: args.project.clone(),
                developer_username: args.developer.clone(),
                is_active: false,
                created_at: chrono::Utc::now(),
            };
            repo::insert_watch_config(tx, &record)?;
            Ok(record)
        })
        .context("failed to resolve watch config")?;

    let manager = DaemonManager::new(db_path, config.watch.clone());
    manager
        .start_daemon(&record)
        .context("failed to start watch daemon")?;

    println!(
        "Watching {} (workspace {}). Press Ctrl+C to stop.",
        directory.display(),
        args.workspace_id
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down...");
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to set Ctrl+C handler")?;
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    manager.stop_all();
    println!("Watch daemon stopped.");
    tracing::info!("logloom-watch stopped");

    Ok(())
}
