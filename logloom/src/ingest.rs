//! logloom-ingest - CLI tool to ingest conversation logs into the database
//!
//! One-shot ingestion of log files or directories through the same
//! pipeline the watch daemon and collector use. Exit codes:
//! 0 success, 2 invalid input, 3 duplicate, 4 parse failure,
//! 5 database error.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/logloom/data.db
//! - Logs: $XDG_STATE_HOME/logloom/logloom.log
//! - Config: $XDG_CONFIG_HOME/logloom/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use logloom_core::db::repo;
use logloom_core::parse::ParserRegistry;
use logloom_core::pipeline::{
    ingest_log_file, link_orphan_agents, IngestHints, IngestOutcome, IngestPolicy,
};
use logloom_core::{CancelToken, Config, Database, JobStatus, SourceType};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "logloom-ingest")]
#[command(about = "Ingest AI assistant conversation logs into the database")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap tenancy: create an organization and a workspace
    Setup {
        /// Organization name
        #[arg(long)]
        organization: String,
        /// Workspace name
        #[arg(long)]
        workspace: String,
    },
    /// Ingest one or more files (directories are globbed for *.jsonl)
    File {
        /// Target workspace id
        #[arg(long)]
        workspace_id: String,
        /// Files or directories to ingest
        paths: Vec<PathBuf>,
        /// Project name hint for conversations without a working directory
        #[arg(long)]
        project: Option<String>,
        /// Developer username to attribute conversations to
        #[arg(long)]
        developer: Option<String>,
        /// Fail on duplicate content instead of skipping
        #[arg(long)]
        no_skip_duplicates: bool,
        /// Force full reparses instead of incremental appends
        #[arg(long)]
        no_incremental: bool,
        /// Verbose per-file output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        logloom_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    match args.command {
        Command::Setup {
            organization,
            workspace,
        } => {
            let (org, ws) = db
                .transaction(|tx| {
                    let org = repo::create_organization(tx, &organization)?;
                    let ws = repo::create_workspace(tx, &org.id, &workspace)?;
                    Ok((org, ws))
                })
                .context("failed to create tenancy")?;
            println!("Organization: {} ({})", org.name, org.id);
            println!("Workspace:    {} ({})", ws.name, ws.id);
            Ok(ExitCode::SUCCESS)
        }

        Command::File {
            workspace_id,
            paths,
            project,
            developer,
            no_skip_duplicates,
            no_incremental,
            verbose,
        } => {
            if paths.is_empty() {
                eprintln!("error: no paths given");
                return Ok(ExitCode::from(2));
            }

            let files = collect_files(&paths)?;
            if files.is_empty() {
                eprintln!("error: no log files found under the given paths");
                return Ok(ExitCode::from(2));
            }

            let registry = ParserRegistry::with_builtins();
            let hints = IngestHints {
                project_name: project,
                developer_username: developer,
                tags: None,
                source_config_id: None,
                created_by: None,
            };
            let policy = IngestPolicy {
                skip_duplicates: !no_skip_duplicates,
                enable_incremental: !no_incremental,
                ..Default::default()
            };
            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                ctrlc::set_handler(move || {
                    eprintln!("\nCancelling...");
                    cancel.cancel();
                })
                .context("failed to set Ctrl+C handler")?;
            }

            let pb = ProgressBar::new(files.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );

            let mut succeeded = 0usize;
            let mut skipped = 0usize;
            let mut duplicates = 0usize;
            let mut failures: Vec<(PathBuf, logloom_core::Error)> = Vec::new();
            let mut messages_total = 0i64;
            let single_file = files.len() == 1;
            let mut single_outcome: Option<IngestOutcome> = None;

            for path in &files {
                pb.set_message(
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("...")
                        .to_string(),
                );

                match ingest_log_file(
                    &db,
                    &registry,
                    &workspace_id,
                    path,
                    &hints,
                    &policy,
                    SourceType::Cli,
                    &cancel,
                ) {
                    Ok(outcome) => {
                        match outcome.status {
                            JobStatus::Success => {
                                succeeded += 1;
                                messages_total += outcome.messages_added;
                            }
                            JobStatus::Duplicate => duplicates += 1,
                            JobStatus::Skipped => skipped += 1,
                            _ => {}
                        }
                        if verbose {
                            pb.println(format!(
                                "  {}: {} (+{} messages)",
                                path.display(),
                                outcome.status.as_str(),
                                outcome.messages_added
                            ));
                        }
                        if single_file {
                            single_outcome = Some(outcome);
                        }
                    }
                    Err(e) => {
                        if verbose {
                            pb.println(format!("  {}: failed: {}", path.display(), e));
                        }
                        failures.push((path.clone(), e));
                    }
                }
                pb.inc(1);

                if cancel.is_cancelled() {
                    break;
                }
            }
            pb.finish_and_clear();

            // Best-effort orphan linkage after a bulk ingest
            match link_orphan_agents(&db, &workspace_id, config.ingest.max_linking_attempts) {
                Ok(stats) if stats.linked > 0 => {
                    println!("Linked {} agent conversation(s) to parents", stats.linked);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Orphan linkage sweep failed"),
            }

            println!("\nIngest complete:");
            println!("  Succeeded:  {}", succeeded);
            println!("  Skipped:    {}", skipped);
            println!("  Duplicates: {}", duplicates);
            println!("  Failed:     {}", failures.len());
            println!("  Messages:   {}", messages_total);

            for (path, error) in &failures {
                eprintln!("  {}: {}", path.display(), error);
            }

            // Single-file invocations report the outcome in the exit code
            if single_file {
                if let Some((_, error)) = failures.first() {
                    return Ok(ExitCode::from(exit_code_for(error)));
                }
                if let Some(outcome) = single_outcome {
                    if outcome.status == JobStatus::Duplicate {
                        return Ok(ExitCode::from(3));
                    }
                }
                return Ok(ExitCode::SUCCESS);
            }

            if failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                let worst = failures
                    .iter()
                    .map(|(_, e)| exit_code_for(e))
                    .max()
                    .unwrap_or(1);
                Ok(ExitCode::from(worst))
            }
        }
    }
}

/// Expand directories into their *.jsonl files.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let pattern = path.join("**/*.jsonl");
            for entry in glob::glob(&pattern.to_string_lossy())
                .with_context(|| format!("bad glob for {}", path.display()))?
            {
                match entry {
                    Ok(p) => files.push(p),
                    Err(e) => tracing::warn!(error = %e, "Skipping unreadable glob entry"),
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Map error kinds onto the documented exit codes.
fn exit_code_for(error: &logloom_core::Error) -> u8 {
    match error.kind() {
        "invalid_argument" | "config" => 2,
        "duplicate_file" => 3,
        "parse_error" | "unknown_format" | "json" => 4,
        "database" => 5,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            exit_code_for(&logloom_core::Error::InvalidArgument("x".into())),
            2
        );
        assert_eq!(
            exit_code_for(&logloom_core::Error::DuplicateFile {
                hash: "h".into(),
                path: "p".into()
            }),
            3
        );
        assert_eq!(
            exit_code_for(&logloom_core::Error::UnknownFormat("x".into())),
            4
        );
        assert_eq!(
            exit_code_for(&logloom_core::Error::Parse {
                agent: "a".into(),
                message: "m".into()
            }),
            4
        );
        assert_eq!(exit_code_for(&logloom_core::Error::Cancelled), 1);
    }

    #[test]
    fn test_collect_files_dedup() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.jsonl");
        std::fs::write(&file, "{}\n").unwrap();

        let files =
            collect_files(&[dir.path().to_path_buf(), file.clone()]).unwrap();
        assert_eq!(files, vec![file]);
    }
}
