//! Watch daemon
//!
//! One long-lived daemon per watch configuration (one directory, one
//! workspace) with three threads of control:
//!
//! 1. **Observer**: debounced filesystem events enqueue work items for
//!    files with supported extensions.
//! 2. **Processor pool**: each work item drains through the ingestion
//!    pipeline under its own database handle. An in-memory set of
//!    content hashes short-circuits files already processed this run;
//!    persisted raw-log state handles cross-run continuity.
//! 3. **Retry thread**: failures back off exponentially
//!    (base · 3^(attempts−1)) and are dropped with a warning after
//!    `max_retries`; the failed ingestion job row remains.
//!
//! On startup the daemon reconciles: every file previously recorded
//! for the directory runs through the change detector and anything not
//! UNCHANGED is enqueued. Missing files are left alone.

use crate::config::WatchConfig;
use crate::db::{repo, Database};
use crate::error::{Error, Result};
use crate::hashing::{self, ChangeKind};
use crate::parse::ParserRegistry;
use crate::pipeline::{ingest_log_file, IngestHints, IngestPolicy};
use crate::types::{CancelToken, SourceType, WatchConfigRecord};
use chrono::{DateTime, Utc};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A file that failed to process and is waiting for retry.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub path: PathBuf,
    pub attempts: u32,
    pub last_error: String,
    pub next_retry: DateTime<Utc>,
}

/// Retry bookkeeping with exponential backoff.
///
/// Next-retry time is `base_interval · 3^(attempts−1)`; with the
/// default 300 s base that is 5 min, 15 min, 45 min.
pub struct RetryQueue {
    max_retries: u32,
    base_interval_secs: u64,
    queue: Mutex<HashMap<PathBuf, RetryEntry>>,
}

impl RetryQueue {
    pub fn new(max_retries: u32, base_interval_secs: u64) -> Self {
        Self {
            max_retries,
            base_interval_secs,
            queue: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, path: &Path, error: &str) {
        let mut queue = self.queue.lock().unwrap();
        let entry = queue.entry(path.to_path_buf()).or_insert_with(|| RetryEntry {
            path: path.to_path_buf(),
            attempts: 0,
            last_error: String::new(),
            next_retry: Utc::now(),
        });
        entry.attempts += 1;
        entry.last_error = error.to_string();
        entry.next_retry = Utc::now() + self.backoff(entry.attempts);

        tracing::info!(
            path = %path.display(),
            attempts = entry.attempts,
            max_retries = self.max_retries,
            "Added file to retry queue"
        );
    }

    fn backoff(&self, attempts: u32) -> chrono::Duration {
        let multiplier = 3u64.saturating_pow(attempts.saturating_sub(1));
        chrono::Duration::seconds((self.base_interval_secs * multiplier) as i64)
    }

    /// Entries whose retry time has come. Entries past the attempt cap
    /// are dropped with a warning.
    ///
    /// Returned entries stay in the queue so the attempt counter
    /// survives re-processing; their retry time is re-armed to avoid
    /// handing the same entry out again before the worker gets to it.
    /// Success removes the entry, another failure re-adds it with one
    /// more attempt.
    pub fn take_ready(&self) -> Vec<RetryEntry> {
        let now = Utc::now();
        let mut queue = self.queue.lock().unwrap();
        let mut ready = Vec::new();

        queue.retain(|path, entry| {
            if entry.attempts >= self.max_retries {
                tracing::warn!(
                    path = %path.display(),
                    attempts = entry.attempts,
                    last_error = %entry.last_error,
                    "Giving up on file after max retries"
                );
                return false;
            }
            if entry.next_retry <= now {
                ready.push(entry.clone());
                entry.next_retry = now + self.backoff(entry.attempts + 1);
            }
            true
        });

        ready
    }

    pub fn remove(&self, path: &Path) {
        self.queue.lock().unwrap().remove(path);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A running watch daemon.
pub struct WatchDaemon {
    shutdown: CancelToken,
    threads: Vec<JoinHandle<()>>,
    // Kept alive for the daemon's lifetime; dropping stops the observer
    _debouncer: Option<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>>,
}

/// Everything a daemon needs to run.
pub struct WatchDaemonSetup {
    pub record: WatchConfigRecord,
    pub db_path: PathBuf,
    pub tuning: WatchConfig,
    pub policy: IngestPolicy,
}

impl WatchDaemon {
    /// Start the observer, processor pool, and retry thread for one
    /// watch configuration.
    pub fn start(setup: WatchDaemonSetup) -> Result<Self> {
        let directory = PathBuf::from(&setup.record.directory);
        if !directory.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "watch directory does not exist: {}",
                directory.display()
            )));
        }

        let shutdown = CancelToken::new();
        let (work_tx, work_rx) = mpsc::channel::<PathBuf>();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let retry_queue = Arc::new(RetryQueue::new(
            setup.tuning.max_retries,
            setup.tuning.retry_base_seconds,
        ));
        let processed_hashes: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let extensions: Arc<Vec<String>> = Arc::new(setup.tuning.extensions.clone());
        let record = Arc::new(setup.record);

        // Startup reconciliation: re-examine every previously recorded
        // file and enqueue anything the detector says changed.
        {
            let db = Database::open(&setup.db_path)?;
            let changed = reconcile_directory(&db, &record.workspace_id, &directory)?;
            for path in changed {
                let _ = work_tx.send(path);
            }
        }

        // Observer thread (owned by the debouncer)
        let observer_tx = work_tx.clone();
        let observer_extensions = extensions.clone();
        let mut debouncer = new_debouncer(
            Duration::from_secs_f64(setup.tuning.debounce_seconds),
            move |result: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| match result {
                Ok(events) => {
                    for event in events {
                        if event.kind != DebouncedEventKind::Any {
                            continue;
                        }
                        if !has_supported_extension(&event.path, &observer_extensions) {
                            continue;
                        }
                        let _ = observer_tx.send(event.path.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Filesystem watch error");
                }
            },
        )
        .map_err(|e| Error::Internal(format!("failed to create watcher: {}", e)))?;
        debouncer
            .watcher()
            .watch(&directory, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("failed to watch {}: {}", directory.display(), e)))?;

        tracing::info!(
            directory = %directory.display(),
            workspace_id = %record.workspace_id,
            "Watch daemon started"
        );

        // Processor pool
        let mut threads = Vec::new();
        for worker_index in 0..setup.tuning.processor_threads.max(1) {
            let work_rx = work_rx.clone();
            let shutdown = shutdown.clone();
            let retry_queue = retry_queue.clone();
            let processed_hashes = processed_hashes.clone();
            let record = record.clone();
            let db_path = setup.db_path.clone();
            let policy = setup.policy.clone();

            threads.push(std::thread::spawn(move || {
                let db = match Database::open(&db_path) {
                    Ok(db) => db,
                    Err(e) => {
                        tracing::error!(error = %e, "Processor could not open database");
                        return;
                    }
                };
                let registry = ParserRegistry::with_builtins();

                loop {
                    let received = {
                        let rx = work_rx.lock().unwrap();
                        rx.recv_timeout(Duration::from_secs(1))
                    };
                    match received {
                        Ok(path) => {
                            process_work_item(
                                &db,
                                &registry,
                                &record,
                                &path,
                                &policy,
                                &processed_hashes,
                                &retry_queue,
                                &shutdown,
                            );
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if shutdown.is_cancelled() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(worker_index, "Processor thread exiting");
            }));
        }

        // Retry thread
        {
            let shutdown = shutdown.clone();
            let retry_queue = retry_queue.clone();
            let retry_tx: Sender<PathBuf> = work_tx.clone();
            threads.push(std::thread::spawn(move || {
                while !shutdown.is_cancelled() {
                    for entry in retry_queue.take_ready() {
                        tracing::info!(
                            path = %entry.path.display(),
                            attempt = entry.attempts + 1,
                            "Retrying failed file"
                        );
                        let _ = retry_tx.send(entry.path);
                    }
                    // Check shutdown frequently; backoff windows are long
                    for _ in 0..10 {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }));
        }

        drop(work_tx);

        Ok(Self {
            shutdown,
            threads,
            _debouncer: Some(debouncer),
        })
    }

    /// Stop the observer, let in-flight work finish, join all threads.
    pub fn stop(mut self) {
        self.shutdown.cancel();
        // Dropping the debouncer stops the observer
        self._debouncer = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("Watch daemon stopped");
    }

    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }
}

fn has_supported_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_lowercase());
    extensions.iter().any(|e| *e == dotted)
}

#[allow(clippy::too_many_arguments)]
fn process_work_item(
    db: &Database,
    registry: &ParserRegistry,
    record: &WatchConfigRecord,
    path: &Path,
    policy: &IngestPolicy,
    processed_hashes: &Mutex<HashSet<String>>,
    retry_queue: &RetryQueue,
    shutdown: &CancelToken,
) {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "File vanished before processing");
        return;
    }

    // In-memory dedup for this run; additions are idempotent
    match hashing::content_hash(path) {
        Ok(hash) => {
            let mut seen = processed_hashes.lock().unwrap();
            if !seen.insert(hash) {
                tracing::debug!(path = %path.display(), "Already processed in this run");
                return;
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to hash file");
            return;
        }
    }

    let hints = IngestHints {
        project_name: record.project_name.clone(),
        developer_username: record.developer_username.clone(),
        tags: None,
        source_config_id: Some(record.id.clone()),
        created_by: None,
    };

    match ingest_log_file(
        db,
        registry,
        &record.workspace_id,
        path,
        &hints,
        policy,
        SourceType::Watch,
        shutdown,
    ) {
        Ok(outcome) => {
            tracing::debug!(
                path = %path.display(),
                status = outcome.status.as_str(),
                messages = outcome.messages_added,
                "Processed watch item"
            );
            retry_queue.remove(path);
        }
        Err(e) if e.is_transient() => {
            // Allow the retry to re-hash and re-ingest
            if let Ok(hash) = hashing::content_hash(path) {
                processed_hashes.lock().unwrap().remove(&hash);
            }
            retry_queue.add(path, &e.to_string());
        }
        Err(e) => {
            // Permanent failures (parse errors, unknown formats) are not
            // retried; the failed job row records the diagnosis.
            tracing::warn!(path = %path.display(), kind = e.kind(), error = %e, "Ingest failed permanently");
        }
    }
}

/// Run the change detector over every raw log recorded under the
/// directory and return the paths that need re-ingest. Missing files
/// are skipped; their raw logs are not marked deleted. Log files on
/// disk with no raw log at all (created while the daemon was down)
/// are enqueued too.
pub fn reconcile_directory(
    db: &Database,
    workspace_id: &str,
    directory: &Path,
) -> Result<Vec<PathBuf>> {
    let raw_logs = db.with_conn(|conn| {
        repo::raw_logs_under_directory(conn, workspace_id, &directory.to_string_lossy())
    })?;

    let mut changed = Vec::new();
    let mut known: HashSet<PathBuf> = HashSet::new();
    for raw in raw_logs {
        let path = PathBuf::from(&raw.file_path);
        known.insert(path.clone());
        if !path.exists() {
            continue;
        }
        let kind = hashing::detect_change(
            &path,
            raw.last_processed_offset,
            raw.file_size_bytes,
            raw.partial_hash.as_deref(),
        )?;
        if kind != ChangeKind::Unchanged {
            tracing::info!(
                path = %path.display(),
                change = kind.as_str(),
                "Startup reconciliation found changed file"
            );
            changed.push(path);
        }
    }

    // Files that appeared while no daemon was watching
    let pattern = directory.join("**/*.jsonl");
    if let Ok(entries) = glob::glob(&pattern.to_string_lossy()) {
        for path in entries.flatten() {
            if !known.contains(&path) {
                tracing::info!(
                    path = %path.display(),
                    "Startup reconciliation found new file"
                );
                changed.push(path);
            }
        }
    }

    Ok(changed)
}

// ============================================
// Daemon manager
// ============================================

/// Process-wide table mapping watch config ids to running daemons.
///
/// Owns `is_active` on the watch config rows; nothing else mutates it.
pub struct DaemonManager {
    db_path: PathBuf,
    tuning: WatchConfig,
    daemons: Mutex<HashMap<String, WatchDaemon>>,
}

impl DaemonManager {
    pub fn new(db_path: PathBuf, tuning: WatchConfig) -> Self {
        Self {
            db_path,
            tuning,
            daemons: Mutex::new(HashMap::new()),
        }
    }

    /// Start a daemon for the config. Idempotent: an already-running
    /// daemon is left alone.
    pub fn start_daemon(&self, record: &WatchConfigRecord) -> Result<()> {
        let mut daemons = self.daemons.lock().unwrap();
        if daemons.contains_key(&record.id) {
            tracing::debug!(watch_config_id = %record.id, "Daemon already running");
            return Ok(());
        }

        let daemon = WatchDaemon::start(WatchDaemonSetup {
            record: record.clone(),
            db_path: self.db_path.clone(),
            tuning: self.tuning.clone(),
            policy: IngestPolicy::default(),
        })?;
        daemons.insert(record.id.clone(), daemon);

        let db = Database::open(&self.db_path)?;
        db.transaction(|tx| repo::set_watch_config_active(tx, &record.id, true))?;
        Ok(())
    }

    /// Stop and remove a daemon. Unknown ids are a no-op.
    pub fn stop_daemon(&self, watch_config_id: &str) -> Result<()> {
        let daemon = self.daemons.lock().unwrap().remove(watch_config_id);
        if let Some(daemon) = daemon {
            daemon.stop();
            let db = Database::open(&self.db_path)?;
            db.transaction(|tx| repo::set_watch_config_active(tx, watch_config_id, false))?;
        }
        Ok(())
    }

    pub fn running_daemons(&self) -> Vec<String> {
        self.daemons.lock().unwrap().keys().cloned().collect()
    }

    /// Stop everything (process shutdown).
    pub fn stop_all(&self) {
        let mut daemons = self.daemons.lock().unwrap();
        for (id, daemon) in daemons.drain() {
            tracing::info!(watch_config_id = %id, "Stopping daemon");
            daemon.stop();
        }
    }
}
