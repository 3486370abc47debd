//! Ingestion pipeline
//!
//! Single entry point for every log-file ingest: dedup, change
//! detection, parser selection (full vs incremental), persistence, and
//! deferred hierarchy linkage share one code path so the CLI, upload
//! surface, and watch daemon all behave identically.
//!
//! Each call runs its stages inside one database transaction; a failed
//! stage rolls everything back and a **failed** job row is written in a
//! fresh transaction so the audit trail survives.

mod job;

pub use job::{JobTracker, StageMetrics};

use crate::db::{repo, Database};
use crate::error::{Error, Result};
use crate::hashing::{self, ChangeKind};
use crate::parse::{
    IncrementalResult, ParsedConversation, ParsedMessage, ParserRegistry,
};
use crate::types::*;
use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;

/// Replace-vs-skip behavior for re-ingests of a known file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Keep existing messages; only appends apply
    Skip,
    /// Drop and reinsert all conversation content
    Replace,
}

/// Per-call ingest policy.
#[derive(Debug, Clone)]
pub struct IngestPolicy {
    /// Close duplicate-content ingests as `duplicate` rather than failing
    pub skip_duplicates: bool,
    pub enable_incremental: bool,
    pub update_mode: UpdateMode,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            skip_duplicates: true,
            enable_incremental: true,
            update_mode: UpdateMode::Skip,
        }
    }
}

/// Caller-provided context for an ingest.
#[derive(Debug, Clone, Default)]
pub struct IngestHints {
    pub project_name: Option<String>,
    pub developer_username: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub source_config_id: Option<String>,
    pub created_by: Option<String>,
}

/// Unified ingestion result.
#[derive(Debug)]
pub struct IngestOutcome {
    pub status: JobStatus,
    pub job_id: String,
    pub conversation_id: Option<String>,
    pub incremental: bool,
    pub parser_name: Option<String>,
    pub change_kind: Option<ChangeKind>,
    pub messages_added: i64,
}

/// Ingest a single log file with dedup + change detection + parser
/// selection. See module docs for the stage breakdown.
#[allow(clippy::too_many_arguments)]
pub fn ingest_log_file(
    db: &Database,
    registry: &ParserRegistry,
    workspace_id: &str,
    file_path: &Path,
    hints: &IngestHints,
    policy: &IngestPolicy,
    source_type: SourceType,
    cancel: &CancelToken,
) -> Result<IngestOutcome> {
    let mut tracker = JobTracker::open(
        workspace_id,
        source_type,
        Some(&file_path.to_string_lossy()),
        hints.source_config_id.as_deref(),
        hints.created_by.as_deref(),
    );
    let mut metrics = StageMetrics::new();

    let result = db.transaction(|tx| {
        run_stages(
            tx,
            registry,
            workspace_id,
            file_path,
            hints,
            policy,
            cancel,
            &mut tracker,
            &mut metrics,
        )
    });

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // The ingest transaction rolled back; persist the failed job
            // in its own transaction so diagnostics survive.
            let job = tracker.finish(JobStatus::Failed, None, None, 0, &metrics, Some(&e));
            if let Err(write_err) = db.transaction(|tx| repo::insert_ingestion_job(tx, &job)) {
                tracing::warn!(error = %write_err, "Failed to persist failed ingestion job");
            }
            tracing::warn!(
                path = %file_path.display(),
                kind = e.kind(),
                error = %e,
                "Ingest failed"
            );
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    tx: &Connection,
    registry: &ParserRegistry,
    workspace_id: &str,
    file_path: &Path,
    hints: &IngestHints,
    policy: &IngestPolicy,
    cancel: &CancelToken,
    tracker: &mut JobTracker,
    metrics: &mut StageMetrics,
) -> Result<IngestOutcome> {
    cancel.check()?;
    let path_str = file_path.to_string_lossy().to_string();

    // Stage: content-level dedup
    metrics.start_stage("deduplication_check_ms");
    let file_hash = hashing::content_hash(file_path)?;
    let existing_by_hash = repo::raw_log_by_hash(tx, workspace_id, &file_hash)?;
    metrics.end_stage("deduplication_check_ms");

    if let Some(existing) = existing_by_hash {
        if policy.skip_duplicates {
            let job = tracker.finish(
                JobStatus::Duplicate,
                Some(&existing.conversation_id),
                Some(&existing.id),
                0,
                metrics,
                None,
            );
            repo::insert_ingestion_job(tx, &job)?;
            tracing::debug!(path = %path_str, hash = %&file_hash[..8], "Duplicate file skipped");
            return Ok(IngestOutcome {
                status: JobStatus::Duplicate,
                job_id: tracker.job_id.clone(),
                conversation_id: Some(existing.conversation_id),
                incremental: false,
                parser_name: None,
                change_kind: None,
                messages_added: 0,
            });
        }
        return Err(Error::DuplicateFile {
            hash: file_hash,
            path: path_str,
        });
    }

    cancel.check()?;

    // Stage: change classification (only when this path was seen before)
    let existing_raw = repo::raw_log_by_path(tx, workspace_id, &path_str)?;
    let mut change_kind: Option<ChangeKind> = None;

    if let Some(raw) = &existing_raw {
        if policy.enable_incremental {
            let kind = hashing::detect_change(
                file_path,
                raw.last_processed_offset,
                raw.file_size_bytes,
                raw.partial_hash.as_deref(),
            )?;
            change_kind = Some(kind);
            metrics.set("parse_change_type", serde_json::json!(kind.as_str()));

            match kind {
                ChangeKind::Unchanged => {
                    let job = tracker.finish(
                        JobStatus::Skipped,
                        Some(&raw.conversation_id),
                        Some(&raw.id),
                        0,
                        metrics,
                        None,
                    );
                    repo::insert_ingestion_job(tx, &job)?;
                    return Ok(IngestOutcome {
                        status: JobStatus::Skipped,
                        job_id: tracker.job_id.clone(),
                        conversation_id: Some(raw.conversation_id.clone()),
                        incremental: false,
                        parser_name: None,
                        change_kind,
                        messages_added: 0,
                    });
                }
                ChangeKind::Append => {
                    // The incremental parser must match the parser that
                    // originally produced this raw log; a replace-mode
                    // policy forces the full path instead.
                    let parser = if policy.update_mode == UpdateMode::Skip {
                        registry.find_incremental_parser(file_path).filter(|p| {
                            raw.agent_type
                                .as_deref()
                                .map(|stored| stored == p.info().name)
                                .unwrap_or(true)
                        })
                    } else {
                        None
                    };

                    if let Some(parser) = parser {
                        metrics.start_stage("parse_ms");
                        let inc = parser.parse_incremental(
                            file_path,
                            raw.last_processed_offset,
                            raw.last_processed_line,
                        )?;
                        metrics.end_stage("parse_ms");

                        // A clean append must leave the stored prefix hash
                        // recomputable; disagreement downgrades to a full
                        // reparse with replace semantics.
                        let prefix_ok = match raw.partial_hash.as_deref() {
                            Some(stored) => {
                                hashing::partial_hash(file_path, raw.last_processed_offset)?
                                    == stored
                            }
                            None => true,
                        };

                        if prefix_ok {
                            return apply_incremental(
                                tx,
                                raw,
                                inc,
                                parser.info().name.clone(),
                                tracker,
                                metrics,
                                cancel,
                            );
                        }
                        tracing::warn!(
                            path = %path_str,
                            "Partial hash mismatch after append; forcing full reparse"
                        );
                        change_kind = Some(ChangeKind::Rewrite);
                    }
                    // No matching incremental parser: fall through to full
                }
                // Full reparse with replace semantics below
                ChangeKind::Truncate | ChangeKind::Rewrite => {}
            }
        }
    }

    cancel.check()?;

    // Stage: full parse
    metrics.start_stage("parse_ms");
    let report = registry.parse_with_report(file_path)?;
    metrics.end_stage("parse_ms");

    metrics.set("parse_method", serde_json::json!(report.parse_method));
    metrics.set("parser_name", serde_json::json!(report.parser_name));
    metrics.set("parser_version", serde_json::json!(report.parser_version));
    metrics.set(
        "parse_messages_count",
        serde_json::json!(report.conversation.messages.len()),
    );
    if !report.conversation.warnings.is_empty() {
        metrics.set(
            "parse_warnings",
            serde_json::json!(report.conversation.warnings),
        );
        metrics.set(
            "parse_warning_count",
            serde_json::json!(report.conversation.warnings.len()),
        );
    }

    // Stage: metadata-only short circuit
    if report.conversation.is_metadata_only() {
        let job = tracker.finish(JobStatus::Skipped, None, None, 0, metrics, None);
        repo::insert_ingestion_job(tx, &job)?;
        tracing::debug!(path = %path_str, "Metadata-only file skipped");
        return Ok(IngestOutcome {
            status: JobStatus::Skipped,
            job_id: tracker.job_id.clone(),
            conversation_id: None,
            incremental: false,
            parser_name: Some(report.parser_name),
            change_kind,
            messages_added: 0,
        });
    }

    cancel.check()?;

    // Stage: persist
    metrics.start_stage("persist_ms");
    let parsed = &report.conversation;

    let project = match parsed
        .working_directory
        .as_deref()
        .or(hints.project_name.as_deref())
    {
        Some(directory) => Some(repo::get_or_create_project(tx, workspace_id, directory)?),
        None => None,
    };
    let developer = match hints.developer_username.as_deref() {
        Some(username) => Some(repo::get_or_create_developer(tx, workspace_id, username)?),
        None => None,
    };

    let (conversation_id, raw_log_id) = match &existing_raw {
        Some(raw) => {
            // A full reparse of a known path always replaces: reaching
            // this point means the content changed (or no incremental
            // parser matched), and appending a full parse would
            // duplicate every earlier message.
            repo::delete_conversation_content(tx, &raw.conversation_id)?;
            metrics.set("update_mode", serde_json::json!("replace"));
            (raw.conversation_id.clone(), raw.id.clone())
        }
        None => {
            let conversation = conversation_from_parsed(
                workspace_id,
                parsed,
                project.as_ref().map(|p| p.id.as_str()),
                developer.as_ref().map(|d| d.id.as_str()),
                hints.tags.clone(),
            );
            repo::insert_conversation(tx, &conversation)?;

            let raw_log = RawLog {
                id: new_id(),
                workspace_id: workspace_id.to_string(),
                conversation_id: conversation.id.clone(),
                file_path: path_str.clone(),
                file_hash: file_hash.clone(),
                last_processed_offset: 0,
                last_processed_line: 0,
                file_size_bytes: 0,
                partial_hash: None,
                agent_type: Some(report.parser_name.clone()),
                ingested_at: Utc::now(),
            };
            repo::insert_raw_log(tx, &raw_log)?;
            (conversation.id, raw_log.id)
        }
    };

    // One default epoch; all messages attach to it unless the parser
    // produced multiple (neither built-in dialect does).
    let epoch = repo::get_or_create_default_epoch(tx, &conversation_id, parsed.start_time)?;

    let base_sequence = repo::max_message_sequence(tx, &conversation_id)?;
    let messages_added = insert_parsed_messages(
        tx,
        &conversation_id,
        &epoch.id,
        base_sequence,
        &parsed.messages,
    )?;

    for msg in &parsed.messages {
        for change in &msg.code_changes {
            repo::insert_file_touched(
                tx,
                &conversation_id,
                &change.file_path,
                change.change_type.as_str(),
            )?;
        }
    }

    let file_size = std::fs::metadata(file_path)?.len();
    let final_partial = hashing::partial_hash(file_path, file_size)?;
    repo::update_raw_log_state(
        tx,
        &raw_log_id,
        file_size,
        count_file_lines(file_path)?,
        file_size,
        &final_partial,
        &file_hash,
    )?;

    repo::update_conversation_counts(tx, &conversation_id)?;
    if let Some(project) = &project {
        repo::touch_project_activity(tx, &project.id)?;
    }
    metrics.end_stage("persist_ms");

    // Stage: deferred hierarchy linkage. Missing parents stay orphans;
    // the attempt counter only moves in the dedicated sweep.
    if let Some(parent_session) = parsed.parent_session_id.as_deref() {
        if let Some(parent) =
            repo::get_conversation_by_session_id(tx, workspace_id, parent_session)?
        {
            if parent.id != conversation_id {
                repo::set_conversation_parent(tx, &conversation_id, &parent.id)?;
            }
        }
    }

    cancel.check()?;

    let job = tracker.finish(
        JobStatus::Success,
        Some(&conversation_id),
        Some(&raw_log_id),
        messages_added,
        metrics,
        None,
    );
    repo::insert_ingestion_job(tx, &job)?;

    tracing::info!(
        path = %path_str,
        conversation_id = %conversation_id,
        messages = messages_added,
        parser = %report.parser_name,
        "Ingested log file"
    );

    Ok(IngestOutcome {
        status: JobStatus::Success,
        job_id: tracker.job_id.clone(),
        conversation_id: Some(conversation_id),
        incremental: false,
        parser_name: Some(report.parser_name),
        change_kind,
        messages_added,
    })
}

/// Apply an incremental parse: append new messages only, advance the
/// raw-log cursor, and recompute counts.
///
/// The stored `file_hash` is left at its first-ingest value. A later
/// re-ingest of the unchanged appended file then misses the dedup
/// check and classifies as UNCHANGED instead of duplicate.
fn apply_incremental(
    tx: &Connection,
    raw: &RawLog,
    inc: IncrementalResult,
    parser_name: String,
    tracker: &mut JobTracker,
    metrics: &mut StageMetrics,
    cancel: &CancelToken,
) -> Result<IngestOutcome> {
    cancel.check()?;
    tracker.incremental = true;
    metrics.set("parse_method", serde_json::json!("incremental"));
    metrics.set("parser_name", serde_json::json!(parser_name));
    metrics.set(
        "parse_messages_count",
        serde_json::json!(inc.new_messages.len()),
    );
    if !inc.warnings.is_empty() {
        metrics.set("parse_warnings", serde_json::json!(inc.warnings));
    }

    let conversation_id = raw.conversation_id.clone();
    let epoch = repo::get_or_create_default_epoch(tx, &conversation_id, Utc::now())?;
    let base_sequence = repo::max_message_sequence(tx, &conversation_id)?;
    let messages_added = insert_parsed_messages(
        tx,
        &conversation_id,
        &epoch.id,
        base_sequence,
        &inc.new_messages,
    )?;

    for msg in &inc.new_messages {
        for change in &msg.code_changes {
            repo::insert_file_touched(
                tx,
                &conversation_id,
                &change.file_path,
                change.change_type.as_str(),
            )?;
        }
    }

    repo::update_raw_log_state(
        tx,
        &raw.id,
        inc.last_processed_offset,
        inc.last_processed_line,
        inc.file_size_bytes,
        &inc.partial_hash,
        &raw.file_hash,
    )?;
    repo::update_conversation_counts(tx, &conversation_id)?;

    let job = tracker.finish(
        JobStatus::Success,
        Some(&conversation_id),
        Some(&raw.id),
        messages_added,
        metrics,
        None,
    );
    repo::insert_ingestion_job(tx, &job)?;

    tracing::info!(
        conversation_id = %conversation_id,
        messages = messages_added,
        "Applied incremental ingest"
    );

    Ok(IngestOutcome {
        status: JobStatus::Success,
        job_id: tracker.job_id.clone(),
        conversation_id: Some(conversation_id),
        incremental: true,
        parser_name: Some(parser_name),
        change_kind: Some(ChangeKind::Append),
        messages_added,
    })
}

/// Insert parsed messages with strictly monotonic sequences starting
/// after `base_sequence`.
fn insert_parsed_messages(
    tx: &Connection,
    conversation_id: &str,
    epoch_id: &str,
    base_sequence: i64,
    messages: &[ParsedMessage],
) -> Result<i64> {
    let mut added = 0i64;
    for (i, pm) in messages.iter().enumerate() {
        let tool_results: Vec<serde_json::Value> = pm
            .tool_calls
            .iter()
            .filter(|c| c.result.is_some())
            .map(|c| {
                serde_json::json!({
                    "tool_use_id": c.tool_use_id,
                    "result": c.result,
                    "success": c.success,
                })
            })
            .collect();

        let row = Message {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            epoch_id: epoch_id.to_string(),
            sequence: base_sequence + 1 + i as i64,
            role: pm.role,
            content: pm.content.clone(),
            timestamp: pm.timestamp,
            model: pm.model.clone(),
            tool_calls: serde_json::to_value(&pm.tool_calls)?,
            tool_results: serde_json::Value::Array(tool_results),
            code_changes: serde_json::to_value(&pm.code_changes)?,
            thinking_content: pm.thinking_content.clone(),
            tokens_in: pm.token_usage.as_ref().map(|u| u.input_tokens),
            tokens_out: pm.token_usage.as_ref().map(|u| u.output_tokens),
            raw_data: pm.raw_data.clone(),
        };
        repo::insert_message(tx, &row)?;
        added += 1;
    }
    Ok(added)
}

fn conversation_from_parsed(
    workspace_id: &str,
    parsed: &ParsedConversation,
    project_id: Option<&str>,
    developer_id: Option<&str>,
    tags: Option<serde_json::Value>,
) -> Conversation {
    let mut agent_metadata = serde_json::json!({});
    if let Some(parent) = &parsed.parent_session_id {
        agent_metadata["parent_session_id"] = serde_json::json!(parent);
    }

    Conversation {
        id: new_id(),
        workspace_id: workspace_id.to_string(),
        project_id: project_id.map(ToString::to_string),
        developer_id: developer_id.map(ToString::to_string),
        agent_type: parsed.agent_type.clone(),
        agent_version: parsed.agent_version.clone(),
        start_time: parsed.start_time,
        end_time: parsed.end_time,
        status: ConversationStatus::Open,
        success: None,
        conversation_type: parsed.conversation_type,
        parent_conversation_id: None,
        collector_session_id: None,
        collector_id: None,
        last_event_sequence: 0,
        message_count: 0,
        epoch_count: 0,
        files_count: 0,
        agent_metadata,
        extra_data: serde_json::json!({
            "session_id": parsed.session_id,
            "working_directory": parsed.working_directory,
            "git_branch": parsed.git_branch,
        }),
        tags: tags.unwrap_or_else(|| serde_json::json!({})),
        plans: serde_json::to_value(&parsed.plans).unwrap_or_else(|_| serde_json::json!([])),
    }
}

fn count_file_lines(path: &Path) -> Result<u64> {
    use std::io::BufRead;
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(reader.lines().count() as u64)
}

// ============================================
// Orphan linkage sweep
// ============================================

/// Result of one orphan linkage sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OrphanSweepStats {
    pub linked: usize,
    pub attempted: usize,
    pub frozen: usize,
}

/// Walk agent conversations with a null parent in one workspace and
/// try to resolve their hinted parent session ids.
///
/// - Parent found: the link is set and the attempt counter is left
///   untouched.
/// - Parent missing: `_linking_attempts` increments; once it reaches
///   `max_attempts` the agent is skipped in every future sweep.
/// - Links never cross workspaces.
pub fn link_orphan_agents(
    db: &Database,
    workspace_id: &str,
    max_attempts: i64,
) -> Result<OrphanSweepStats> {
    db.transaction(|tx| {
        let mut stats = OrphanSweepStats::default();

        for orphan in repo::list_orphan_agents(tx, workspace_id)? {
            let Some(parent_session) = orphan.parent_session_hint().map(ToString::to_string)
            else {
                continue;
            };

            let attempts = orphan.linking_attempts();
            if attempts >= max_attempts {
                stats.frozen += 1;
                continue;
            }

            let parent = repo::get_conversation_by_session_id(tx, workspace_id, &parent_session)?
                .or(repo::get_conversation_by_collector_session(tx, &parent_session)?
                    .filter(|c| c.workspace_id == workspace_id));

            match parent {
                Some(parent) if parent.id != orphan.id => {
                    repo::set_conversation_parent(tx, &orphan.id, &parent.id)?;
                    stats.linked += 1;
                    tracing::info!(
                        agent = %orphan.id,
                        parent = %parent.id,
                        "Linked orphan agent to parent"
                    );
                }
                _ => {
                    let mut metadata = orphan.agent_metadata.clone();
                    metadata["_linking_attempts"] = serde_json::json!(attempts + 1);
                    repo::update_agent_metadata(tx, &orphan.id, &metadata)?;
                    stats.attempted += 1;
                }
            }
        }

        Ok(stats)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn seed_workspace(db: &Database) -> String {
        db.transaction(|tx| {
            let org = repo::create_organization(tx, "acme")?;
            let ws = repo::create_workspace(tx, &org.id, "dev")?;
            Ok(ws.id)
        })
        .unwrap()
    }

    fn claude_line(session: &str, ts: &str, role: &str, text: &str) -> String {
        format!(
            r#"{{"type":"{role}","sessionId":"{session}","version":"2.0.14","cwd":"/home/dev/proj","timestamp":"{ts}","message":{{"role":"{role}","content":"{text}"}}}}"#
        )
    }

    fn write_log(dir: &TempDir, name: &str, lines: &[String]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    fn ingest(
        db: &Database,
        registry: &ParserRegistry,
        ws: &str,
        path: &Path,
    ) -> Result<IngestOutcome> {
        ingest_log_file(
            db,
            registry,
            ws,
            path,
            &IngestHints::default(),
            &IngestPolicy::default(),
            SourceType::Cli,
            &CancelToken::new(),
        )
    }

    #[test]
    fn test_first_ingest_creates_everything() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[
                claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "hello"),
                claude_line("sess-1", "2025-01-01T10:00:05Z", "assistant", "hi"),
            ],
        );

        let outcome = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.messages_added, 2);
        assert!(!outcome.incremental);

        let conv_id = outcome.conversation_id.unwrap();
        let conv = db
            .with_conn(|c| repo::get_conversation(c, &ws, &conv_id))
            .unwrap()
            .unwrap();
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.epoch_count, 1);
        assert!(conv.project_id.is_some());

        // Raw log cursor points at EOF
        let raw = db
            .with_conn(|c| repo::raw_log_by_path(c, &ws, &path.to_string_lossy()))
            .unwrap()
            .unwrap();
        assert_eq!(raw.last_processed_offset, std::fs::metadata(&path).unwrap().len());
        assert_eq!(raw.agent_type.as_deref(), Some("claude-code"));
    }

    #[test]
    fn test_dedup_idempotency() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let lines = vec![claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "hello")];
        let path = write_log(&dir, "s.jsonl", &lines);

        let first = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(first.status, JobStatus::Success);

        // Same content at a different path: duplicate by hash
        let copy = write_log(&dir, "copy.jsonl", &lines);
        let second = ingest(&db, &registry, &ws, &copy).unwrap();
        assert_eq!(second.status, JobStatus::Duplicate);
        assert_eq!(second.conversation_id, first.conversation_id);

        let third = ingest(&db, &registry, &ws, &copy).unwrap();
        assert_eq!(third.status, JobStatus::Duplicate);

        // Exactly one conversation, one raw log, three job rows
        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(
            jobs.iter().filter(|j| j.status == JobStatus::Success).count(),
            1
        );
        let convs: i64 = db
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
                    .map_err(Error::from)
            })
            .unwrap();
        assert_eq!(convs, 1);
    }

    #[test]
    fn test_duplicate_fails_when_policy_off() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let lines = vec![claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "hello")];
        let path = write_log(&dir, "s.jsonl", &lines);
        ingest(&db, &registry, &ws, &path).unwrap();

        let copy = write_log(&dir, "copy.jsonl", &lines);
        let policy = IngestPolicy {
            skip_duplicates: false,
            ..Default::default()
        };
        let err = ingest_log_file(
            &db,
            &registry,
            &ws,
            &copy,
            &IngestHints::default(),
            &policy,
            SourceType::Cli,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateFile { .. }));

        // Failed job row persisted despite rollback
        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        assert!(jobs.iter().any(|j| j.status == JobStatus::Failed
            && j.error_kind.as_deref() == Some("duplicate_file")));
    }

    #[test]
    fn test_unchanged_file_skipped() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "hello")],
        );

        ingest(&db, &registry, &ws, &path).unwrap();
        let second = ingest(&db, &registry, &ws, &path).unwrap();
        // Re-ingest of the identical path short-circuits on the content
        // hash before change detection runs.
        assert_eq!(second.status, JobStatus::Duplicate);
    }

    #[test]
    fn test_append_resume_incremental() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[
                claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "one"),
                claude_line("sess-1", "2025-01-01T10:00:05Z", "assistant", "two"),
            ],
        );

        let first = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(first.messages_added, 2);

        // Append a third message
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            f,
            "{}",
            claude_line("sess-1", "2025-01-01T10:00:10Z", "user", "three")
        )
        .unwrap();

        let second = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(second.status, JobStatus::Success);
        assert!(second.incremental);
        assert_eq!(second.change_kind, Some(ChangeKind::Append));
        assert_eq!(second.messages_added, 1);
        assert_eq!(second.conversation_id, first.conversation_id);

        // One conversation, three messages, sequences strictly monotonic
        let conv_id = second.conversation_id.unwrap();
        let messages = db
            .with_conn(|c| repo::list_messages(c, &conv_id))
            .unwrap();
        assert_eq!(messages.len(), 3);
        let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Cursor advanced to EOF
        let raw = db
            .with_conn(|c| repo::raw_log_by_path(c, &ws, &path.to_string_lossy()))
            .unwrap()
            .unwrap();
        assert_eq!(raw.last_processed_offset, std::fs::metadata(&path).unwrap().len());

        // Two jobs: success + success(incremental)
        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| j.incremental));
        let inc_job = jobs.iter().find(|j| j.incremental).unwrap();
        assert_eq!(
            inc_job.stage_metrics["parse_method"],
            serde_json::json!("incremental")
        );
    }

    #[test]
    fn test_unchanged_after_append_is_skipped() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "one")],
        );
        ingest(&db, &registry, &ws, &path).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            f,
            "{}",
            claude_line("sess-1", "2025-01-01T10:00:05Z", "assistant", "two")
        )
        .unwrap();
        let inc = ingest(&db, &registry, &ws, &path).unwrap();
        assert!(inc.incremental);

        // Nothing changed since the incremental pass: the stored hash is
        // stale so dedup misses, and the change detector reports
        // UNCHANGED.
        let third = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(third.status, JobStatus::Skipped);
        assert_eq!(third.change_kind, Some(ChangeKind::Unchanged));
    }

    #[test]
    fn test_rewrite_detection_forces_replace() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[
                claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "original one"),
                claude_line("sess-1", "2025-01-01T10:00:05Z", "assistant", "original two"),
            ],
        );

        let first = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(first.messages_added, 2);

        // Rewrite mid-file, same size (change one byte)
        let content = std::fs::read_to_string(&path).unwrap();
        let rewritten = content.replacen("original one", "originaX one", 1);
        assert_eq!(content.len(), rewritten.len());
        std::fs::write(&path, rewritten).unwrap();

        let second = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(second.status, JobStatus::Success);
        assert_eq!(second.change_kind, Some(ChangeKind::Rewrite));
        assert!(!second.incremental);

        let conv_id = second.conversation_id.unwrap();
        let messages = db
            .with_conn(|c| repo::list_messages(c, &conv_id))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("originaX"));

        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        let rewrite_job = jobs
            .iter()
            .find(|j| j.stage_metrics.get("update_mode").is_some())
            .unwrap();
        assert_eq!(
            rewrite_job.stage_metrics["update_mode"],
            serde_json::json!("replace")
        );
    }

    #[test]
    fn test_metadata_only_skipped() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[
                r#"{"type":"summary","sessionId":"sess-m","version":"2.0.14","summary":"only metadata"}"#.to_string(),
            ],
        );

        let outcome = ingest(&db, &registry, &ws, &path).unwrap();
        assert_eq!(outcome.status, JobStatus::Skipped);
        assert!(outcome.conversation_id.is_none());
    }

    #[test]
    fn test_unknown_format_fails_with_job() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.txt",
            &[r#"{"unknown":"format"}"#.to_string()],
        );

        let err = ingest(&db, &registry, &ws, &path).unwrap_err();
        assert!(matches!(err, Error::UnknownFormat(_)));

        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].error_kind.as_deref(), Some("unknown_format"));
    }

    #[test]
    fn test_cancellation() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let path = write_log(
            &dir,
            "s.jsonl",
            &[claude_line("sess-1", "2025-01-01T10:00:00Z", "user", "hello")],
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ingest_log_file(
            &db,
            &registry,
            &ws,
            &path,
            &IngestHints::default(),
            &IngestPolicy::default(),
            SourceType::Cli,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // Nothing persisted except the failed job
        let convs: i64 = db
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
                    .map_err(Error::from)
            })
            .unwrap();
        assert_eq!(convs, 0);
        let jobs = db.with_conn(|c| repo::list_jobs(c, &ws)).unwrap();
        assert_eq!(jobs[0].error_kind.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_hierarchy_across_arrival_order() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();

        // Agent log arrives first; parent not present yet
        let agent_line = r#"{"type":"user","sessionId":"agent-1","parentSessionId":"parent-1","version":"2.0.14","timestamp":"2025-01-01T10:05:00Z","message":{"role":"user","content":"do subtask"}}"#.to_string();
        let agent_path = write_log(&dir, "agent.jsonl", &[agent_line]);
        let agent_outcome = ingest(&db, &registry, &ws, &agent_path).unwrap();
        let agent_id = agent_outcome.conversation_id.unwrap();

        let agent = db
            .with_conn(|c| repo::get_conversation(c, &ws, &agent_id))
            .unwrap()
            .unwrap();
        assert!(agent.parent_conversation_id.is_none());
        assert_eq!(agent.linking_attempts(), 0);

        // Parent log arrives
        let parent_path = write_log(
            &dir,
            "parent.jsonl",
            &[claude_line("parent-1", "2025-01-01T10:00:00Z", "user", "main task")],
        );
        let parent_outcome = ingest(&db, &registry, &ws, &parent_path).unwrap();
        let parent_id = parent_outcome.conversation_id.unwrap();

        // Sweep links the orphan and leaves the counter alone
        let stats = link_orphan_agents(&db, &ws, 10).unwrap();
        assert_eq!(stats.linked, 1);

        let agent = db
            .with_conn(|c| repo::get_conversation(c, &ws, &agent_id))
            .unwrap()
            .unwrap();
        assert_eq!(agent.parent_conversation_id.as_deref(), Some(parent_id.as_str()));
        assert_eq!(agent.linking_attempts(), 0);
    }

    #[test]
    fn test_orphan_attempts_freeze() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();

        let agent_line = r#"{"type":"user","sessionId":"agent-2","parentSessionId":"never-arrives","version":"2.0.14","timestamp":"2025-01-01T10:05:00Z","message":{"role":"user","content":"orphan"}}"#.to_string();
        let path = write_log(&dir, "agent.jsonl", &[agent_line]);
        let outcome = ingest(&db, &registry, &ws, &path).unwrap();
        let agent_id = outcome.conversation_id.unwrap();

        for expected in 1..=3 {
            let stats = link_orphan_agents(&db, &ws, 3).unwrap();
            assert_eq!(stats.attempted, 1, "sweep {} should attempt", expected);
            let agent = db
                .with_conn(|c| repo::get_conversation(c, &ws, &agent_id))
                .unwrap()
                .unwrap();
            assert_eq!(agent.linking_attempts(), expected);
        }

        // Counter reached the threshold: frozen from now on
        let stats = link_orphan_agents(&db, &ws, 3).unwrap();
        assert_eq!(stats.attempted, 0);
        assert_eq!(stats.frozen, 1);
        let agent = db
            .with_conn(|c| repo::get_conversation(c, &ws, &agent_id))
            .unwrap()
            .unwrap();
        assert_eq!(agent.linking_attempts(), 3);
    }

    #[test]
    fn test_no_cross_workspace_linking() {
        let db = test_db();
        let ws1 = seed_workspace(&db);
        let ws2 = seed_workspace(&db);
        let registry = ParserRegistry::with_builtins();
        let dir = TempDir::new().unwrap();

        // Parent lives in ws2
        let parent_path = write_log(
            &dir,
            "parent.jsonl",
            &[claude_line("parent-x", "2025-01-01T10:00:00Z", "user", "task")],
        );
        ingest(&db, &registry, &ws2, &parent_path).unwrap();

        // Agent in ws1 hints at it
        let agent_line = r#"{"type":"user","sessionId":"agent-x","parentSessionId":"parent-x","version":"2.0.14","timestamp":"2025-01-01T10:05:00Z","message":{"role":"user","content":"sub"}}"#.to_string();
        let agent_path = write_log(&dir, "agent.jsonl", &[agent_line]);
        let outcome = ingest(&db, &registry, &ws1, &agent_path).unwrap();
        let agent_id = outcome.conversation_id.unwrap();

        let stats = link_orphan_agents(&db, &ws1, 10).unwrap();
        assert_eq!(stats.linked, 0);
        assert_eq!(stats.attempted, 1);

        let agent = db
            .with_conn(|c| repo::get_conversation(c, &ws1, &agent_id))
            .unwrap()
            .unwrap();
        assert!(agent.parent_conversation_id.is_none());
    }

    #[test]
    fn test_concurrent_get_or_create_developer() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data.db");
        let db = Database::open(&db_path).unwrap();
        db.migrate().unwrap();
        let ws = seed_workspace(&db);

        let db = Arc::new(db);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            let ws = ws.clone();
            handles.push(std::thread::spawn(move || {
                db.transaction(|tx| repo::get_or_create_developer(tx, &ws, "race-dev"))
                    .map(|d| d.id)
            }));
        }

        let ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "all callers get one row");
    }
}
