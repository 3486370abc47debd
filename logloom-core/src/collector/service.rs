//! Collector protocol service
//!
//! Server-side handling of the collector events protocol. Every
//! handler runs inside one database transaction.
//!
//! Per-session state machine: `absent → active → completed`. Batches
//! for the same session serialize through `last_event_sequence`; a
//! batch whose minimum sequence leaves a gap is rejected with
//! [`crate::Error::GapDetected`] and the client must reconcile via
//! session-status. Already-applied sequences and duplicate event
//! hashes are silently filtered, so re-sends are idempotent.

use crate::collector::events::*;
use crate::db::{repo, Database};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

/// Worker job kind enqueued when a session completes.
pub const TAGGING_JOB_KIND: &str = "tagging";

/// Server-side collector protocol operations.
pub struct CollectorService<'a> {
    db: &'a Database,
}

impl<'a> CollectorService<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Register a new collector and mint its API key.
    ///
    /// The plaintext key appears only in this response; the database
    /// keeps its SHA-256 and a display prefix.
    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.db.transaction(|tx| {
            if repo::get_workspace(tx, &request.workspace_id)?.is_none() {
                return Err(Error::NotFound(format!(
                    "workspace {}",
                    request.workspace_id
                )));
            }

            let (api_key, api_key_prefix, api_key_hash) = generate_api_key();
            let collector = CollectorConfigRecord {
                id: new_id(),
                workspace_id: request.workspace_id.clone(),
                name: format!("{}@{}", request.collector_type, request.hostname),
                collector_type: request.collector_type.clone(),
                api_key_hash,
                api_key_prefix: api_key_prefix.clone(),
                is_active: true,
                extra_data: serde_json::json!({
                    "collector_version": request.collector_version,
                    "hostname": request.hostname,
                    "metadata": request.metadata,
                }),
                created_at: Utc::now(),
            };
            repo::insert_collector(tx, &collector)?;

            tracing::info!(
                collector_id = %collector.id,
                workspace_id = %collector.workspace_id,
                "Registered collector"
            );

            Ok(RegisterResponse {
                collector_id: collector.id,
                api_key,
                api_key_prefix,
                created_at: collector.created_at,
            })
        })
    }

    /// Authenticate a collector by id + bearer key.
    pub fn authenticate(&self, collector_id: &str, api_key: &str) -> Result<CollectorConfigRecord> {
        self.db.with_conn(|conn| {
            let collector = repo::get_collector(conn, collector_id)?
                .ok_or_else(|| Error::NotFound(format!("collector {}", collector_id)))?;

            let presented = hex::encode(Sha256::digest(api_key.as_bytes()));
            if presented != collector.api_key_hash {
                return Err(Error::PermissionDenied("invalid API key".to_string()));
            }
            if !collector.is_active {
                return Err(Error::PermissionDenied("collector is disabled".to_string()));
            }
            Ok(collector)
        })
    }

    /// Apply one event batch for a session.
    pub fn process_events(
        &self,
        collector: &CollectorConfigRecord,
        request: &EventBatchRequest,
    ) -> Result<EventBatchResponse> {
        self.db.transaction(|tx| {
            let mut warnings: Vec<String> = Vec::new();

            let conversation = match repo::get_conversation_by_collector_session(
                tx,
                &request.session_id,
            )? {
                Some(existing) => {
                    // Sessions are invisible across collectors: same
                    // response as never-seen so ids cannot be probed.
                    if existing.collector_id.as_deref() != Some(collector.id.as_str()) {
                        return Err(Error::NotFound(format!(
                            "session {}",
                            request.session_id
                        )));
                    }
                    existing
                }
                None => create_session(tx, collector, &request.session_id, &request.events)?,
            };

            // Gap check against the incoming batch minimum
            let last = conversation.last_event_sequence;
            if let Some(min_sequence) = request.events.iter().map(|e| e.sequence).min() {
                if min_sequence > last + 1 {
                    return Err(Error::GapDetected {
                        last_received: last,
                        expected: last + 1,
                    });
                }
            }

            let mut accepted = 0usize;
            let mut max_applied = last;

            for event in &request.events {
                // Idempotency: already-applied sequences drop silently
                if event.sequence <= last {
                    continue;
                }
                let event_hash = event.hash();
                if repo::collector_event_seen(tx, &conversation.id, &event_hash)? {
                    continue;
                }

                if let Err(e) = apply_event(tx, &conversation, event) {
                    warnings.push(format!("event seq {}: {}", event.sequence, e));
                    continue;
                }
                repo::record_collector_event(tx, &conversation.id, &event_hash, event.sequence)?;
                accepted += 1;
                max_applied = max_applied.max(event.sequence);
            }

            repo::bump_last_event_sequence(tx, &conversation.id, max_applied)?;
            repo::update_conversation_counts(tx, &conversation.id)?;

            tracing::debug!(
                session_id = %request.session_id,
                accepted,
                last_sequence = max_applied,
                "Applied collector batch"
            );

            Ok(EventBatchResponse {
                accepted,
                last_sequence: max_applied,
                conversation_id: conversation.id.clone(),
                warnings,
            })
        })
    }

    /// Session resume info for the client.
    pub fn session_status(
        &self,
        collector: &CollectorConfigRecord,
        session_id: &str,
    ) -> Result<SessionStatusResponse> {
        self.db.with_conn(|conn| {
            let conversation = lookup_own_session(conn, collector, session_id)?;
            let event_count = repo::count_collector_events(conn, &conversation.id)?;

            Ok(SessionStatusResponse {
                session_id: session_id.to_string(),
                conversation_id: conversation.id.clone(),
                last_sequence: conversation.last_event_sequence,
                event_count,
                first_event_at: conversation.start_time,
                last_event_at: conversation.end_time.unwrap_or(conversation.start_time),
                status: match conversation.status {
                    ConversationStatus::Completed => "completed".to_string(),
                    _ => "active".to_string(),
                },
            })
        })
    }

    /// Mark a session completed. Idempotent: calling again returns the
    /// current completed state unchanged.
    pub fn complete_session(
        &self,
        collector: &CollectorConfigRecord,
        session_id: &str,
        request: &SessionCompleteRequest,
    ) -> Result<SessionCompleteResponse> {
        // final_sequence is deprecated and deliberately ignored
        self.db.transaction(|tx| {
            let conversation = lookup_own_session(tx, collector, session_id)?;
            let total_events = repo::count_collector_events(tx, &conversation.id)?;

            if conversation.status == ConversationStatus::Completed {
                return Ok(SessionCompleteResponse {
                    session_id: session_id.to_string(),
                    conversation_id: conversation.id.clone(),
                    status: "completed".to_string(),
                    total_events,
                });
            }

            let success = match request.outcome.as_str() {
                "success" => Some(true),
                "failed" | "abandoned" => Some(false),
                _ => None,
            };
            repo::complete_conversation(tx, &conversation.id, Utc::now(), success)?;

            if let Some(summary) = &request.summary {
                let mut extra = conversation.extra_data.clone();
                extra["summary"] = serde_json::json!(summary);
                repo::update_conversation_extra_data(tx, &conversation.id, &extra)?;
            }

            // Enqueued within the same transaction; the worker cannot
            // claim it before commit.
            repo::enqueue_worker_job(tx, &conversation.id, TAGGING_JOB_KIND)?;

            tracing::info!(
                session_id = %session_id,
                conversation_id = %conversation.id,
                outcome = %request.outcome,
                "Completed collector session"
            );

            Ok(SessionCompleteResponse {
                session_id: session_id.to_string(),
                conversation_id: conversation.id.clone(),
                status: "completed".to_string(),
                total_events,
            })
        })
    }
}

/// Lookup a session owned by this collector; unseen and
/// other-collector sessions both report NotFound.
fn lookup_own_session(
    conn: &Connection,
    collector: &CollectorConfigRecord,
    session_id: &str,
) -> Result<Conversation> {
    let conversation = repo::get_conversation_by_collector_session(conn, session_id)?
        .filter(|c| c.collector_id.as_deref() == Some(collector.id.as_str()))
        .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
    Ok(conversation)
}

/// absent → active: create the conversation from the first batch.
fn create_session(
    tx: &Connection,
    collector: &CollectorConfigRecord,
    session_id: &str,
    events: &[CollectorEvent],
) -> Result<Conversation> {
    // Session-level attributes ride on the session_start event
    let start = events
        .iter()
        .find(|e| e.kind == EventKind::SessionStart)
        .map(|e| e.data.clone())
        .unwrap_or_else(|| serde_json::json!({}));

    let agent_type = start
        .get("agent_type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let agent_version = start
        .get("agent_version")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let working_directory = start
        .get("working_directory")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let git_branch = start
        .get("git_branch")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let parent_session_id = start
        .get("parent_session_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    let project = match working_directory.as_deref() {
        Some(dir) => Some(repo::get_or_create_project(tx, &collector.workspace_id, dir)?),
        None => None,
    };

    // Parent resolution stays inside the workspace
    let parent_conversation_id = match parent_session_id.as_deref() {
        Some(parent_session) => repo::get_conversation_by_collector_session(tx, parent_session)?
            .filter(|c| c.workspace_id == collector.workspace_id)
            .map(|c| c.id),
        None => None,
    };

    let now = Utc::now();
    let conversation_type = if parent_conversation_id.is_some() || parent_session_id.is_some() {
        ConversationType::Agent
    } else {
        ConversationType::Main
    };

    let mut agent_metadata = serde_json::json!({});
    if let Some(parent) = &parent_session_id {
        agent_metadata["parent_session_id"] = serde_json::json!(parent);
    }

    let conversation = Conversation {
        id: new_id(),
        workspace_id: collector.workspace_id.clone(),
        project_id: project.map(|p| p.id),
        developer_id: None,
        agent_type,
        agent_version,
        start_time: now,
        end_time: None,
        status: ConversationStatus::Open,
        success: None,
        conversation_type,
        parent_conversation_id,
        collector_session_id: Some(session_id.to_string()),
        collector_id: Some(collector.id.clone()),
        last_event_sequence: 0,
        message_count: 0,
        epoch_count: 0,
        files_count: 0,
        agent_metadata,
        extra_data: serde_json::json!({
            "session_id": session_id,
            "working_directory": working_directory,
            "git_branch": git_branch,
        }),
        tags: serde_json::json!({}),
        plans: serde_json::json!([]),
    };
    repo::insert_conversation(tx, &conversation)?;
    repo::get_or_create_default_epoch(tx, &conversation.id, now)?;

    tracing::info!(
        session_id = %session_id,
        conversation_id = %conversation.id,
        "Created collector session"
    );

    Ok(conversation)
}

/// Apply one event's effect on the data model.
fn apply_event(tx: &Connection, conversation: &Conversation, event: &CollectorEvent) -> Result<()> {
    match event.kind {
        // Attributes were consumed at session creation; the event
        // itself only advances the sequence.
        EventKind::SessionStart | EventKind::SessionEnd => Ok(()),

        EventKind::Metadata => {
            let mut extra = current_extra_data(tx, conversation)?;
            if let (Some(extra_map), Some(data_map)) = (extra.as_object_mut(), event.data.as_object())
            {
                for (key, value) in data_map {
                    extra_map.insert(key.clone(), value.clone());
                }
            }
            repo::update_conversation_extra_data(tx, &conversation.id, &extra)
        }

        EventKind::Message => {
            let role = derive_role(&event.data);
            let content = event
                .data
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let thinking = event
                .data
                .get("thinking_content")
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            insert_event_message(tx, conversation, event, role, content, thinking)
        }

        EventKind::ToolCall => {
            let tool_name = event
                .data
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let params = event
                .data
                .get("parameters")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let content = format!("[Tool Call: {}] {}", tool_name, params);
            insert_event_message(tx, conversation, event, MessageRole::System, content, None)
        }

        EventKind::ToolResult => {
            let error = event.data.get("error_message").and_then(|v| v.as_str());
            let content = match error {
                Some(message) => format!("[Tool Error] {}", message),
                None => {
                    let result = event
                        .data
                        .get("result")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let truncated: String = result.chars().take(500).collect();
                    format!("[Tool Result] {}", truncated)
                }
            };
            insert_event_message(tx, conversation, event, MessageRole::System, content, None)
        }

        EventKind::Thinking => {
            let content = event
                .data
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            insert_event_message(
                tx,
                conversation,
                event,
                MessageRole::Assistant,
                String::new(),
                Some(content),
            )
        }

        EventKind::Error => {
            let error_type = event
                .data
                .get("error_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let message = event
                .data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let content = format!("[Error: {}] {}", error_type, message);
            insert_event_message(tx, conversation, event, MessageRole::System, content, None)
        }
    }
}

fn current_extra_data(tx: &Connection, conversation: &Conversation) -> Result<serde_json::Value> {
    // Re-read: earlier events in this batch may have merged already
    Ok(
        repo::get_conversation(tx, &conversation.workspace_id, &conversation.id)?
            .map(|c| c.extra_data)
            .unwrap_or_else(|| conversation.extra_data.clone()),
    )
}

fn derive_role(data: &serde_json::Value) -> MessageRole {
    match data.get("author_role").and_then(|v| v.as_str()) {
        Some("human") => MessageRole::User,
        Some("assistant") | Some("agent") => MessageRole::Assistant,
        Some("tool") | Some("system") => MessageRole::System,
        _ => MessageRole::User,
    }
}

fn insert_event_message(
    tx: &Connection,
    conversation: &Conversation,
    event: &CollectorEvent,
    role: MessageRole,
    content: String,
    thinking_content: Option<String>,
) -> Result<()> {
    let epoch = repo::get_or_create_default_epoch(tx, &conversation.id, event.emitted_at)?;

    let usage = event.data.get("token_usage");
    let tokens_in = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_i64());
    let tokens_out = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_i64());

    let message = Message {
        id: new_id(),
        conversation_id: conversation.id.clone(),
        epoch_id: epoch.id,
        // Event sequences are unique per session, so they double as
        // message sequences; gaps from non-message events are fine.
        sequence: event.sequence as i64,
        role,
        content,
        timestamp: Some(event.emitted_at),
        model: event
            .data
            .get("model")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        tool_calls: serde_json::json!([]),
        tool_results: serde_json::json!([]),
        code_changes: serde_json::json!([]),
        thinking_content,
        tokens_in,
        tokens_out,
        raw_data: event.data.clone(),
    };
    repo::insert_message(tx, &message)
}

/// Generate `(full_key, prefix, sha256_hash)` for a new collector.
fn generate_api_key() -> (String, String, String) {
    let random_part = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let full_key = format!("ll_live_{}", random_part);
    let prefix = format!("ll_live_{}", &random_part[..4]);
    let key_hash = hex::encode(Sha256::digest(full_key.as_bytes()));
    (full_key, prefix, key_hash)
}
