//! Database repository layer
//!
//! [`Database`] wraps one SQLite connection behind a mutex. Repository
//! operations are free functions over `&Connection` so they compose
//! inside a single transaction: the ingestion pipeline and collector
//! handlers run entirely within [`Database::transaction`].

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Run `f` inside one transaction; commit on Ok, roll back on Err.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropped transaction rolls back
                Err(e)
            }
        }
    }

    /// Run `f` against the raw connection (single-statement reads).
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

// ============================================
// Helpers
// ============================================

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|t| t.to_rfc3339())
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn json_or_default(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn json_array_or_default(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!([]))
}

// ============================================
// Tenancy
// ============================================

pub fn create_organization(conn: &Connection, name: &str) -> Result<Organization> {
    let org = Organization {
        id: new_id(),
        name: name.to_string(),
        created_at: Utc::now(),
        settings: serde_json::json!({}),
    };
    conn.execute(
        "INSERT INTO organizations (id, name, created_at, settings) VALUES (?1, ?2, ?3, ?4)",
        params![org.id, org.name, ts(&org.created_at), org.settings.to_string()],
    )?;
    Ok(org)
}

pub fn create_workspace(conn: &Connection, organization_id: &str, name: &str) -> Result<Workspace> {
    let ws = Workspace {
        id: new_id(),
        organization_id: organization_id.to_string(),
        name: name.to_string(),
        created_at: Utc::now(),
        settings: serde_json::json!({}),
    };
    conn.execute(
        "INSERT INTO workspaces (id, organization_id, name, created_at, settings)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ws.id,
            ws.organization_id,
            ws.name,
            ts(&ws.created_at),
            ws.settings.to_string()
        ],
    )?;
    Ok(ws)
}

pub fn get_workspace(conn: &Connection, id: &str) -> Result<Option<Workspace>> {
    conn.query_row("SELECT * FROM workspaces WHERE id = ?", [id], |row| {
        Ok(Workspace {
            id: row.get("id")?,
            organization_id: row.get("organization_id")?,
            name: row.get("name")?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            settings: json_or_default(row.get("settings")?),
        })
    })
    .optional()
    .map_err(Error::from)
}

/// Get-or-create a project by `(workspace_id, directory_path)`.
///
/// Race-safe: INSERT OR IGNORE then SELECT within one connection, so
/// concurrent callers converge on one row without catching unique
/// violations after the fact.
pub fn get_or_create_project(
    conn: &Connection,
    workspace_id: &str,
    directory_path: &str,
) -> Result<Project> {
    let name = std::path::Path::new(directory_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(directory_path)
        .to_string();

    conn.execute(
        "INSERT OR IGNORE INTO projects (id, workspace_id, name, directory_path, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![new_id(), workspace_id, name, directory_path, ts(&Utc::now())],
    )?;

    conn.query_row(
        "SELECT * FROM projects WHERE workspace_id = ?1 AND directory_path = ?2",
        params![workspace_id, directory_path],
        row_to_project,
    )
    .map_err(Error::from)
}

pub fn get_project(conn: &Connection, workspace_id: &str, id: &str) -> Result<Option<Project>> {
    conn.query_row(
        "SELECT * FROM projects WHERE id = ?1 AND workspace_id = ?2",
        params![id, workspace_id],
        row_to_project,
    )
    .optional()
    .map_err(Error::from)
}

pub fn touch_project_activity(conn: &Connection, project_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE projects SET last_activity_at = ?1 WHERE id = ?2",
        params![ts(&Utc::now()), project_id],
    )?;
    Ok(())
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        name: row.get("name")?,
        directory_path: row.get("directory_path")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        last_activity_at: parse_opt_ts(row.get("last_activity_at")?),
    })
}

/// Get-or-create a developer by `(workspace_id, username)`; same
/// conflict-ignore discipline as projects.
pub fn get_or_create_developer(
    conn: &Connection,
    workspace_id: &str,
    username: &str,
) -> Result<Developer> {
    conn.execute(
        "INSERT OR IGNORE INTO developers (id, workspace_id, username, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![new_id(), workspace_id, username, ts(&Utc::now())],
    )?;

    conn.query_row(
        "SELECT * FROM developers WHERE workspace_id = ?1 AND username = ?2",
        params![workspace_id, username],
        |row| {
            Ok(Developer {
                id: row.get("id")?,
                workspace_id: row.get("workspace_id")?,
                username: row.get("username")?,
                created_at: parse_ts(&row.get::<_, String>("created_at")?),
            })
        },
    )
    .map_err(Error::from)
}

// ============================================
// Conversations
// ============================================

pub fn insert_conversation(conn: &Connection, conv: &Conversation) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO conversations (
            id, workspace_id, project_id, developer_id, agent_type, agent_version,
            start_time, end_time, status, success, conversation_type,
            parent_conversation_id, collector_session_id, collector_id,
            last_event_sequence, message_count, epoch_count, files_count,
            agent_metadata, extra_data, tags, plans
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
        "#,
        params![
            conv.id,
            conv.workspace_id,
            conv.project_id,
            conv.developer_id,
            conv.agent_type,
            conv.agent_version,
            ts(&conv.start_time),
            opt_ts(&conv.end_time),
            conv.status.as_str(),
            conv.success.map(|b| b as i64),
            conv.conversation_type.as_str(),
            conv.parent_conversation_id,
            conv.collector_session_id,
            conv.collector_id,
            conv.last_event_sequence as i64,
            conv.message_count,
            conv.epoch_count,
            conv.files_count,
            conv.agent_metadata.to_string(),
            conv.extra_data.to_string(),
            conv.tags.to_string(),
            conv.plans.to_string(),
        ],
    )?;
    Ok(())
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let status: String = row.get("status")?;
    let conversation_type: String = row.get("conversation_type")?;
    Ok(Conversation {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        project_id: row.get("project_id")?,
        developer_id: row.get("developer_id")?,
        agent_type: row.get("agent_type")?,
        agent_version: row.get("agent_version")?,
        start_time: parse_ts(&row.get::<_, String>("start_time")?),
        end_time: parse_opt_ts(row.get("end_time")?),
        status: ConversationStatus::from_str(&status).unwrap_or(ConversationStatus::Open),
        success: row.get::<_, Option<i64>>("success")?.map(|v| v != 0),
        conversation_type: ConversationType::from_str(&conversation_type)
            .unwrap_or(ConversationType::Main),
        parent_conversation_id: row.get("parent_conversation_id")?,
        collector_session_id: row.get("collector_session_id")?,
        collector_id: row.get("collector_id")?,
        last_event_sequence: row.get::<_, i64>("last_event_sequence")? as u64,
        message_count: row.get("message_count")?,
        epoch_count: row.get("epoch_count")?,
        files_count: row.get("files_count")?,
        agent_metadata: json_or_default(row.get("agent_metadata")?),
        extra_data: json_or_default(row.get("extra_data")?),
        tags: json_or_default(row.get("tags")?),
        plans: json_array_or_default(row.get("plans")?),
    })
}

/// Workspace-scoped lookup. Cross-workspace ids come back as `None`,
/// which callers surface as `NotFound`.
pub fn get_conversation(
    conn: &Connection,
    workspace_id: &str,
    id: &str,
) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT * FROM conversations WHERE id = ?1 AND workspace_id = ?2",
        params![id, workspace_id],
        row_to_conversation,
    )
    .optional()
    .map_err(Error::from)
}

/// Unscoped lookup for internal consumers (background workers) that
/// derive the workspace from the row itself. Never exposed to
/// request-scoped callers.
pub fn get_conversation_any(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT * FROM conversations WHERE id = ?1",
        [id],
        row_to_conversation,
    )
    .optional()
    .map_err(Error::from)
}

/// Lookup by the session id recorded in extra_data at ingest time.
pub fn get_conversation_by_session_id(
    conn: &Connection,
    workspace_id: &str,
    session_id: &str,
) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT * FROM conversations
         WHERE workspace_id = ?1 AND json_extract(extra_data, '$.session_id') = ?2",
        params![workspace_id, session_id],
        row_to_conversation,
    )
    .optional()
    .map_err(Error::from)
}

pub fn get_conversation_by_collector_session(
    conn: &Connection,
    collector_session_id: &str,
) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT * FROM conversations WHERE collector_session_id = ?1",
        [collector_session_id],
        row_to_conversation,
    )
    .optional()
    .map_err(Error::from)
}

/// Agent conversations in the workspace with no parent link yet.
pub fn list_orphan_agents(conn: &Connection, workspace_id: &str) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM conversations
         WHERE workspace_id = ?1 AND conversation_type = 'agent'
           AND parent_conversation_id IS NULL
         ORDER BY start_time",
    )?;
    let rows = stmt.query_map([workspace_id], row_to_conversation)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_children(
    conn: &Connection,
    workspace_id: &str,
    parent_id: &str,
) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM conversations
         WHERE workspace_id = ?1 AND parent_conversation_id = ?2
         ORDER BY start_time",
    )?;
    let rows = stmt.query_map(params![workspace_id, parent_id], row_to_conversation)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn set_conversation_parent(conn: &Connection, id: &str, parent_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET parent_conversation_id = ?1 WHERE id = ?2",
        params![parent_id, id],
    )?;
    Ok(())
}

pub fn update_agent_metadata(
    conn: &Connection,
    id: &str,
    metadata: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET agent_metadata = ?1 WHERE id = ?2",
        params![metadata.to_string(), id],
    )?;
    Ok(())
}

pub fn update_conversation_tags(conn: &Connection, id: &str, tags: &serde_json::Value) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET tags = ?1 WHERE id = ?2",
        params![tags.to_string(), id],
    )?;
    Ok(())
}

pub fn update_conversation_extra_data(
    conn: &Connection,
    id: &str,
    extra_data: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET extra_data = ?1 WHERE id = ?2",
        params![extra_data.to_string(), id],
    )?;
    Ok(())
}

/// Recompute denormalized counts from the owned rows.
pub fn update_conversation_counts(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        r#"
        UPDATE conversations SET
            message_count = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?1),
            epoch_count = (SELECT COUNT(*) FROM epochs WHERE conversation_id = ?1),
            files_count = (SELECT COUNT(DISTINCT file_path) FROM files_touched WHERE conversation_id = ?1)
        WHERE id = ?1
        "#,
        [conversation_id],
    )?;
    Ok(())
}

/// Raise `last_event_sequence` monotonically; never decreases.
pub fn bump_last_event_sequence(conn: &Connection, id: &str, sequence: u64) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET last_event_sequence = MAX(last_event_sequence, ?1) WHERE id = ?2",
        params![sequence as i64, id],
    )?;
    Ok(())
}

pub fn complete_conversation(
    conn: &Connection,
    id: &str,
    end_time: DateTime<Utc>,
    success: Option<bool>,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET status = 'completed', end_time = ?1, success = ?2 WHERE id = ?3",
        params![ts(&end_time), success.map(|b| b as i64), id],
    )?;
    Ok(())
}

pub fn delete_conversation(conn: &Connection, workspace_id: &str, id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM conversations WHERE id = ?1 AND workspace_id = ?2",
        params![id, workspace_id],
    )?;
    Ok(deleted > 0)
}

// ============================================
// Epochs, messages, files
// ============================================

pub fn insert_epoch(conn: &Connection, epoch: &Epoch) -> Result<()> {
    conn.execute(
        "INSERT INTO epochs (id, conversation_id, sequence, classification, start_time, end_time, extra_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            epoch.id,
            epoch.conversation_id,
            epoch.sequence,
            epoch.classification,
            ts(&epoch.start_time),
            opt_ts(&epoch.end_time),
            epoch.extra_data.to_string(),
        ],
    )?;
    Ok(())
}

fn row_to_epoch(row: &Row) -> rusqlite::Result<Epoch> {
    Ok(Epoch {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        sequence: row.get("sequence")?,
        classification: row.get("classification")?,
        start_time: parse_ts(&row.get::<_, String>("start_time")?),
        end_time: parse_opt_ts(row.get("end_time")?),
        extra_data: json_or_default(row.get("extra_data")?),
    })
}

pub fn list_epochs(conn: &Connection, conversation_id: &str) -> Result<Vec<Epoch>> {
    let mut stmt =
        conn.prepare("SELECT * FROM epochs WHERE conversation_id = ?1 ORDER BY sequence")?;
    let rows = stmt.query_map([conversation_id], row_to_epoch)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Latest epoch by sequence, creating the default epoch when none exist.
pub fn get_or_create_default_epoch(
    conn: &Connection,
    conversation_id: &str,
    start_time: DateTime<Utc>,
) -> Result<Epoch> {
    let existing = conn
        .query_row(
            "SELECT * FROM epochs WHERE conversation_id = ?1 ORDER BY sequence DESC LIMIT 1",
            [conversation_id],
            row_to_epoch,
        )
        .optional()?;

    if let Some(epoch) = existing {
        return Ok(epoch);
    }

    let epoch = Epoch {
        id: new_id(),
        conversation_id: conversation_id.to_string(),
        sequence: 1,
        classification: None,
        start_time,
        end_time: None,
        extra_data: serde_json::json!({}),
    };
    insert_epoch(conn, &epoch)?;
    Ok(epoch)
}

pub fn insert_message(conn: &Connection, msg: &Message) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO messages (
            id, conversation_id, epoch_id, sequence, role, content, timestamp, model,
            tool_calls, tool_results, code_changes, thinking_content,
            tokens_in, tokens_out, raw_data
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            msg.id,
            msg.conversation_id,
            msg.epoch_id,
            msg.sequence,
            msg.role.as_str(),
            msg.content,
            opt_ts(&msg.timestamp),
            msg.model,
            msg.tool_calls.to_string(),
            msg.tool_results.to_string(),
            msg.code_changes.to_string(),
            msg.thinking_content,
            msg.tokens_in,
            msg.tokens_out,
            msg.raw_data.to_string(),
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        epoch_id: row.get("epoch_id")?,
        sequence: row.get("sequence")?,
        role: MessageRole::from_str(&role).unwrap_or(MessageRole::System),
        content: row.get("content")?,
        timestamp: parse_opt_ts(row.get("timestamp")?),
        model: row.get("model")?,
        tool_calls: json_array_or_default(row.get("tool_calls")?),
        tool_results: json_array_or_default(row.get("tool_results")?),
        code_changes: json_array_or_default(row.get("code_changes")?),
        thinking_content: row.get("thinking_content")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        raw_data: json_or_default(row.get("raw_data")?),
    })
}

pub fn list_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let mut stmt =
        conn.prepare("SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY sequence")?;
    let rows = stmt.query_map([conversation_id], row_to_message)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn max_message_sequence(conn: &Connection, conversation_id: &str) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(sequence) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |r| r.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

/// Drop all epochs, messages, and file rows of a conversation.
/// Used by replace-mode re-ingests before reinserting.
pub fn delete_conversation_content(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1",
        [conversation_id],
    )?;
    conn.execute(
        "DELETE FROM epochs WHERE conversation_id = ?1",
        [conversation_id],
    )?;
    conn.execute(
        "DELETE FROM files_touched WHERE conversation_id = ?1",
        [conversation_id],
    )?;
    Ok(())
}

pub fn insert_file_touched(
    conn: &Connection,
    conversation_id: &str,
    file_path: &str,
    change_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO files_touched (id, conversation_id, file_path, change_type)
         VALUES (?1, ?2, ?3, ?4)",
        params![new_id(), conversation_id, file_path, change_type],
    )?;
    Ok(())
}

pub fn list_files_touched(conn: &Connection, conversation_id: &str) -> Result<Vec<FileTouched>> {
    let mut stmt = conn
        .prepare("SELECT * FROM files_touched WHERE conversation_id = ?1 ORDER BY file_path")?;
    let rows = stmt.query_map([conversation_id], |row| {
        Ok(FileTouched {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            file_path: row.get("file_path")?,
            change_type: row.get("change_type")?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

// ============================================
// Raw logs
// ============================================

pub fn insert_raw_log(conn: &Connection, raw_log: &RawLog) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO raw_logs (
            id, workspace_id, conversation_id, file_path, file_hash,
            last_processed_offset, last_processed_line, file_size_bytes,
            partial_hash, agent_type, ingested_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            raw_log.id,
            raw_log.workspace_id,
            raw_log.conversation_id,
            raw_log.file_path,
            raw_log.file_hash,
            raw_log.last_processed_offset as i64,
            raw_log.last_processed_line as i64,
            raw_log.file_size_bytes as i64,
            raw_log.partial_hash,
            raw_log.agent_type,
            ts(&raw_log.ingested_at),
        ],
    )?;
    Ok(())
}

fn row_to_raw_log(row: &Row) -> rusqlite::Result<RawLog> {
    Ok(RawLog {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        conversation_id: row.get("conversation_id")?,
        file_path: row.get("file_path")?,
        file_hash: row.get("file_hash")?,
        last_processed_offset: row.get::<_, i64>("last_processed_offset")? as u64,
        last_processed_line: row.get::<_, i64>("last_processed_line")? as u64,
        file_size_bytes: row.get::<_, i64>("file_size_bytes")? as u64,
        partial_hash: row.get("partial_hash")?,
        agent_type: row.get("agent_type")?,
        ingested_at: parse_ts(&row.get::<_, String>("ingested_at")?),
    })
}

pub fn raw_log_by_hash(
    conn: &Connection,
    workspace_id: &str,
    file_hash: &str,
) -> Result<Option<RawLog>> {
    conn.query_row(
        "SELECT * FROM raw_logs WHERE workspace_id = ?1 AND file_hash = ?2",
        params![workspace_id, file_hash],
        row_to_raw_log,
    )
    .optional()
    .map_err(Error::from)
}

pub fn raw_log_by_path(
    conn: &Connection,
    workspace_id: &str,
    file_path: &str,
) -> Result<Option<RawLog>> {
    conn.query_row(
        "SELECT * FROM raw_logs WHERE workspace_id = ?1 AND file_path = ?2",
        params![workspace_id, file_path],
        row_to_raw_log,
    )
    .optional()
    .map_err(Error::from)
}

/// Raw logs whose paths live under `directory` (startup reconciliation).
pub fn raw_logs_under_directory(
    conn: &Connection,
    workspace_id: &str,
    directory: &str,
) -> Result<Vec<RawLog>> {
    let prefix = format!("{}%", directory.trim_end_matches('/').to_string() + "/");
    let mut stmt = conn
        .prepare("SELECT * FROM raw_logs WHERE workspace_id = ?1 AND file_path LIKE ?2")?;
    let rows = stmt.query_map(params![workspace_id, prefix], row_to_raw_log)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Persist the updated cursor state after a successful parse.
pub fn update_raw_log_state(
    conn: &Connection,
    id: &str,
    last_processed_offset: u64,
    last_processed_line: u64,
    file_size_bytes: u64,
    partial_hash: &str,
    file_hash: &str,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE raw_logs SET
            last_processed_offset = ?1,
            last_processed_line = ?2,
            file_size_bytes = ?3,
            partial_hash = ?4,
            file_hash = ?5,
            ingested_at = ?6
        WHERE id = ?7
        "#,
        params![
            last_processed_offset as i64,
            last_processed_line as i64,
            file_size_bytes as i64,
            partial_hash,
            file_hash,
            ts(&Utc::now()),
            id,
        ],
    )?;
    Ok(())
}

// ============================================
// Ingestion jobs
// ============================================

pub fn insert_ingestion_job(conn: &Connection, job: &IngestionJob) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO ingestion_jobs (
            id, workspace_id, status, source_type, source_config_id, file_path,
            created_by, conversation_id, raw_log_id, incremental, messages_added,
            stage_metrics, error_kind, error_message, started_at, finished_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        params![
            job.id,
            job.workspace_id,
            job.status.as_str(),
            job.source_type.as_str(),
            job.source_config_id,
            job.file_path,
            job.created_by,
            job.conversation_id,
            job.raw_log_id,
            job.incremental as i64,
            job.messages_added,
            job.stage_metrics.to_string(),
            job.error_kind,
            job.error_message,
            ts(&job.started_at),
            opt_ts(&job.finished_at),
        ],
    )?;
    Ok(())
}

fn row_to_job(row: &Row) -> rusqlite::Result<IngestionJob> {
    let status: String = row.get("status")?;
    let source_type: String = row.get("source_type")?;
    Ok(IngestionJob {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
        source_type: SourceType::from_str(&source_type).unwrap_or(SourceType::Cli),
        source_config_id: row.get("source_config_id")?,
        file_path: row.get("file_path")?,
        created_by: row.get("created_by")?,
        conversation_id: row.get("conversation_id")?,
        raw_log_id: row.get("raw_log_id")?,
        incremental: row.get::<_, i64>("incremental")? != 0,
        messages_added: row.get("messages_added")?,
        stage_metrics: json_or_default(row.get("stage_metrics")?),
        error_kind: row.get("error_kind")?,
        error_message: row.get("error_message")?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?),
        finished_at: parse_opt_ts(row.get("finished_at")?),
    })
}

pub fn list_jobs(conn: &Connection, workspace_id: &str) -> Result<Vec<IngestionJob>> {
    let mut stmt = conn
        .prepare("SELECT * FROM ingestion_jobs WHERE workspace_id = ?1 ORDER BY started_at")?;
    let rows = stmt.query_map([workspace_id], row_to_job)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

// ============================================
// Canonical cache
// ============================================

pub fn get_canonical_cache(
    conn: &Connection,
    conversation_id: &str,
    canonical_type: &str,
) -> Result<Option<CanonicalCacheEntry>> {
    conn.query_row(
        "SELECT * FROM canonical_cache WHERE conversation_id = ?1 AND canonical_type = ?2",
        params![conversation_id, canonical_type],
        |row| {
            Ok(CanonicalCacheEntry {
                id: row.get("id")?,
                conversation_id: row.get("conversation_id")?,
                canonical_type: row.get("canonical_type")?,
                version: row.get("version")?,
                narrative: row.get("narrative")?,
                token_count: row.get("token_count")?,
                source_message_count: row.get("source_message_count")?,
                source_token_estimate: row.get("source_token_estimate")?,
                generated_at: parse_ts(&row.get::<_, String>("generated_at")?),
                expires_at: parse_opt_ts(row.get("expires_at")?),
            })
        },
    )
    .optional()
    .map_err(Error::from)
}

pub fn upsert_canonical_cache(conn: &Connection, entry: &CanonicalCacheEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO canonical_cache (
            id, conversation_id, canonical_type, version, narrative, token_count,
            source_message_count, source_token_estimate, generated_at, expires_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(conversation_id, canonical_type) DO UPDATE SET
            version = excluded.version,
            narrative = excluded.narrative,
            token_count = excluded.token_count,
            source_message_count = excluded.source_message_count,
            source_token_estimate = excluded.source_token_estimate,
            generated_at = excluded.generated_at,
            expires_at = excluded.expires_at
        "#,
        params![
            entry.id,
            entry.conversation_id,
            entry.canonical_type,
            entry.version,
            entry.narrative,
            entry.token_count,
            entry.source_message_count,
            entry.source_token_estimate,
            ts(&entry.generated_at),
            opt_ts(&entry.expires_at),
        ],
    )?;
    Ok(())
}

pub fn delete_canonical_cache(
    conn: &Connection,
    conversation_id: &str,
    canonical_type: Option<&str>,
) -> Result<usize> {
    let deleted = match canonical_type {
        Some(kind) => conn.execute(
            "DELETE FROM canonical_cache WHERE conversation_id = ?1 AND canonical_type = ?2",
            params![conversation_id, kind],
        )?,
        None => conn.execute(
            "DELETE FROM canonical_cache WHERE conversation_id = ?1",
            [conversation_id],
        )?,
    };
    Ok(deleted)
}

// ============================================
// Collectors & collector events
// ============================================

pub fn insert_collector(conn: &Connection, collector: &CollectorConfigRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO collectors (
            id, workspace_id, name, collector_type, api_key_hash, api_key_prefix,
            is_active, extra_data, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            collector.id,
            collector.workspace_id,
            collector.name,
            collector.collector_type,
            collector.api_key_hash,
            collector.api_key_prefix,
            collector.is_active as i64,
            collector.extra_data.to_string(),
            ts(&collector.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_collector(conn: &Connection, id: &str) -> Result<Option<CollectorConfigRecord>> {
    conn.query_row("SELECT * FROM collectors WHERE id = ?1", [id], |row| {
        Ok(CollectorConfigRecord {
            id: row.get("id")?,
            workspace_id: row.get("workspace_id")?,
            name: row.get("name")?,
            collector_type: row.get("collector_type")?,
            api_key_hash: row.get("api_key_hash")?,
            api_key_prefix: row.get("api_key_prefix")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            extra_data: json_or_default(row.get("extra_data")?),
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
        })
    })
    .optional()
    .map_err(Error::from)
}

/// Whether this event hash has already been applied to the conversation.
pub fn collector_event_seen(
    conn: &Connection,
    conversation_id: &str,
    event_hash: &str,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM collector_events WHERE conversation_id = ?1 AND event_hash = ?2",
        params![conversation_id, event_hash],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn record_collector_event(
    conn: &Connection,
    conversation_id: &str,
    event_hash: &str,
    sequence: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO collector_events (conversation_id, event_hash, sequence, received_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![conversation_id, event_hash, sequence as i64, ts(&Utc::now())],
    )?;
    Ok(())
}

pub fn count_collector_events(conn: &Connection, conversation_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM collector_events WHERE conversation_id = ?1",
        [conversation_id],
        |r| r.get(0),
    )
    .map_err(Error::from)
}

// ============================================
// Recommendations
// ============================================

pub fn insert_recommendation(conn: &Connection, rec: &Recommendation) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO recommendations (
            id, workspace_id, conversation_id, kind, title, body, confidence, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            rec.id,
            rec.workspace_id,
            rec.conversation_id,
            rec.kind,
            rec.title,
            rec.body,
            rec.confidence,
            rec.status,
            ts(&rec.created_at),
        ],
    )?;
    Ok(())
}

fn row_to_recommendation(row: &Row) -> rusqlite::Result<Recommendation> {
    Ok(Recommendation {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        conversation_id: row.get("conversation_id")?,
        kind: row.get("kind")?,
        title: row.get("title")?,
        body: row.get("body")?,
        confidence: row.get("confidence")?,
        status: row.get("status")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

pub fn list_recommendations(conn: &Connection, workspace_id: &str) -> Result<Vec<Recommendation>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM recommendations WHERE workspace_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([workspace_id], row_to_recommendation)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Workspace-scoped status update; cross-workspace ids report NotFound.
pub fn update_recommendation_status(
    conn: &Connection,
    workspace_id: &str,
    id: &str,
    status: &str,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE recommendations SET status = ?1 WHERE id = ?2 AND workspace_id = ?3",
        params![status, id, workspace_id],
    )?;
    if updated == 0 {
        return Err(Error::NotFound(format!("recommendation {}", id)));
    }
    Ok(())
}

// ============================================
// Watch configs
// ============================================

pub fn insert_watch_config(conn: &Connection, config: &WatchConfigRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO watch_configs (
            id, workspace_id, directory, project_name, developer_username, is_active, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            config.id,
            config.workspace_id,
            config.directory,
            config.project_name,
            config.developer_username,
            config.is_active as i64,
            ts(&config.created_at),
        ],
    )?;
    Ok(())
}

fn row_to_watch_config(row: &Row) -> rusqlite::Result<WatchConfigRecord> {
    Ok(WatchConfigRecord {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        directory: row.get("directory")?,
        project_name: row.get("project_name")?,
        developer_username: row.get("developer_username")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

pub fn get_watch_config(
    conn: &Connection,
    workspace_id: &str,
    id: &str,
) -> Result<Option<WatchConfigRecord>> {
    conn.query_row(
        "SELECT * FROM watch_configs WHERE id = ?1 AND workspace_id = ?2",
        params![id, workspace_id],
        row_to_watch_config,
    )
    .optional()
    .map_err(Error::from)
}

pub fn list_watch_configs(conn: &Connection, workspace_id: &str) -> Result<Vec<WatchConfigRecord>> {
    let mut stmt =
        conn.prepare("SELECT * FROM watch_configs WHERE workspace_id = ?1 ORDER BY created_at")?;
    let rows = stmt.query_map([workspace_id], row_to_watch_config)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Only the daemon manager mutates `is_active`.
pub fn set_watch_config_active(conn: &Connection, id: &str, is_active: bool) -> Result<()> {
    conn.execute(
        "UPDATE watch_configs SET is_active = ?1 WHERE id = ?2",
        params![is_active as i64, id],
    )?;
    Ok(())
}

pub fn delete_watch_config(conn: &Connection, workspace_id: &str, id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM watch_configs WHERE id = ?1 AND workspace_id = ?2",
        params![id, workspace_id],
    )?;
    Ok(deleted > 0)
}

// ============================================
// Worker jobs
// ============================================

/// Enqueue a background job. Safe to call inside the transaction that
/// created the conversation: workers cannot claim the row until commit.
pub fn enqueue_worker_job(conn: &Connection, conversation_id: &str, kind: &str) -> Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO worker_jobs (id, conversation_id, kind, status, attempts, created_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
        params![id, conversation_id, kind, ts(&Utc::now())],
    )?;
    Ok(id)
}

/// A claimed worker job.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub conversation_id: String,
    pub kind: String,
    pub attempts: u32,
}

/// Claim the oldest pending job of the given kind.
///
/// Single conditional UPDATE with RETURNING, the SQLite analogue of
/// `FOR UPDATE SKIP LOCKED`: concurrent workers never claim the same
/// row. Claiming increments `attempts`.
pub fn claim_worker_job(conn: &Connection, kind: &str) -> Result<Option<ClaimedJob>> {
    conn.query_row(
        r#"
        UPDATE worker_jobs SET
            status = 'running',
            attempts = attempts + 1,
            claimed_at = ?1
        WHERE id = (
            SELECT id FROM worker_jobs
            WHERE status = 'pending' AND kind = ?2
            ORDER BY created_at
            LIMIT 1
        )
        RETURNING id, conversation_id, kind, attempts
        "#,
        params![ts(&Utc::now()), kind],
        |row| {
            Ok(ClaimedJob {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                kind: row.get(2)?,
                attempts: row.get::<_, i64>(3)? as u32,
            })
        },
    )
    .optional()
    .map_err(Error::from)
}

pub fn complete_worker_job(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE worker_jobs SET status = 'success', finished_at = ?1 WHERE id = ?2",
        params![ts(&Utc::now()), id],
    )?;
    Ok(())
}

/// Record a failure. Transient failures under the attempt cap go back
/// to pending; everything else is terminal.
pub fn fail_worker_job(conn: &Connection, id: &str, error: &str, retry: bool) -> Result<()> {
    let status = if retry { "pending" } else { "failed" };
    conn.execute(
        "UPDATE worker_jobs SET status = ?1, last_error = ?2, finished_at = ?3 WHERE id = ?4",
        params![status, error, ts(&Utc::now()), id],
    )?;
    Ok(())
}

pub fn pending_worker_jobs(conn: &Connection, kind: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM worker_jobs WHERE status = 'pending' AND kind = ?1",
        [kind],
        |r| r.get(0),
    )
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn seed_workspace(db: &Database) -> String {
        db.transaction(|tx| {
            let org = create_organization(tx, "acme")?;
            let ws = create_workspace(tx, &org.id, "dev")?;
            Ok(ws.id)
        })
        .unwrap()
    }

    fn seed_conversation(db: &Database, workspace_id: &str) -> Conversation {
        let conv = Conversation {
            id: new_id(),
            workspace_id: workspace_id.to_string(),
            project_id: None,
            developer_id: None,
            agent_type: "claude-code".into(),
            agent_version: Some("2.0.14".into()),
            start_time: Utc::now(),
            end_time: None,
            status: ConversationStatus::Open,
            success: None,
            conversation_type: ConversationType::Main,
            parent_conversation_id: None,
            collector_session_id: None,
            collector_id: None,
            last_event_sequence: 0,
            message_count: 0,
            epoch_count: 0,
            files_count: 0,
            agent_metadata: serde_json::json!({}),
            extra_data: serde_json::json!({"session_id": "sess-1"}),
            tags: serde_json::json!({}),
            plans: serde_json::json!([]),
        };
        db.transaction(|tx| insert_conversation(tx, &conv)).unwrap();
        conv
    }

    #[test]
    fn test_get_or_create_project_idempotent() {
        let db = test_db();
        let ws = seed_workspace(&db);

        let (a, b) = db
            .transaction(|tx| {
                let a = get_or_create_project(tx, &ws, "/home/dev/proj")?;
                let b = get_or_create_project(tx, &ws, "/home/dev/proj")?;
                Ok((a, b))
            })
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "proj");
    }

    #[test]
    fn test_get_or_create_developer_scoped_by_workspace() {
        let db = test_db();
        let ws1 = seed_workspace(&db);
        let ws2 = seed_workspace(&db);

        let (d1, d2) = db
            .transaction(|tx| {
                let d1 = get_or_create_developer(tx, &ws1, "alice")?;
                let d2 = get_or_create_developer(tx, &ws2, "alice")?;
                Ok((d1, d2))
            })
            .unwrap();

        assert_ne!(d1.id, d2.id);
    }

    #[test]
    fn test_conversation_round_trip() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws);

        let loaded = db
            .with_conn(|conn| get_conversation(conn, &ws, &conv.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.agent_type, "claude-code");
        assert_eq!(loaded.session_id(), Some("sess-1"));

        // Cross-workspace lookup must miss
        let other_ws = seed_workspace(&db);
        let missed = db
            .with_conn(|conn| get_conversation(conn, &other_ws, &conv.id))
            .unwrap();
        assert!(missed.is_none());
    }

    #[test]
    fn test_lookup_by_session_id() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws);

        let found = db
            .with_conn(|conn| get_conversation_by_session_id(conn, &ws, "sess-1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, conv.id);
    }

    #[test]
    fn test_counts_recompute() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws);

        db.transaction(|tx| {
            let epoch = get_or_create_default_epoch(tx, &conv.id, Utc::now())?;
            for seq in 1..=3 {
                insert_message(
                    tx,
                    &Message {
                        id: new_id(),
                        conversation_id: conv.id.clone(),
                        epoch_id: epoch.id.clone(),
                        sequence: seq,
                        role: MessageRole::User,
                        content: format!("msg {}", seq),
                        timestamp: None,
                        model: None,
                        tool_calls: serde_json::json!([]),
                        tool_results: serde_json::json!([]),
                        code_changes: serde_json::json!([]),
                        thinking_content: None,
                        tokens_in: None,
                        tokens_out: None,
                        raw_data: serde_json::json!({}),
                    },
                )?;
            }
            insert_file_touched(tx, &conv.id, "/src/a.rs", "edit")?;
            update_conversation_counts(tx, &conv.id)?;
            Ok(())
        })
        .unwrap();

        let loaded = db
            .with_conn(|conn| get_conversation(conn, &ws, &conv.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.message_count, 3);
        assert_eq!(loaded.epoch_count, 1);
        assert_eq!(loaded.files_count, 1);
    }

    #[test]
    fn test_last_event_sequence_monotonic() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws);

        db.transaction(|tx| bump_last_event_sequence(tx, &conv.id, 5))
            .unwrap();
        db.transaction(|tx| bump_last_event_sequence(tx, &conv.id, 3))
            .unwrap();

        let loaded = db
            .with_conn(|conn| get_conversation(conn, &ws, &conv.id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_event_sequence, 5);
    }

    #[test]
    fn test_worker_job_claim_once() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws);

        db.transaction(|tx| enqueue_worker_job(tx, &conv.id, "tagging"))
            .unwrap();

        let first = db
            .with_conn(|conn| claim_worker_job(conn, "tagging"))
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.as_ref().unwrap().attempts, 1);

        let second = db
            .with_conn(|conn| claim_worker_job(conn, "tagging"))
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let ws = seed_workspace(&db);

        let result: Result<()> = db.transaction(|tx| {
            get_or_create_project(tx, &ws, "/tmp/rollback")?;
            Err(Error::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))
                    .map_err(Error::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_recommendation_workspace_isolation() {
        let db = test_db();
        let ws1 = seed_workspace(&db);
        let ws2 = seed_workspace(&db);
        let conv = seed_conversation(&db, &ws1);

        let rec = Recommendation {
            id: new_id(),
            workspace_id: ws1.clone(),
            conversation_id: conv.id.clone(),
            kind: "workflow".into(),
            title: "t".into(),
            body: "b".into(),
            confidence: 0.9,
            status: "open".into(),
            created_at: Utc::now(),
        };
        db.transaction(|tx| insert_recommendation(tx, &rec)).unwrap();

        // Update via the wrong workspace: NotFound, never the row
        let err = db
            .transaction(|tx| update_recommendation_status(tx, &ws2, &rec.id, "accepted"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
