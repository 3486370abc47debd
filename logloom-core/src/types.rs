//! Core domain types for logloom
//!
//! These types form the persisted data model. The workspace is the
//! tenancy root: every downstream entity carries a `workspace_id` and
//! every read is workspace-scoped.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Organization** | Billing/admin container owning Workspaces |
//! | **Workspace** | Tenancy boundary; all data belongs to exactly one |
//! | **Project** | A working directory within a workspace |
//! | **Developer** | A username within a workspace |
//! | **Conversation** | One session of an AI assistant; the aggregate root |
//! | **Epoch** | An ordered segment within a conversation |
//! | **Message** | One turn within an epoch |
//! | **RawLog** | Persisted state of a source file enabling incremental re-ingest |
//! | **IngestionJob** | Audit record for a single ingest attempt |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================
// Tenancy
// ============================================

/// Billing/admin container. Deleting an organization cascades to its
/// workspaces and transitively to all data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub settings: serde_json::Value,
}

/// Tenancy boundary. Immutable id, mutable name/settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub settings: serde_json::Value,
}

/// A working directory inside a workspace, uniquely identified by
/// `(workspace_id, directory_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub workspace_id: String,
    /// Human-friendly name, derived from the final path component
    pub name: String,
    pub directory_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// A developer within a workspace, uniquely identified by
/// `(workspace_id, username)`. Lookup-or-insert must be race-safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Developer {
    pub id: String,
    pub workspace_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Conversations
// ============================================

/// Lifecycle status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Still receiving events / appends
    Open,
    Completed,
    Abandoned,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // Collector-originated conversations use "active" until completed
            "open" | "active" => Ok(ConversationStatus::Open),
            "completed" => Ok(ConversationStatus::Completed),
            "abandoned" => Ok(ConversationStatus::Abandoned),
            _ => Err(format!("unknown conversation status: {}", s)),
        }
    }
}

/// Kind of conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    /// Top-level human session
    Main,
    /// Delegated sub-session spawned by a parent conversation
    Agent,
    /// Log file that contained no conversational messages after filtering
    Metadata,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Main => "main",
            ConversationType::Agent => "agent",
            ConversationType::Metadata => "metadata",
        }
    }
}

impl std::str::FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(ConversationType::Main),
            "agent" => Ok(ConversationType::Agent),
            "metadata" => Ok(ConversationType::Metadata),
            _ => Err(format!("unknown conversation type: {}", s)),
        }
    }
}

/// The aggregate root of one assistant session.
///
/// Owns its epochs, messages, files, raw logs, tags, and canonical
/// caches; deleting a conversation cascades to all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub workspace_id: String,
    pub project_id: Option<String>,
    pub developer_id: Option<String>,
    pub agent_type: String,
    pub agent_version: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    /// Tri-state outcome; null until known
    pub success: Option<bool>,
    pub conversation_type: ConversationType,
    /// Null or a conversation in the same workspace. The pointer may
    /// only reference an earlier-created conversation, so cycles are
    /// impossible by construction.
    pub parent_conversation_id: Option<String>,
    /// Unique when set; links collector-originated conversations to
    /// their caller-chosen session id
    pub collector_session_id: Option<String>,
    pub collector_id: Option<String>,
    /// Highest event sequence applied so far; monotonic
    pub last_event_sequence: u64,

    // Denormalized counts, recomputed after each persist
    pub message_count: i64,
    pub epoch_count: i64,
    pub files_count: i64,

    pub agent_metadata: serde_json::Value,
    pub extra_data: serde_json::Value,
    pub tags: serde_json::Value,
    pub plans: serde_json::Value,
}

impl Conversation {
    /// Session id as recorded at ingest time (from the log or collector).
    pub fn session_id(&self) -> Option<&str> {
        self.extra_data.get("session_id").and_then(|v| v.as_str())
    }

    /// Parent session hint recorded by the parser, if any.
    pub fn parent_session_hint(&self) -> Option<&str> {
        self.agent_metadata
            .get("parent_session_id")
            .and_then(|v| v.as_str())
    }

    /// How many times the orphan sweep has tried to link this agent.
    pub fn linking_attempts(&self) -> i64 {
        self.agent_metadata
            .get("_linking_attempts")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

/// An ordered segment within a conversation; `(conversation_id,
/// sequence)` is unique and every conversation has at least one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub id: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub classification: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub extra_data: serde_json::Value,
}

// ============================================
// Messages
// ============================================

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// One turn within an epoch. `(conversation_id, sequence)` is unique
/// and strictly monotonic per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub epoch_id: String,
    pub sequence: i64,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub model: Option<String>,
    /// Structured tool invocations (shape: [`crate::parse::ToolCallData`])
    pub tool_calls: serde_json::Value,
    pub tool_results: serde_json::Value,
    /// Structured file edits (shape: [`crate::parse::CodeChangeData`])
    pub code_changes: serde_json::Value,
    pub thinking_content: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub raw_data: serde_json::Value,
}

impl Message {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_array().map(|a| !a.is_empty()).unwrap_or(false)
    }

    pub fn has_code_changes(&self) -> bool {
        self.code_changes
            .as_array()
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    }
}

/// A file touched by code changes in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTouched {
    pub id: String,
    pub conversation_id: String,
    pub file_path: String,
    pub change_type: String,
}

// ============================================
// Raw logs & jobs
// ============================================

/// Persisted state of one source file, one-to-one with its
/// conversation for file-sourced ingestions. Holds everything the
/// change detector needs on the next pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    pub file_path: String,
    /// SHA-256 of the full file content; unique (content-level dedup)
    pub file_hash: String,
    pub last_processed_offset: u64,
    pub last_processed_line: u64,
    pub file_size_bytes: u64,
    /// SHA-256 of bytes `[0, last_processed_offset)`
    pub partial_hash: Option<String>,
    /// Parser info name recorded at first ingest; incremental parses
    /// must come from the same parser
    pub agent_type: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Outcome status of an ingestion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Success,
    Duplicate,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Duplicate => "duplicate",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "success" => Ok(JobStatus::Success),
            "duplicate" => Ok(JobStatus::Duplicate),
            "skipped" => Ok(JobStatus::Skipped),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown job status: {}", s)),
        }
    }
}

/// Where an ingest attempt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Watch,
    Cli,
    Upload,
    Collector,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Watch => "watch",
            SourceType::Cli => "cli",
            SourceType::Upload => "upload",
            SourceType::Collector => "collector",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watch" => Ok(SourceType::Watch),
            "cli" => Ok(SourceType::Cli),
            "upload" => Ok(SourceType::Upload),
            "collector" => Ok(SourceType::Collector),
            _ => Err(format!("unknown source type: {}", s)),
        }
    }
}

/// Audit record for every ingest attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: String,
    pub workspace_id: String,
    pub status: JobStatus,
    pub source_type: SourceType,
    pub source_config_id: Option<String>,
    pub file_path: Option<String>,
    pub created_by: Option<String>,
    pub conversation_id: Option<String>,
    pub raw_log_id: Option<String>,
    pub incremental: bool,
    pub messages_added: i64,
    /// Per-stage durations plus parser observability fields
    pub stage_metrics: serde_json::Value,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================
// Canonical cache & analytics
// ============================================

/// Cached canonical narrative for `(conversation_id, canonical_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalCacheEntry {
    pub id: String,
    pub conversation_id: String,
    pub canonical_type: String,
    /// Algorithm version at generation time
    pub version: i64,
    pub narrative: String,
    pub token_count: i64,
    /// Source-side state captured at generation, used for
    /// window-based invalidation
    pub source_message_count: i64,
    pub source_token_estimate: i64,
    pub generated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Workspace-scoped analytics output referencing a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub confidence: f64,
    /// open | accepted | dismissed
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A registered remote collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfigRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub collector_type: String,
    /// SHA-256 of the API key; the plaintext is shown exactly once
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub is_active: bool,
    pub extra_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One watched directory bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfigRecord {
    pub id: String,
    pub workspace_id: String,
    pub directory: String,
    pub project_name: Option<String>,
    pub developer_username: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Cancellation
// ============================================

/// Cooperative cancellation signal threaded through long operations.
///
/// On cancel, in-progress transactions roll back, the ingestion job is
/// closed as failed with `reason=cancelled`, and callers see
/// [`crate::Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` if the token has been triggered.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Generate a fresh uuid v4 entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for s in ["open", "completed", "abandoned"] {
            assert_eq!(ConversationStatus::from_str(s).unwrap().as_str(), s);
        }
        // Collector alias
        assert_eq!(
            ConversationStatus::from_str("active").unwrap(),
            ConversationStatus::Open
        );
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(crate::Error::Cancelled)));
        // Clones observe the same flag
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_linking_attempts_default() {
        let conv = Conversation {
            id: new_id(),
            workspace_id: new_id(),
            project_id: None,
            developer_id: None,
            agent_type: "claude-code".into(),
            agent_version: None,
            start_time: Utc::now(),
            end_time: None,
            status: ConversationStatus::Open,
            success: None,
            conversation_type: ConversationType::Agent,
            parent_conversation_id: None,
            collector_session_id: None,
            collector_id: None,
            last_event_sequence: 0,
            message_count: 0,
            epoch_count: 0,
            files_count: 0,
            agent_metadata: serde_json::json!({}),
            extra_data: serde_json::json!({}),
            tags: serde_json::json!({}),
            plans: serde_json::json!([]),
        };
        assert_eq!(conv.linking_attempts(), 0);
        assert!(conv.parent_session_hint().is_none());
    }
}
