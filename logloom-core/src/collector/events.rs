//! Collector wire protocol types
//!
//! Remote agents stream the conversation shape as sequenced event
//! batches instead of files. Events carry a content hash used for
//! dedup; when a client omits it the server computes the same hash so
//! re-sent batches stay idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of collector event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    Message,
    ToolCall,
    ToolResult,
    Thinking,
    Error,
    Metadata,
    SessionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::Message => "message",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Thinking => "thinking",
            EventKind::Error => "error",
            EventKind::Metadata => "metadata",
            EventKind::SessionEnd => "session_end",
        }
    }
}

/// One collector event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorEvent {
    pub sequence: u64,

    #[serde(rename = "type")]
    pub kind: EventKind,

    /// When the event was originally produced at the source
    pub emitted_at: DateTime<Utc>,

    /// When the collector observed the event
    pub observed_at: DateTime<Utc>,

    /// Content-based hash for deduplication (32-char hex); computed
    /// server-side when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_hash: Option<String>,

    /// Type-specific payload (see the event-kind table in the
    /// collector service)
    pub data: serde_json::Value,
}

impl CollectorEvent {
    /// The event's hash, computing it when the client omitted one.
    pub fn hash(&self) -> String {
        self.event_hash
            .clone()
            .unwrap_or_else(|| compute_event_hash(self.kind, &self.emitted_at, &self.data))
    }
}

/// SHA-256 over `kind:emitted_at:canonical-JSON(data)` truncated to 32
/// hex chars. serde_json serializes maps with sorted keys, which is
/// the canonical form both sides agree on.
pub fn compute_event_hash(
    kind: EventKind,
    emitted_at: &DateTime<Utc>,
    data: &serde_json::Value,
) -> String {
    let content = serde_json::to_string(data).unwrap_or_default();
    let hash_input = format!("{}:{}:{}", kind.as_str(), emitted_at.to_rfc3339(), content);

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    // First 16 bytes (32 hex chars)
    hex::encode(&result[..16])
}

// ============================================
// Request / response shapes
// ============================================

/// Body of POST /collectors/events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchRequest {
    pub session_id: String,
    pub events: Vec<CollectorEvent>,
}

/// 202 response for an accepted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchResponse {
    pub accepted: usize,
    pub last_sequence: u64,
    pub conversation_id: String,
    pub warnings: Vec<String>,
}

/// 409 payload when a sequence gap is detected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapInfo {
    pub last_received: u64,
    pub expected: u64,
}

/// Response of GET /collectors/sessions/{id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub conversation_id: String,
    pub last_sequence: u64,
    pub event_count: i64,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub status: String,
}

/// Body of POST /collectors/sessions/{id}/complete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCompleteRequest {
    /// Deprecated; retained for wire compatibility, value ignored
    #[serde(default)]
    pub final_sequence: Option<u64>,
    pub outcome: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCompleteResponse {
    pub session_id: String,
    pub conversation_id: String,
    pub status: String,
    pub total_events: i64,
}

/// Body of POST /collectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub collector_type: String,
    pub collector_version: String,
    pub hostname: String,
    pub workspace_id: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Registration response. The full API key is shown exactly once;
/// later reads only return the prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub collector_id: String,
    pub api_key: String,
    pub api_key_prefix: String,
    pub created_at: DateTime<Utc>,
}
