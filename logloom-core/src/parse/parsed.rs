//! Parser output types
//!
//! Everything a format parser can produce: the fully parsed
//! conversation, bounded message chunks with explicit cursors, and the
//! incremental suffix result. Cursor state (`next_offset`,
//! `next_line`, `is_last`) is first-class so it can be persisted on
//! the raw log and resumed across ingests.

use crate::parse::plan::PlanRecord;
use crate::types::{ConversationType, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A structured tool invocation extracted from an assistant message,
/// paired with its result where one was found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallData {
    pub tool_name: String,
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// False when the paired result record was flagged as an error
    pub success: bool,
}

/// Kind of code change detected from well-known tool names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Edit tool: in-place modification
    Edit,
    /// Write tool: file creation / full overwrite
    Create,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Edit => "edit",
            ChangeOp::Create => "create",
        }
    }
}

/// A file modification extracted from an edit/write tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChangeData {
    pub file_path: String,
    pub change_type: ChangeOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    pub lines_added: i64,
    pub lines_deleted: i64,
}

impl CodeChangeData {
    /// Rough line delta from the old/new content pair.
    pub fn from_contents(
        file_path: String,
        change_type: ChangeOp,
        old_content: Option<String>,
        new_content: Option<String>,
    ) -> Self {
        let old_lines = old_content.as_deref().map(count_lines).unwrap_or(0);
        let new_lines = new_content.as_deref().map(count_lines).unwrap_or(0);
        Self {
            file_path,
            change_type,
            old_content,
            new_content,
            lines_added: new_lines.saturating_sub(old_lines) as i64,
            lines_deleted: old_lines.saturating_sub(new_lines) as i64,
        }
    }
}

fn count_lines(s: &str) -> usize {
    if s.is_empty() {
        0
    } else {
        s.lines().count()
    }
}

/// Token usage attached to an assistant message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsageData {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// One conversational message as produced by a format parser.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub model: Option<String>,
    pub tool_calls: Vec<ToolCallData>,
    pub code_changes: Vec<CodeChangeData>,
    pub thinking_content: Option<String>,
    pub token_usage: Option<TokenUsageData>,
    /// Complete original record; never loses data
    pub raw_data: serde_json::Value,
}

impl ParsedMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            model: None,
            tool_calls: vec![],
            code_changes: vec![],
            thinking_content: None,
            token_usage: None,
            raw_data: serde_json::Value::Null,
        }
    }
}

/// Session-level metadata extracted from the first lines of a log.
#[derive(Debug, Clone, Default)]
pub struct ConversationMetadata {
    pub agent_type: String,
    pub session_id: Option<String>,
    pub agent_version: Option<String>,
    pub working_directory: Option<String>,
    pub git_branch: Option<String>,
    pub parent_session_id: Option<String>,
}

/// A complete parse of one log file.
#[derive(Debug, Clone)]
pub struct ParsedConversation {
    pub agent_type: String,
    pub agent_version: Option<String>,
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub working_directory: Option<String>,
    pub git_branch: Option<String>,
    pub conversation_type: ConversationType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub messages: Vec<ParsedMessage>,
    pub files_touched: Vec<String>,
    pub plans: Vec<PlanRecord>,
    /// Non-fatal issues; attached to the job's stage metrics
    pub warnings: Vec<String>,
    pub metadata: serde_json::Value,
}

impl ParsedConversation {
    /// A file is metadata-only when filtering removed every
    /// conversational message. The pipeline skips these.
    pub fn is_metadata_only(&self) -> bool {
        self.conversation_type == ConversationType::Metadata && self.messages.is_empty()
    }
}

/// A bounded batch of parsed messages with cursor state.
///
/// `next_offset`/`next_line` form the cursor for the subsequent call;
/// `is_last` is true when EOF has been reached. Peak memory stays
/// bounded per chunk regardless of total file size.
#[derive(Debug)]
pub struct MessageChunk {
    pub messages: Vec<ParsedMessage>,
    pub next_offset: u64,
    pub next_line: u64,
    pub is_last: bool,
    pub partial_hash: String,
    pub file_size: u64,
    pub warnings: Vec<String>,
}

/// Result of parsing only the suffix appended since `last_offset`.
#[derive(Debug)]
pub struct IncrementalResult {
    /// Only the messages parsed in this incremental update
    pub new_messages: Vec<ParsedMessage>,
    pub last_processed_offset: u64,
    pub last_processed_line: u64,
    pub file_size_bytes: u64,
    /// SHA-256 of content up to `last_processed_offset`
    pub partial_hash: String,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_change_line_counts() {
        let change = CodeChangeData::from_contents(
            "src/main.rs".into(),
            ChangeOp::Edit,
            Some("a\nb\nc".into()),
            Some("a\nb".into()),
        );
        assert_eq!(change.lines_added, 0);
        assert_eq!(change.lines_deleted, 1);

        let create = CodeChangeData::from_contents(
            "src/new.rs".into(),
            ChangeOp::Create,
            None,
            Some("x\ny\n".into()),
        );
        assert_eq!(create.lines_added, 2);
        assert_eq!(create.lines_deleted, 0);
    }

    #[test]
    fn test_metadata_only() {
        let conv = ParsedConversation {
            agent_type: "claude-code".into(),
            agent_version: None,
            session_id: None,
            parent_session_id: None,
            working_directory: None,
            git_branch: None,
            conversation_type: ConversationType::Metadata,
            start_time: Utc::now(),
            end_time: None,
            messages: vec![],
            files_touched: vec![],
            plans: vec![],
            warnings: vec![],
            metadata: serde_json::json!({}),
        };
        assert!(conv.is_metadata_only());
    }
}
