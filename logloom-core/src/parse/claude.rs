//! Claude Code JSONL dialect parser
//!
//! Parses session logs where each line is one JSON object carrying
//! camelCase fields (`sessionId`, `parentUuid`, `gitBranch`, ...) and
//! a nested `message` whose content is either a string or a list of
//! typed blocks (`text`, `tool_use`, `tool_result`, `thinking`).
//!
//! # Error Handling
//!
//! The parser is designed to be resilient and recover from errors:
//!
//! - **Malformed JSON lines**: Logged as warning with the line number,
//!   line skipped, parsing continues. Warnings are carried on the
//!   parse result and end up in the ingestion job's stage metrics.
//!
//! - **Non-conversational records**: summaries, file-history
//!   snapshots, and records with no role are filtered out. The same
//!   filter applies on the full, chunked, and incremental paths.
//!
//! - **Incomplete last line**: Parsing stops cleanly before a line not
//!   yet terminated by a newline. The cursor points at the last
//!   complete line so the tail is picked up on the next pass.
//!
//! # Incremental Parsing
//!
//! `parse_incremental` seeks to the stored byte offset and processes
//! only the appended suffix. The returned `partial_hash` covers
//! `[0, next_offset)` so the change detector can verify the prefix on
//! the following ingest.

use crate::error::{Error, Result};
use crate::hashing;
use crate::parse::parsed::{
    ChangeOp, CodeChangeData, ConversationMetadata, IncrementalResult, MessageChunk,
    ParsedConversation, ParsedMessage, TokenUsageData, ToolCallData,
};
use crate::parse::parser::{LogParser, ParserCapability, ParserInfo, ProbeReport};
use crate::parse::plan::extract_plan_operations;
use crate::types::{ConversationType, MessageRole};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Parser for the Claude Code JSONL dialect.
pub struct ClaudeLogParser {
    info: ParserInfo,
}

impl ClaudeLogParser {
    pub fn new() -> Self {
        Self {
            info: ParserInfo::new("claude-code", "2.1.0")
                .with_formats(&[".jsonl"])
                .with_priority(60)
                .with_capabilities(&[ParserCapability::Chunked, ParserCapability::Incremental]),
        }
    }
}

impl Default for ClaudeLogParser {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// One line of the log. `#[serde(default)]` everywhere so partial
/// records deserialize instead of failing.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    parent_session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    version: Option<String>,
    git_branch: Option<String>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    role: Option<String>,
    model: Option<String>,
    content: Option<RawContent>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    // Catch-all for unknown block types
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

/// Record types that never carry conversation content.
fn is_non_conversational(record_type: Option<&str>) -> bool {
    matches!(
        record_type,
        Some("summary") | Some("file-history-snapshot") | Some("metadata")
    )
}

impl LogParser for ClaudeLogParser {
    fn info(&self) -> &ParserInfo {
        &self.info
    }

    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        if path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase())
            != Some("jsonl".to_string())
        {
            return Ok(ProbeReport::no("extension is not .jsonl"));
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => return Ok(ProbeReport::no(format!("cannot open file: {}", e))),
        };
        let reader = BufReader::new(file);

        for line in reader.lines().take(10) {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                if value.get("sessionId").is_some() && value.get("version").is_some() {
                    return Ok(ProbeReport::yes(
                        0.95,
                        "found sessionId and version markers",
                    ));
                }
            }
        }

        Ok(ProbeReport::no("no sessionId/version markers in first 10 lines"))
    }

    fn parse(&self, path: &Path) -> Result<ParsedConversation> {
        let mut warnings = Vec::new();
        let records = read_records(path, 0, &mut warnings)?;
        build_conversation(records, warnings)
    }

    fn parse_metadata(&self, path: &Path) -> Result<ConversationMetadata> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut meta = ConversationMetadata {
            agent_type: "claude-code".to_string(),
            ..Default::default()
        };

        for line in reader.lines().take(10) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RawRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if meta.session_id.is_none() {
                meta.session_id = record.session_id;
            }
            if meta.agent_version.is_none() {
                meta.agent_version = record.version;
            }
            if meta.working_directory.is_none() {
                meta.working_directory = record.cwd;
            }
            if meta.git_branch.is_none() {
                meta.git_branch = record.git_branch;
            }
            if meta.parent_session_id.is_none() {
                meta.parent_session_id = record.parent_session_id;
            }
        }

        if meta.session_id.is_none() {
            return Err(Error::Parse {
                agent: "claude-code".to_string(),
                message: format!("no sessionId in first lines of {}", path.display()),
            });
        }

        Ok(meta)
    }

    fn parse_messages(&self, path: &Path, offset: u64, limit: usize) -> Result<MessageChunk> {
        let mut warnings = Vec::new();
        let file_size = std::fs::metadata(path)?.len();
        let (raw, next_offset, next_line) =
            read_raw_lines(path, offset, Some(limit), &mut warnings)?;

        let records: Vec<(serde_json::Value, RawRecord)> = raw
            .into_iter()
            .filter_map(|(line_no, value)| decode_record(line_no, value, &mut warnings))
            .collect();

        let tool_results = collect_tool_results(&records);
        let mut messages = Vec::new();
        for (raw_json, record) in &records {
            if let Some(msg) = convert_record(raw_json, record, &tool_results, &mut warnings) {
                messages.push(msg);
            }
        }
        messages.sort_by_key(|m| m.timestamp);

        let partial_hash = hashing::partial_hash(path, next_offset)?;

        Ok(MessageChunk {
            messages,
            next_offset,
            next_line,
            is_last: next_offset >= file_size,
            partial_hash,
            file_size,
            warnings,
        })
    }

    fn parse_incremental(
        &self,
        path: &Path,
        last_offset: u64,
        last_line: u64,
    ) -> Result<IncrementalResult> {
        let mut warnings = Vec::new();
        let file_size = std::fs::metadata(path)?.len();

        if last_offset > file_size {
            return Err(Error::InvalidArgument(format!(
                "incremental offset {} exceeds file size {} for {}",
                last_offset,
                file_size,
                path.display()
            )));
        }

        let records = read_records(path, last_offset, &mut warnings)?;
        let next_offset = records.next_offset;
        let next_line = last_line + records.lines_consumed;

        let tool_results = collect_tool_results(&records.records);
        let mut new_messages = Vec::new();
        for (raw_json, record) in &records.records {
            if let Some(msg) = convert_record(raw_json, record, &tool_results, &mut warnings) {
                new_messages.push(msg);
            }
        }
        new_messages.sort_by_key(|m| m.timestamp);

        let partial_hash = hashing::partial_hash(path, next_offset)?;
        let last_message_timestamp = new_messages.iter().filter_map(|m| m.timestamp).max();

        Ok(IncrementalResult {
            new_messages,
            last_processed_offset: next_offset,
            last_processed_line: next_line,
            file_size_bytes: file_size,
            partial_hash,
            last_message_timestamp,
            warnings,
        })
    }
}

// ============================================
// Line reading
// ============================================

struct RecordBatch {
    records: Vec<(serde_json::Value, RawRecord)>,
    next_offset: u64,
    lines_consumed: u64,
}

/// Read complete lines from `offset` to EOF, decoding each into a raw
/// record. Malformed lines produce warnings and are skipped.
fn read_records(path: &Path, offset: u64, warnings: &mut Vec<String>) -> Result<RecordBatch> {
    let (raw, next_offset, lines) = read_raw_lines(path, offset, None, warnings)?;
    let records = raw
        .into_iter()
        .filter_map(|(line_no, value)| decode_record(line_no, value, warnings))
        .collect();
    Ok(RecordBatch {
        records,
        next_offset,
        lines_consumed: lines,
    })
}

/// Read up to `limit` decodable JSON lines starting at byte `offset`.
///
/// Returns `(parsed JSON values with line numbers, next_offset,
/// lines_consumed)`. The cursor only advances past complete
/// newline-terminated lines; a trailing partial line is left for the
/// next pass.
fn read_raw_lines(
    path: &Path,
    offset: u64,
    limit: Option<usize>,
    warnings: &mut Vec<String>,
) -> Result<(Vec<(u64, serde_json::Value)>, u64, u64)> {
    let mut file = File::open(path)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    let mut reader = BufReader::new(file);

    let mut out = Vec::new();
    let mut current_offset = offset;
    let mut line_no: u64 = 0;
    let mut buf = String::new();

    loop {
        if let Some(limit) = limit {
            if out.len() >= limit {
                break;
            }
        }

        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        // A line without a trailing newline is still being written;
        // stop before it so the cursor stays on a record boundary.
        if !buf.ends_with('\n') {
            break;
        }

        line_no += 1;
        current_offset += read as u64;

        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => out.push((line_no, value)),
            Err(e) => {
                warnings.push(format!(
                    "line {} (offset {}): JSON parse error: {}",
                    line_no,
                    current_offset - read as u64,
                    e
                ));
                tracing::warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "Skipping malformed JSONL line"
                );
            }
        }
    }

    Ok((out, current_offset, line_no))
}

/// Decode a JSON value into a raw record, applying the
/// non-conversational filter. Returns the original value alongside for
/// lossless capture.
fn decode_record(
    line_no: u64,
    value: serde_json::Value,
    warnings: &mut Vec<String>,
) -> Option<(serde_json::Value, RawRecord)> {
    let record_type = value.get("type").and_then(|v| v.as_str());
    if is_non_conversational(record_type) {
        return None;
    }

    match serde_json::from_value::<RawRecord>(value.clone()) {
        Ok(record) => Some((value, record)),
        Err(e) => {
            warnings.push(format!("line {}: deserialization error: {}", line_no, e));
            None
        }
    }
}

// ============================================
// Record conversion
// ============================================

/// First pass: collect tool_result blocks (they arrive in later user
/// records) keyed by tool_use_id, so tool calls can be paired.
fn collect_tool_results(
    records: &[(serde_json::Value, RawRecord)],
) -> HashMap<String, (String, bool)> {
    let mut map = HashMap::new();
    for (_, record) in records {
        let Some(message) = &record.message else {
            continue;
        };
        let Some(RawContent::Blocks(blocks)) = &message.content else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            {
                map.insert(
                    tool_use_id.clone(),
                    (stringify_result_content(content), *is_error),
                );
            }
        }
    }
    map
}

fn stringify_result_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert one raw record into a conversational message, or None when
/// the record carries nothing conversational (pure tool-result
/// records, role-less records, unknown types).
fn convert_record(
    raw_json: &serde_json::Value,
    record: &RawRecord,
    tool_results: &HashMap<String, (String, bool)>,
    warnings: &mut Vec<String>,
) -> Option<ParsedMessage> {
    if !matches!(record.record_type.as_deref(), Some("user") | Some("assistant")) {
        return None;
    }
    let message = record.message.as_ref()?;
    let role = match message.role.as_deref() {
        Some("user") => MessageRole::User,
        Some("assistant") => MessageRole::Assistant,
        Some(other) => {
            warnings.push(format!("unknown role {:?}, record skipped", other));
            return None;
        }
        None => return None,
    };

    let timestamp = record
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCallData> = Vec::new();
    let mut thinking_content: Option<String> = None;

    match &message.content {
        Some(RawContent::Text(text)) => {
            if !text.is_empty() {
                text_parts.push(text);
            }
        }
        Some(RawContent::Blocks(blocks)) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            text_parts.push(text);
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let (result, is_error) = tool_results
                            .get(id)
                            .map(|(content, err)| (Some(content.clone()), *err))
                            .unwrap_or((None, false));
                        tool_calls.push(ToolCallData {
                            tool_name: name.clone(),
                            parameters: input.clone(),
                            tool_use_id: Some(id.clone()),
                            result,
                            success: !is_error,
                        });
                    }
                    ContentBlock::Thinking { thinking } => {
                        if !thinking.is_empty() {
                            thinking_content = Some(thinking.clone());
                        }
                    }
                    // Tool-result blocks fold into the paired call
                    ContentBlock::ToolResult { .. } => {}
                    ContentBlock::Unknown => {}
                }
            }
        }
        None => {}
    }

    // Records that only relay a tool result (or carry nothing at all)
    // are not emitted as standalone messages.
    if text_parts.is_empty() && tool_calls.is_empty() && thinking_content.is_none() {
        return None;
    }

    let code_changes = detect_code_changes(&tool_calls);
    let token_usage = message.usage.as_ref().map(|u| TokenUsageData {
        input_tokens: u.input_tokens.unwrap_or(0),
        output_tokens: u.output_tokens.unwrap_or(0),
    });

    Some(ParsedMessage {
        role,
        content: text_parts.join("\n"),
        timestamp,
        model: message.model.clone(),
        tool_calls,
        code_changes,
        thinking_content,
        token_usage,
        raw_data: raw_json.clone(),
    })
}

/// Map well-known tool names to code changes: edit-tool → *edit*,
/// write-tool → *create*.
pub(crate) fn detect_code_changes(tool_calls: &[ToolCallData]) -> Vec<CodeChangeData> {
    let mut changes = Vec::new();
    for call in tool_calls {
        match call.tool_name.as_str() {
            "Edit" => {
                if let Some(file_path) = call.parameters.get("file_path").and_then(|v| v.as_str()) {
                    changes.push(CodeChangeData::from_contents(
                        file_path.to_string(),
                        ChangeOp::Edit,
                        call.parameters
                            .get("old_string")
                            .and_then(|v| v.as_str())
                            .map(ToString::to_string),
                        call.parameters
                            .get("new_string")
                            .and_then(|v| v.as_str())
                            .map(ToString::to_string),
                    ));
                }
            }
            "Write" => {
                if let Some(file_path) = call.parameters.get("file_path").and_then(|v| v.as_str()) {
                    changes.push(CodeChangeData::from_contents(
                        file_path.to_string(),
                        ChangeOp::Create,
                        None,
                        call.parameters
                            .get("content")
                            .and_then(|v| v.as_str())
                            .map(ToString::to_string),
                    ));
                }
            }
            _ => {}
        }
    }
    changes
}

/// Assemble the final conversation from decoded records.
fn build_conversation(
    batch: RecordBatch,
    mut warnings: Vec<String>,
) -> Result<ParsedConversation> {
    let records = batch.records;

    // Session metadata from the first records in which it appears
    let mut session_id = None;
    let mut agent_version = None;
    let mut working_directory = None;
    let mut git_branch = None;
    let mut parent_session_id = None;
    let mut saw_sidechain = false;

    for (_, record) in records.iter().take(10) {
        if session_id.is_none() {
            session_id = record.session_id.clone();
        }
        if agent_version.is_none() {
            agent_version = record.version.clone();
        }
        if working_directory.is_none() {
            working_directory = record.cwd.clone();
        }
        if git_branch.is_none() {
            git_branch = record.git_branch.clone();
        }
        if parent_session_id.is_none() {
            parent_session_id = record.parent_session_id.clone();
        }
    }
    for (_, record) in &records {
        if record.is_sidechain == Some(true) {
            saw_sidechain = true;
            break;
        }
    }

    let tool_results = collect_tool_results(&records);
    let mut messages = Vec::new();
    for (raw_json, record) in &records {
        if let Some(msg) = convert_record(raw_json, record, &tool_results, &mut warnings) {
            messages.push(msg);
        }
    }
    // Final ordering is by timestamp ascending; file order breaks ties
    messages.sort_by_key(|m| m.timestamp);

    let timestamps: Vec<DateTime<Utc>> = messages.iter().filter_map(|m| m.timestamp).collect();
    let start_time = timestamps.iter().min().copied().unwrap_or_else(Utc::now);
    let end_time = timestamps.iter().max().copied();

    let mut files_touched: Vec<String> = Vec::new();
    for msg in &messages {
        for change in &msg.code_changes {
            if !files_touched.contains(&change.file_path) {
                files_touched.push(change.file_path.clone());
            }
        }
    }

    let plans = extract_plan_operations(&messages);

    let conversation_type = if messages.is_empty() {
        ConversationType::Metadata
    } else if parent_session_id.is_some() || saw_sidechain {
        ConversationType::Agent
    } else {
        ConversationType::Main
    };

    Ok(ParsedConversation {
        agent_type: "claude-code".to_string(),
        agent_version,
        session_id,
        parent_session_id,
        working_directory,
        git_branch,
        conversation_type,
        start_time,
        end_time,
        messages,
        files_touched,
        plans,
        warnings,
        metadata: serde_json::json!({}),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_fixture(dir: &TempDir, name: &str, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    fn user_line(session: &str, ts: &str, text: &str) -> String {
        format!(
            r#"{{"type":"user","uuid":"u-{ts}","sessionId":"{session}","version":"2.0.14","cwd":"/home/dev/proj","gitBranch":"main","timestamp":"{ts}","message":{{"role":"user","content":"{text}"}}}}"#
        )
    }

    fn assistant_line(session: &str, ts: &str, text: &str) -> String {
        format!(
            r#"{{"type":"assistant","uuid":"a-{ts}","sessionId":"{session}","version":"2.0.14","timestamp":"{ts}","message":{{"role":"assistant","model":"claude-sonnet-4","content":[{{"type":"text","text":"{text}"}}],"usage":{{"input_tokens":50,"output_tokens":25}}}}}}"#
        )
    }

    #[test]
    fn test_probe_positive() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[&user_line("sess-1", "2025-01-01T10:00:00Z", "hello")],
        );
        let parser = ClaudeLogParser::new();
        let report = parser.probe(&path).unwrap();
        assert!(report.can_parse);
        assert!(report.confidence > 0.9);
    }

    #[test]
    fn test_probe_negative_wrong_format() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, "s.jsonl", &[r#"{"some":"other","format":true}"#]);
        let parser = ClaudeLogParser::new();
        assert!(!parser.probe(&path).unwrap().can_parse);
    }

    #[test]
    fn test_parse_minimal_session() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                &user_line("sess-1", "2025-01-01T10:00:00Z", "Hello"),
                &assistant_line("sess-1", "2025-01-01T10:00:05Z", "Hi there"),
            ],
        );
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();

        assert_eq!(conv.session_id.as_deref(), Some("sess-1"));
        assert_eq!(conv.agent_version.as_deref(), Some("2.0.14"));
        assert_eq!(conv.working_directory.as_deref(), Some("/home/dev/proj"));
        assert_eq!(conv.git_branch.as_deref(), Some("main"));
        assert_eq!(conv.conversation_type, ConversationType::Main);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, MessageRole::User);
        assert_eq!(conv.messages[1].role, MessageRole::Assistant);
        assert_eq!(
            conv.messages[1].token_usage.as_ref().unwrap().input_tokens,
            50
        );
    }

    #[test]
    fn test_malformed_lines_are_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                &user_line("sess-1", "2025-01-01T10:00:00Z", "first"),
                "this is not json {{{",
                &assistant_line("sess-1", "2025-01-01T10:00:05Z", "second"),
            ],
        );
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();

        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.warnings.len(), 1);
        assert!(conv.warnings[0].contains("line 2"));
    }

    #[test]
    fn test_filter_non_conversational() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                r#"{"type":"summary","summary":"Session about parsing","leafUuid":"x"}"#,
                r#"{"type":"file-history-snapshot","messageId":"y","snapshot":{}}"#,
                &user_line("sess-1", "2025-01-01T10:00:00Z", "real message"),
            ],
        );
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.conversation_type, ConversationType::Main);
    }

    #[test]
    fn test_metadata_only_file() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                r#"{"type":"summary","summary":"only a summary","sessionId":"sess-m","version":"2.0.14"}"#,
                r#"{"type":"file-history-snapshot","messageId":"z"}"#,
            ],
        );
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();
        assert!(conv.is_metadata_only());
    }

    #[test]
    fn test_tool_call_pairing_and_code_changes() {
        let dir = TempDir::new().unwrap();
        let assistant = r#"{"type":"assistant","sessionId":"sess-1","version":"2.0.14","timestamp":"2025-01-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"tool_use","id":"toolu_1","name":"Edit","input":{"file_path":"/proj/src/lib.rs","old_string":"old","new_string":"new"}}]}}"#;
        let result = r#"{"type":"user","sessionId":"sess-1","timestamp":"2025-01-01T10:00:06Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"edit applied","is_error":false}]}}"#;
        let failing = r#"{"type":"assistant","sessionId":"sess-1","timestamp":"2025-01-01T10:00:07Z","message":{"role":"assistant","content":[{"type":"tool_use","id":"toolu_2","name":"Bash","input":{"command":"cargo test"}}]}}"#;
        let fail_result = r#"{"type":"user","sessionId":"sess-1","timestamp":"2025-01-01T10:00:08Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_2","content":"compile error","is_error":true}]}}"#;
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                &user_line("sess-1", "2025-01-01T10:00:00Z", "edit the file"),
                assistant,
                result,
                failing,
                fail_result,
            ],
        );

        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();

        // tool_result-only records are folded into their calls
        let with_tools: Vec<_> = conv
            .messages
            .iter()
            .filter(|m| !m.tool_calls.is_empty())
            .collect();
        assert_eq!(with_tools.len(), 2);

        let edit_call = &with_tools[0].tool_calls[0];
        assert_eq!(edit_call.tool_name, "Edit");
        assert_eq!(edit_call.result.as_deref(), Some("edit applied"));
        assert!(edit_call.success);

        let bash_call = &with_tools[1].tool_calls[0];
        assert!(!bash_call.success);

        assert_eq!(with_tools[0].code_changes.len(), 1);
        assert_eq!(with_tools[0].code_changes[0].change_type, ChangeOp::Edit);
        assert_eq!(conv.files_touched, vec!["/proj/src/lib.rs"]);
    }

    #[test]
    fn test_thinking_blocks() {
        let dir = TempDir::new().unwrap();
        let line = r#"{"type":"assistant","sessionId":"sess-1","version":"2.0.14","timestamp":"2025-01-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"thinking","thinking":"let me reason about this"},{"type":"text","text":"answer"}]}}"#;
        let path = write_fixture(&dir, "s.jsonl", &[line]);
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();
        assert_eq!(
            conv.messages[0].thinking_content.as_deref(),
            Some("let me reason about this")
        );
        assert_eq!(conv.messages[0].content, "answer");
    }

    #[test]
    fn test_agent_conversation_via_parent_session() {
        let dir = TempDir::new().unwrap();
        let line = r#"{"type":"user","sessionId":"agent-sess","parentSessionId":"parent-sess","version":"2.0.14","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"delegated task"}}"#;
        let path = write_fixture(&dir, "s.jsonl", &[line]);
        let parser = ClaudeLogParser::new();
        let conv = parser.parse(&path).unwrap();
        assert_eq!(conv.conversation_type, ConversationType::Agent);
        assert_eq!(conv.parent_session_id.as_deref(), Some("parent-sess"));
    }

    #[test]
    fn test_parse_metadata_first_lines_only() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[&user_line("sess-9", "2025-01-01T10:00:00Z", "hi")],
        );
        let parser = ClaudeLogParser::new();
        let meta = parser.parse_metadata(&path).unwrap();
        assert_eq!(meta.session_id.as_deref(), Some("sess-9"));
        assert_eq!(meta.working_directory.as_deref(), Some("/home/dev/proj"));
    }

    #[test]
    fn test_chunked_parse_with_cursor() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|i| {
                user_line(
                    "sess-1",
                    &format!("2025-01-01T10:00:0{}Z", i),
                    &format!("msg {}", i),
                )
            })
            .collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let path = write_fixture(&dir, "s.jsonl", &refs);

        let parser = ClaudeLogParser::new();
        let first = parser.parse_messages(&path, 0, 2).unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(!first.is_last);

        let second = parser.parse_messages(&path, first.next_offset, 10).unwrap();
        assert_eq!(second.messages.len(), 3);
        assert!(second.is_last);
        assert_eq!(second.next_offset, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_incremental_parses_only_suffix() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            "s.jsonl",
            &[
                &user_line("sess-1", "2025-01-01T10:00:00Z", "one"),
                &assistant_line("sess-1", "2025-01-01T10:00:05Z", "two"),
            ],
        );
        let parser = ClaudeLogParser::new();
        let full = parser
            .parse_incremental(&path, 0, 0)
            .expect("initial incremental");
        assert_eq!(full.new_messages.len(), 2);
        let offset = full.last_processed_offset;
        assert_eq!(offset, std::fs::metadata(&path).unwrap().len());

        // Append one more
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", user_line("sess-1", "2025-01-01T10:00:10Z", "three")).unwrap();

        let inc = parser
            .parse_incremental(&path, offset, full.last_processed_line)
            .unwrap();
        assert_eq!(inc.new_messages.len(), 1);
        assert_eq!(inc.new_messages[0].content, "three");
        assert_eq!(
            inc.last_processed_offset,
            std::fs::metadata(&path).unwrap().len()
        );
    }

    #[test]
    fn test_incomplete_last_line_not_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", user_line("sess-1", "2025-01-01T10:00:00Z", "done")).unwrap();
        // No trailing newline: still being written
        write!(f, r#"{{"type":"user","sessionId":"sess-1","#).unwrap();
        f.flush().unwrap();

        let parser = ClaudeLogParser::new();
        let result = parser.parse_incremental(&path, 0, 0).unwrap();
        assert_eq!(result.new_messages.len(), 1);
        assert!(result.last_processed_offset < std::fs::metadata(&path).unwrap().len());
        assert!(result.warnings.is_empty());
    }
}
