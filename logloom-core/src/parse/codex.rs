//! Codex CLI JSONL dialect parser
//!
//! Parses rollout logs where each line is an envelope
//! `{timestamp, type, payload}`. A `session_meta` payload opens the
//! file; conversational content arrives as `response_item` payloads
//! (`message`, `function_call`, `function_call_output`, `reasoning`).
//!
//! Shares the resilience rules of the Claude parser: malformed lines
//! warn and continue, non-conversational envelopes are filtered, the
//! cursor never advances past an incomplete last line.

use crate::error::{Error, Result};
use crate::hashing;
use crate::parse::claude::detect_code_changes;
use crate::parse::parsed::{
    ConversationMetadata, IncrementalResult, MessageChunk, ParsedConversation, ParsedMessage,
    ToolCallData,
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

/// Parser for the Codex CLI JSONL dialect.
pub struct CodexLogParser {
    info: ParserInfo,
}

impl CodexLogParser {
    pub fn new() -> Self {
        Self {
            info: ParserInfo::new("codex", "1.3.0")
                .with_formats(&[".jsonl"])
                .with_priority(50)
                .with_capabilities(&[ParserCapability::Chunked, ParserCapability::Incremental]),
        }
    }
}

impl Default for CodexLogParser {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// Raw JSONL record types
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawEnvelope {
    timestamp: Option<String>,
    #[serde(rename = "type")]
    envelope_type: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SessionMetaPayload {
    id: Option<String>,
    cwd: Option<String>,
    cli_version: Option<String>,
    parent_session_id: Option<String>,
    git: Option<GitInfo>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct GitInfo {
    branch: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ResponseItemPayload {
    #[serde(rename = "type")]
    item_type: Option<String>,
    role: Option<String>,
    content: Option<Vec<CodexContentBlock>>,
    name: Option<String>,
    arguments: Option<String>,
    call_id: Option<String>,
    output: Option<String>,
    summary: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexContentBlock {
    #[serde(rename = "input_text")]
    InputText { text: String },
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Unknown,
}

impl LogParser for CodexLogParser {
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
                let envelope_type = value.get("type").and_then(|v| v.as_str());
                if envelope_type == Some("session_meta") && value.get("payload").is_some() {
                    return Ok(ProbeReport::yes(0.9, "found session_meta envelope"));
                }
                if envelope_type == Some("response_item") {
                    return Ok(ProbeReport::yes(0.7, "found response_item envelope"));
                }
            }
        }

        Ok(ProbeReport::no("no codex envelopes in first 10 lines"))
    }

    fn parse(&self, path: &Path) -> Result<ParsedConversation> {
        let mut warnings = Vec::new();
        let (envelopes, _, _) = read_envelopes(path, 0, None, &mut warnings)?;
        build_conversation(envelopes, warnings)
    }

    fn parse_metadata(&self, path: &Path) -> Result<ConversationMetadata> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines().take(10) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let envelope: RawEnvelope = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if envelope.envelope_type.as_deref() == Some("session_meta") {
                let meta: SessionMetaPayload =
                    serde_json::from_value(envelope.payload).unwrap_or_default();
                return Ok(ConversationMetadata {
                    agent_type: "codex".to_string(),
                    session_id: meta.id,
                    agent_version: meta.cli_version,
                    working_directory: meta.cwd,
                    git_branch: meta.git.and_then(|g| g.branch),
                    parent_session_id: meta.parent_session_id,
                });
            }
        }

        Err(Error::Parse {
            agent: "codex".to_string(),
            message: format!("no session_meta in first lines of {}", path.display()),
        })
    }

    fn parse_messages(&self, path: &Path, offset: u64, limit: usize) -> Result<MessageChunk> {
        let mut warnings = Vec::new();
        let file_size = std::fs::metadata(path)?.len();
        let (envelopes, next_offset, next_line) =
            read_envelopes(path, offset, Some(limit), &mut warnings)?;

        let outputs = collect_call_outputs(&envelopes);
        let mut messages = Vec::new();
        for (raw, envelope) in &envelopes {
            if let Some(msg) = convert_envelope(raw, envelope, &outputs) {
                messages.push(msg);
            }
        }

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

        let (envelopes, next_offset, lines) =
            read_envelopes(path, last_offset, None, &mut warnings)?;

        let outputs = collect_call_outputs(&envelopes);
        let mut new_messages = Vec::new();
        for (raw, envelope) in &envelopes {
            if let Some(msg) = convert_envelope(raw, envelope, &outputs) {
                new_messages.push(msg);
            }
        }

        let partial_hash = hashing::partial_hash(path, next_offset)?;
        let last_message_timestamp = new_messages.iter().filter_map(|m| m.timestamp).max();

        Ok(IncrementalResult {
            new_messages,
            last_processed_offset: next_offset,
            last_processed_line: last_line + lines,
            file_size_bytes: file_size,
            partial_hash,
            last_message_timestamp,
            warnings,
        })
    }
}

// ============================================
// Reading & conversion
// ============================================

type EnvelopeList = Vec<(serde_json::Value, RawEnvelope)>;

fn read_envelopes(
    path: &Path,
    offset: u64,
    limit: Option<usize>,
    warnings: &mut Vec<String>,
) -> Result<(EnvelopeList, u64, u64)> {
    let mut file = File::open(path)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    let mut reader = BufReader::new(file);

    let mut out: EnvelopeList = Vec::new();
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
        if !buf.ends_with('\n') {
            // Partial tail, still being written
            break;
        }

        line_no += 1;
        current_offset += read as u64;

        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => match serde_json::from_value::<RawEnvelope>(value.clone()) {
                Ok(envelope) => out.push((value, envelope)),
                Err(e) => warnings.push(format!("line {}: bad envelope: {}", line_no, e)),
            },
            Err(e) => {
                warnings.push(format!("line {}: JSON parse error: {}", line_no, e));
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

/// Collect function_call_output payloads keyed by call_id.
fn collect_call_outputs(envelopes: &EnvelopeList) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (_, envelope) in envelopes {
        if envelope.envelope_type.as_deref() != Some("response_item") {
            continue;
        }
        let Ok(item) =
            serde_json::from_value::<ResponseItemPayload>(envelope.payload.clone())
        else {
            continue;
        };
        if item.item_type.as_deref() == Some("function_call_output") {
            if let (Some(call_id), Some(output)) = (item.call_id, item.output) {
                map.insert(call_id, output);
            }
        }
    }
    map
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn convert_envelope(
    raw: &serde_json::Value,
    envelope: &RawEnvelope,
    outputs: &HashMap<String, String>,
) -> Option<ParsedMessage> {
    if envelope.envelope_type.as_deref() != Some("response_item") {
        return None;
    }
    let item: ResponseItemPayload = serde_json::from_value(envelope.payload.clone()).ok()?;
    let timestamp = parse_timestamp(envelope.timestamp.as_deref());

    match item.item_type.as_deref() {
        Some("message") => {
            let role = match item.role.as_deref() {
                Some("user") => MessageRole::User,
                Some("assistant") => MessageRole::Assistant,
                // Role-less records are not conversational
                _ => return None,
            };
            let text: Vec<String> = item
                .content
                .unwrap_or_default()
                .into_iter()
                .filter_map(|block| match block {
                    CodexContentBlock::InputText { text }
                    | CodexContentBlock::OutputText { text } => Some(text),
                    CodexContentBlock::Unknown => None,
                })
                .collect();
            if text.is_empty() {
                return None;
            }
            let mut msg = ParsedMessage::text(role, text.join("\n"));
            msg.timestamp = timestamp;
            msg.raw_data = raw.clone();
            Some(msg)
        }
        Some("function_call") => {
            let name = item.name?;
            let parameters: serde_json::Value = item
                .arguments
                .as_deref()
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or(serde_json::Value::Null);
            let result = item.call_id.as_ref().and_then(|id| outputs.get(id)).cloned();
            let tool_calls = vec![ToolCallData {
                tool_name: name,
                parameters,
                tool_use_id: item.call_id,
                result,
                success: true,
            }];
            let code_changes = detect_code_changes(&tool_calls);
            let mut msg = ParsedMessage::text(MessageRole::Assistant, String::new());
            msg.timestamp = timestamp;
            msg.tool_calls = tool_calls;
            msg.code_changes = code_changes;
            msg.raw_data = raw.clone();
            Some(msg)
        }
        Some("reasoning") => {
            let summary = item
                .summary
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.get("text").and_then(|t| t.as_str()).map(ToString::to_string))
                .collect::<Vec<_>>()
                .join("\n");
            if summary.is_empty() {
                return None;
            }
            let mut msg = ParsedMessage::text(MessageRole::Assistant, String::new());
            msg.timestamp = timestamp;
            msg.thinking_content = Some(summary);
            msg.raw_data = raw.clone();
            Some(msg)
        }
        // function_call_output pairs into its call; everything else
        // (ghost commits, token counts) is not conversational
        _ => None,
    }
}

fn build_conversation(
    envelopes: EnvelopeList,
    warnings: Vec<String>,
) -> Result<ParsedConversation> {
    let mut session_id = None;
    let mut agent_version = None;
    let mut working_directory = None;
    let mut git_branch = None;
    let mut parent_session_id = None;

    for (_, envelope) in &envelopes {
        if envelope.envelope_type.as_deref() == Some("session_meta") {
            let meta: SessionMetaPayload =
                serde_json::from_value(envelope.payload.clone()).unwrap_or_default();
            session_id = meta.id;
            agent_version = meta.cli_version;
            working_directory = meta.cwd;
            git_branch = meta.git.and_then(|g| g.branch);
            parent_session_id = meta.parent_session_id;
            break;
        }
    }

    let outputs = collect_call_outputs(&envelopes);
    let mut messages = Vec::new();
    for (raw, envelope) in &envelopes {
        if let Some(msg) = convert_envelope(raw, envelope, &outputs) {
            messages.push(msg);
        }
    }
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
    } else if parent_session_id.is_some() {
        ConversationType::Agent
    } else {
        ConversationType::Main
    };

    Ok(ParsedConversation {
        agent_type: "codex".to_string(),
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

    fn write_fixture(dir: &TempDir, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("rollout.jsonl");
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    const SESSION_META: &str = r#"{"timestamp":"2025-02-01T09:00:00Z","type":"session_meta","payload":{"id":"cx-123","cwd":"/home/dev/api","cli_version":"0.42.0","git":{"branch":"feature/x"}}}"#;
    const USER_MSG: &str = r#"{"timestamp":"2025-02-01T09:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"fix the bug"}]}}"#;
    const ASSISTANT_MSG: &str = r#"{"timestamp":"2025-02-01T09:00:05Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"on it"}]}}"#;
    const FUNC_CALL: &str = r#"{"timestamp":"2025-02-01T09:00:06Z","type":"response_item","payload":{"type":"function_call","name":"Write","call_id":"call_1","arguments":"{\"file_path\":\"/home/dev/api/fix.rs\",\"content\":\"fn fix() {}\"}"}}"#;
    const FUNC_OUT: &str = r#"{"timestamp":"2025-02-01T09:00:07Z","type":"response_item","payload":{"type":"function_call_output","call_id":"call_1","output":"wrote file"}}"#;

    #[test]
    fn test_probe() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &[SESSION_META, USER_MSG]);
        let parser = CodexLogParser::new();
        let report = parser.probe(&path).unwrap();
        assert!(report.can_parse);
    }

    #[test]
    fn test_parse_full() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            &[SESSION_META, USER_MSG, ASSISTANT_MSG, FUNC_CALL, FUNC_OUT],
        );
        let parser = CodexLogParser::new();
        let conv = parser.parse(&path).unwrap();

        assert_eq!(conv.agent_type, "codex");
        assert_eq!(conv.session_id.as_deref(), Some("cx-123"));
        assert_eq!(conv.agent_version.as_deref(), Some("0.42.0"));
        assert_eq!(conv.git_branch.as_deref(), Some("feature/x"));
        assert_eq!(conv.conversation_type, ConversationType::Main);

        // user + assistant + function_call (output folds in)
        assert_eq!(conv.messages.len(), 3);
        let call_msg = conv
            .messages
            .iter()
            .find(|m| !m.tool_calls.is_empty())
            .unwrap();
        assert_eq!(call_msg.tool_calls[0].tool_name, "Write");
        assert_eq!(call_msg.tool_calls[0].result.as_deref(), Some("wrote file"));
        assert_eq!(conv.files_touched, vec!["/home/dev/api/fix.rs"]);
    }

    #[test]
    fn test_reasoning_becomes_thinking() {
        let dir = TempDir::new().unwrap();
        let reasoning = r#"{"timestamp":"2025-02-01T09:00:03Z","type":"response_item","payload":{"type":"reasoning","summary":[{"type":"summary_text","text":"thinking about the fix"}]}}"#;
        let path = write_fixture(&dir, &[SESSION_META, USER_MSG, reasoning]);
        let parser = CodexLogParser::new();
        let conv = parser.parse(&path).unwrap();

        let thinking = conv
            .messages
            .iter()
            .find(|m| m.thinking_content.is_some())
            .unwrap();
        assert_eq!(
            thinking.thinking_content.as_deref(),
            Some("thinking about the fix")
        );
    }

    #[test]
    fn test_metadata_only_rollout() {
        let dir = TempDir::new().unwrap();
        let token_count = r#"{"timestamp":"2025-02-01T09:00:02Z","type":"event_msg","payload":{"type":"token_count"}}"#;
        let path = write_fixture(&dir, &[SESSION_META, token_count]);
        let parser = CodexLogParser::new();
        let conv = parser.parse(&path).unwrap();
        assert!(conv.is_metadata_only());
    }

    #[test]
    fn test_incremental() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &[SESSION_META, USER_MSG]);
        let parser = CodexLogParser::new();

        let first = parser.parse_incremental(&path, 0, 0).unwrap();
        assert_eq!(first.new_messages.len(), 1);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", ASSISTANT_MSG).unwrap();

        let inc = parser
            .parse_incremental(&path, first.last_processed_offset, first.last_processed_line)
            .unwrap();
        assert_eq!(inc.new_messages.len(), 1);
        assert_eq!(inc.new_messages[0].content, "on it");
    }

    #[test]
    fn test_parse_metadata() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &[SESSION_META]);
        let parser = CodexLogParser::new();
        let meta = parser.parse_metadata(&path).unwrap();
        assert_eq!(meta.session_id.as_deref(), Some("cx-123"));
        assert_eq!(meta.git_branch.as_deref(), Some("feature/x"));
    }
}
