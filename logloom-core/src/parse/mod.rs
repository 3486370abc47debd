//! Parser framework
//!
//! A [`ParserRegistry`] holds every registered [`LogParser`] and routes
//! files to the right one by probing. Ordering on dispatch is by
//! `priority − 100·format_mismatch` descending, so a parser that does
//! not claim the file's extension is heavily deprioritized but still
//! allowed to probe (its probe may legitimately reject).
//!
//! The registry is owned by the per-process [`crate::AppContext`];
//! there is no global instance.

mod claude;
mod codex;
mod parsed;
mod parser;
pub mod plan;
mod plugin;

pub use claude::ClaudeLogParser;
pub use codex::CodexLogParser;
pub use parsed::{
    ChangeOp, CodeChangeData, ConversationMetadata, IncrementalResult, MessageChunk,
    ParsedConversation, ParsedMessage, TokenUsageData, ToolCallData,
};
pub use parser::{normalize_extension, LogParser, ParserCapability, ParserInfo, ProbeReport};
pub use plugin::{ParserPlugin, PluginManifest};

use crate::error::{Error, Result};
use std::path::Path;

/// Observability wrapper around a full parse.
#[derive(Debug)]
pub struct ParseReport {
    pub conversation: ParsedConversation,
    pub parser_name: String,
    pub parser_version: String,
    /// "full" | "chunked" | "incremental"
    pub parse_method: String,
    pub parse_duration_ms: u128,
    pub probe_confidence: f32,
}

/// Registry for conversation log parsers with auto-detection.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn LogParser>>,
}

impl ParserRegistry {
    /// Empty registry. Most callers want [`ParserRegistry::with_builtins`].
    pub fn new() -> Self {
        Self { parsers: vec![] }
    }

    /// Registry with the built-in dialect parsers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ClaudeLogParser::new()));
        registry.register(Box::new(CodexLogParser::new()));
        registry
    }

    /// Register a parser. Dispatch order is decided at parse time from
    /// parser priority, not registration order.
    pub fn register(&mut self, parser: Box<dyn LogParser>) {
        tracing::debug!(parser = %parser.info().name, "Registered parser");
        self.parsers.push(parser);
    }

    /// Register an external plugin. Instantiation failures log a
    /// warning and are skipped; startup never aborts on a bad plugin.
    ///
    /// Plugins registered earlier win name collisions, so entry-point
    /// plugins should be registered before directory-based ones.
    pub fn register_plugin(&mut self, plugin: &ParserPlugin) {
        if self
            .parsers
            .iter()
            .any(|p| p.info().name == plugin.manifest.name)
        {
            tracing::warn!(
                plugin = %plugin.manifest.name,
                "Parser with this name already registered; plugin skipped"
            );
            return;
        }
        let parser = plugin.instantiate();
        tracing::info!(
            plugin = %plugin.manifest.name,
            version = %plugin.manifest.version,
            "Loaded external parser plugin"
        );
        self.parsers.push(parser);
    }

    /// Names of all registered parsers.
    pub fn registered_parsers(&self) -> Vec<&str> {
        self.parsers.iter().map(|p| p.info().name.as_str()).collect()
    }

    /// Parsers ordered for dispatch against a specific file.
    fn sorted_for(&self, path: &Path) -> Vec<&dyn LogParser> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .unwrap_or_default();

        let mut ordered: Vec<&dyn LogParser> = self.parsers.iter().map(|p| p.as_ref()).collect();
        ordered.sort_by_key(|p| {
            let info = p.info();
            let mismatch = !info.supported_formats.is_empty() && !info.supports_format(&extension);
            // Negated for descending order
            -(info.priority - if mismatch { 100 } else { 0 })
        });
        ordered
    }

    /// Find the first parser whose probe accepts the file.
    pub fn find_parser(&self, path: &Path) -> Option<&dyn LogParser> {
        if !path.exists() {
            return None;
        }
        for parser in self.sorted_for(path) {
            match parser.probe(path) {
                Ok(report) if report.can_parse => return Some(parser),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(
                        parser = %parser.info().name,
                        error = %e,
                        "Probe failed"
                    );
                    continue;
                }
            }
        }
        None
    }

    /// Find a parser that both accepts the file and supports
    /// incremental parsing for it.
    pub fn find_incremental_parser(&self, path: &Path) -> Option<&dyn LogParser> {
        if !path.exists() {
            return None;
        }
        for parser in &self.parsers {
            let accepts = match parser.probe(path) {
                Ok(report) => report.can_parse,
                Err(_) => false,
            };
            if accepts && parser.supports_incremental(path) {
                return Some(parser.as_ref());
            }
        }
        None
    }

    /// Parse with auto-detection, returning parser observability
    /// alongside the conversation.
    pub fn parse_with_report(&self, path: &Path) -> Result<ParseReport> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "log file not found: {}",
                path.display()
            )));
        }

        let file_size = std::fs::metadata(path)?.len();
        if file_size == 0 {
            // Empty files are often abandoned sessions
            return Err(Error::Parse {
                agent: "unknown".to_string(),
                message: format!("log file is empty (0 bytes): {}", path.display()),
            });
        }

        let mut attempts: Vec<String> = Vec::new();

        for parser in self.sorted_for(path) {
            let name = &parser.info().name;

            let probe = match parser.probe(path) {
                Ok(report) => report,
                Err(e) => {
                    attempts.push(format!("{} probe failed: {}", name, e));
                    continue;
                }
            };
            if !probe.can_parse {
                attempts.push(format!("{} skipped (probe negative)", name));
                continue;
            }

            let started = std::time::Instant::now();
            match parser.parse(path) {
                Ok(conversation) => {
                    return Ok(ParseReport {
                        conversation,
                        parser_name: name.clone(),
                        parser_version: parser.info().version.clone(),
                        parse_method: "full".to_string(),
                        parse_duration_ms: started.elapsed().as_millis(),
                        probe_confidence: probe.confidence,
                    });
                }
                Err(e) => {
                    attempts.push(format!("{} parse failed: {}", name, e));
                    tracing::debug!(parser = %name, error = %e, "Parse failed, trying next");
                    continue;
                }
            }
        }

        let attempted = if attempts.is_empty() {
            "no parsers registered".to_string()
        } else {
            attempts.join("; ")
        };
        Err(Error::UnknownFormat(format!(
            "no parser could handle {}. Attempts: {}",
            path.display(),
            attempted
        )))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationType;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::TempDir;

    struct StubParser {
        info: ParserInfo,
        accept: bool,
    }

    impl StubParser {
        fn new(name: &str, priority: i32, formats: &[&str], accept: bool) -> Self {
            Self {
                info: ParserInfo::new(name, "0.0.1")
                    .with_formats(formats)
                    .with_priority(priority),
                accept,
            }
        }
    }

    impl LogParser for StubParser {
        fn info(&self) -> &ParserInfo {
            &self.info
        }

        fn probe(&self, _path: &Path) -> crate::error::Result<ProbeReport> {
            Ok(if self.accept {
                ProbeReport::yes(0.5, "stub accepts")
            } else {
                ProbeReport::no("stub rejects")
            })
        }

        fn parse(&self, _path: &Path) -> crate::error::Result<ParsedConversation> {
            Ok(ParsedConversation {
                agent_type: self.info.name.clone(),
                agent_version: None,
                session_id: Some("stub".into()),
                parent_session_id: None,
                working_directory: None,
                git_branch: None,
                conversation_type: ConversationType::Main,
                start_time: Utc::now(),
                end_time: None,
                messages: vec![],
                files_touched: vec![],
                plans: vec![],
                warnings: vec![],
                metadata: serde_json::json!({}),
            })
        }
    }

    fn jsonl_file(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("test.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_priority_ordering() {
        let dir = TempDir::new().unwrap();
        let path = jsonl_file(&dir, r#"{"anything":true}"#);

        let mut registry = ParserRegistry::new();
        registry.register(Box::new(StubParser::new("low", 10, &[".jsonl"], true)));
        registry.register(Box::new(StubParser::new("high", 90, &[".jsonl"], true)));

        let report = registry.parse_with_report(&path).unwrap();
        assert_eq!(report.parser_name, "high");
    }

    #[test]
    fn test_format_mismatch_penalty() {
        let dir = TempDir::new().unwrap();
        let path = jsonl_file(&dir, r#"{"anything":true}"#);

        let mut registry = ParserRegistry::new();
        // High priority but wrong format: 90 - 100 = -10, loses to 50
        registry.register(Box::new(StubParser::new("wrong-fmt", 90, &[".json"], true)));
        registry.register(Box::new(StubParser::new("right-fmt", 50, &[".jsonl"], true)));

        let report = registry.parse_with_report(&path).unwrap();
        assert_eq!(report.parser_name, "right-fmt");
    }

    #[test]
    fn test_unknown_format_error() {
        let dir = TempDir::new().unwrap();
        let path = jsonl_file(&dir, r#"{"anything":true}"#);

        let mut registry = ParserRegistry::new();
        registry.register(Box::new(StubParser::new("rejects", 50, &[".jsonl"], false)));

        let err = registry.parse_with_report(&path).unwrap_err();
        assert!(matches!(err, Error::UnknownFormat(_)));
        assert!(err.to_string().contains("probe negative"));
    }

    #[test]
    fn test_empty_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::File::create(&path).unwrap();

        let registry = ParserRegistry::with_builtins();
        let err = registry.parse_with_report(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_builtins_dispatch_by_content() {
        let dir = TempDir::new().unwrap();
        let claude = jsonl_file(
            &dir,
            r#"{"type":"user","sessionId":"s1","version":"2.0.14","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
        );
        let registry = ParserRegistry::with_builtins();
        let report = registry.parse_with_report(&claude).unwrap();
        assert_eq!(report.parser_name, "claude-code");

        let codex_path = dir.path().join("codex.jsonl");
        let mut f = std::fs::File::create(&codex_path).unwrap();
        writeln!(
            f,
            r#"{{"timestamp":"2025-02-01T09:00:00Z","type":"session_meta","payload":{{"id":"cx-1","cwd":"/tmp"}}}}"#
        )
        .unwrap();
        writeln!(
            f,
            r#"{{"timestamp":"2025-02-01T09:00:01Z","type":"response_item","payload":{{"type":"message","role":"user","content":[{{"type":"input_text","text":"go"}}]}}}}"#
        )
        .unwrap();
        let report = registry.parse_with_report(&codex_path).unwrap();
        assert_eq!(report.parser_name, "codex");
    }

    #[test]
    fn test_find_incremental_parser() {
        let dir = TempDir::new().unwrap();
        let path = jsonl_file(
            &dir,
            r#"{"type":"user","sessionId":"s1","version":"2.0.14","timestamp":"2025-01-01T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
        );
        let registry = ParserRegistry::with_builtins();
        let parser = registry.find_incremental_parser(&path).unwrap();
        assert_eq!(parser.info().name, "claude-code");
    }

    #[test]
    fn test_plugin_name_collision_skipped() {
        let mut registry = ParserRegistry::with_builtins();
        let plugin = ParserPlugin::new(
            PluginManifest {
                name: "claude-code".into(),
                version: "9.9.9".into(),
                description: "an impostor claude parser".into(),
                supported_extensions: vec![],
                dependencies: vec![],
                homepage: None,
                license: None,
            },
            || Box::new(ClaudeLogParser::new()),
        )
        .unwrap();

        registry.register_plugin(&plugin);
        // Only one claude-code registered
        assert_eq!(
            registry
                .registered_parsers()
                .iter()
                .filter(|n| **n == "claude-code")
                .count(),
            1
        );
    }
}
