//! Parser trait abstraction
//!
//! All format parsers implement the [`LogParser`] trait to provide a
//! unified interface for probing and parsing conversation logs.
//!
//! ## Design Principles
//!
//! 1. **Lossless capture**: Every parsed record preserves complete `raw_data`
//! 2. **Resilience**: Parse failures for individual records log warnings but continue
//! 3. **Incremental**: Byte-offset cursors enable resuming from the last position
//! 4. **Extensible**: New formats only require implementing this trait

use crate::error::{Error, Result};
use crate::parse::parsed::{
    ConversationMetadata, IncrementalResult, MessageChunk, ParsedConversation,
};
use std::path::Path;

/// Optional capabilities a parser can advertise beyond full parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserCapability {
    /// `parse_metadata` + `parse_messages` (bounded-memory path)
    Chunked,
    /// `parse_incremental` (append-suffix path)
    Incremental,
}

/// Static metadata a parser declares about itself.
#[derive(Debug, Clone)]
pub struct ParserInfo {
    /// Lowercase kebab-case name; doubles as the persisted agent_type
    pub name: String,
    /// Semantic version of the parser implementation
    pub version: String,
    /// Supported file extensions, normalized (lowercased, dot-prefixed)
    pub supported_formats: Vec<String>,
    /// Dispatch priority; higher wins. Default 50.
    pub priority: i32,
    pub capabilities: Vec<ParserCapability>,
}

impl ParserInfo {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            supported_formats: vec![],
            priority: 50,
            capabilities: vec![],
        }
    }

    pub fn with_formats(mut self, formats: &[&str]) -> Self {
        self.supported_formats = formats.iter().map(|f| normalize_extension(f)).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, caps: &[ParserCapability]) -> Self {
        self.capabilities = caps.to_vec();
        self
    }

    /// Whether this parser claims the given file extension.
    pub fn supports_format(&self, extension: &str) -> bool {
        let normalized = normalize_extension(extension);
        self.supported_formats.iter().any(|f| *f == normalized)
    }

    pub fn has_capability(&self, cap: ParserCapability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Normalize a file extension: lowercase, ensure leading dot.
pub fn normalize_extension(ext: &str) -> String {
    let lower = ext.to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Result of cheaply probing a file for format compatibility.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub can_parse: bool,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub reasons: Vec<String>,
}

impl ProbeReport {
    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            can_parse: false,
            confidence: 0.0,
            reasons: vec![reason.into()],
        }
    }

    pub fn yes(confidence: f32, reason: impl Into<String>) -> Self {
        Self {
            can_parse: true,
            confidence,
            reasons: vec![reason.into()],
        }
    }
}

/// Trait implemented by all format parsers.
///
/// Only `info`, `probe`, and `parse` are required. Chunked and
/// incremental paths are opt-in via [`ParserCapability`]; the default
/// implementations reject the call so the registry can fall back to a
/// full parse.
pub trait LogParser: Send + Sync {
    /// Static parser metadata
    fn info(&self) -> &ParserInfo;

    /// Cheap inspection of the first ≤10 lines; never reads the full file.
    fn probe(&self, path: &Path) -> Result<ProbeReport>;

    /// Complete parse of the file.
    fn parse(&self, path: &Path) -> Result<ParsedConversation>;

    /// Extract session-level metadata from the first ≤10 lines.
    fn parse_metadata(&self, path: &Path) -> Result<ConversationMetadata> {
        let _ = path;
        Err(Error::Internal(format!(
            "{} does not support chunked parsing",
            self.info().name
        )))
    }

    /// Parse up to `limit` messages starting from byte `offset`.
    ///
    /// First-time ingestion calls this in a loop from offset 0;
    /// subsequent appends resume from the stored offset.
    fn parse_messages(&self, path: &Path, offset: u64, limit: usize) -> Result<MessageChunk> {
        let _ = (path, offset, limit);
        Err(Error::Internal(format!(
            "{} does not support chunked parsing",
            self.info().name
        )))
    }

    /// Whether incremental parsing is supported for this specific file.
    ///
    /// Formats may opt out per-file (e.g. corrupted cursors); the
    /// default follows the declared capability.
    fn supports_incremental(&self, path: &Path) -> bool {
        let _ = path;
        self.info().has_capability(ParserCapability::Incremental)
    }

    /// Parse only content appended since `last_offset`.
    ///
    /// Implementations must apply the same non-conversational filter as
    /// the full path: records without a role, file-history snapshots,
    /// summaries, and metadata-only records are dropped.
    fn parse_incremental(
        &self,
        path: &Path,
        last_offset: u64,
        last_line: u64,
    ) -> Result<IncrementalResult> {
        let _ = (path, last_offset, last_line);
        Err(Error::Internal(format!(
            "{} does not support incremental parsing",
            self.info().name
        )))
    }
}
