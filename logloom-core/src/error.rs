//! Error types for logloom-core

use thiserror::Error;

/// Main error type for the logloom-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Caller passed an invalid argument (bad offset, bad enum value, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Entity does not exist in the requested workspace.
    ///
    /// Cross-workspace lookups return this kind as well, so callers
    /// cannot distinguish "missing" from "belongs to another tenant".
    #[error("not found: {0}")]
    NotFound(String),

    /// Authenticated caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A raw log with the same content hash already exists
    #[error("duplicate file (hash: {hash}): {path}")]
    DuplicateFile { hash: String, path: String },

    /// No registered parser could handle the file
    #[error("unknown log format: {0}")]
    UnknownFormat(String),

    /// Parse error for agent logs
    #[error("parse error in {agent} log: {message}")]
    Parse { agent: String, message: String },

    /// Collector batch arrived with a sequence gap
    #[error("sequence gap: last received {last_received}, expected {expected}")]
    GapDetected { last_received: u64, expected: u64 },

    /// Concurrent state disagreement (e.g. session completed mid-batch)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient failure; the caller may retry with backoff
    #[error("transient error: {0}")]
    Transient(String),

    /// Operation was cancelled via its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(String),
}

impl Error {
    /// Machine-readable kind string carried on API responses and job rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::PermissionDenied(_) => "permission_denied",
            Error::DuplicateFile { .. } => "duplicate_file",
            Error::UnknownFormat(_) => "unknown_format",
            Error::Parse { .. } => "parse_error",
            Error::GapDetected { .. } => "gap_detected",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) => "transient",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Llm(_) => "llm",
        }
    }

    /// Whether the caller should retry with backoff.
    ///
    /// Database and IO failures are treated as transient: the watch
    /// daemon retries them, the collector surface reports them as 5xx.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Database(_) | Error::Io(_) | Error::Llm(_)
        )
    }
}

/// Result type alias for logloom-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::DuplicateFile {
                hash: "abc".into(),
                path: "/tmp/x".into()
            }
            .kind(),
            "duplicate_file"
        );
        assert_eq!(
            Error::GapDetected {
                last_received: 5,
                expected: 6
            }
            .kind(),
            "gap_detected"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_transient()
        );
        assert!(!Error::InvalidArgument("bad".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
