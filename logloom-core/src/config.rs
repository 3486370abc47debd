//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/logloom/config.toml`

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Ingestion pipeline policy defaults
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Watch daemon tuning
    #[serde(default)]
    pub watch: WatchConfig,

    /// Canonicalization tuning
    #[serde(default)]
    pub canonical: CanonicalSettings,

    /// Background worker tuning
    #[serde(default)]
    pub workers: WorkerConfig,

    /// LLM provider configuration for tagging/recommendations (optional)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ingestion pipeline policy defaults
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Close duplicate-content ingests as `duplicate` instead of failing
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,

    /// Use incremental parsers for APPEND-classified files
    #[serde(default = "default_true")]
    pub enable_incremental: bool,

    /// Orphan sweep gives up on an agent after this many failed lookups
    #[serde(default = "default_max_linking_attempts")]
    pub max_linking_attempts: i64,

    /// External parser plugin modules to register at startup.
    /// Load failures log a warning and do not abort.
    #[serde(default)]
    pub parser_plugins: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            skip_duplicates: true,
            enable_incremental: true,
            max_linking_attempts: default_max_linking_attempts(),
            parser_plugins: vec![],
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_linking_attempts() -> i64 {
    10
}

/// Watch daemon tuning
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Seconds to wait after a filesystem event before processing
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: f64,

    /// Base retry interval in seconds; backoff is base * 3^(attempt-1)
    #[serde(default = "default_retry_base_seconds")]
    pub retry_base_seconds: u64,

    /// Attempts before a failed file is dropped with a warning
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Processor pool size
    #[serde(default = "default_processor_threads")]
    pub processor_threads: usize,

    /// File extensions the observer reacts to
    #[serde(default = "default_watch_extensions")]
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            retry_base_seconds: default_retry_base_seconds(),
            max_retries: default_max_retries(),
            processor_threads: default_processor_threads(),
            extensions: default_watch_extensions(),
        }
    }
}

fn default_debounce_seconds() -> f64 {
    1.0
}

fn default_retry_base_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_processor_threads() -> usize {
    2
}

fn default_watch_extensions() -> Vec<String> {
    vec![".jsonl".to_string()]
}

/// Canonicalization tuning
#[derive(Debug, Deserialize, Clone)]
pub struct CanonicalSettings {
    /// Regenerate the cache when estimated source token growth exceeds this
    #[serde(default = "default_regeneration_threshold")]
    pub regeneration_threshold_tokens: i64,
}

impl Default for CanonicalSettings {
    fn default() -> Self {
        Self {
            regeneration_threshold_tokens: default_regeneration_threshold(),
        }
    }
}

fn default_regeneration_threshold() -> i64 {
    2000
}

/// Background worker tuning
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Global worker concurrency cap
    #[serde(default = "default_worker_concurrency")]
    pub max_concurrency: usize,

    /// Drop tagger outputs below this confidence
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Attempts before a transiently failing job is marked failed
    #[serde(default = "default_max_retries")]
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_worker_concurrency(),
            confidence_threshold: default_confidence_threshold(),
            max_attempts: default_max_retries(),
        }
    }
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_confidence_threshold() -> f64 {
    0.5
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProviderKind,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAI,
    Anthropic,
}

impl LlmProviderKind {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAI => "https://api.openai.com",
            LlmProviderKind::Anthropic => "https://api.anthropic.com",
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("logloom")
            .join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("logloom")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("logloom")
    }

    /// Returns the database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("logloom.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.is_none());
        assert!(config.ingest.skip_duplicates);
        assert!(config.ingest.enable_incremental);
        assert_eq!(config.ingest.max_linking_attempts, 10);
        assert_eq!(config.watch.retry_base_seconds, 300);
        assert_eq!(config.watch.max_retries, 3);
        assert_eq!(config.workers.max_concurrency, 4);
        assert_eq!(config.canonical.regeneration_threshold_tokens, 2000);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[ingest]
skip_duplicates = false
parser_plugins = ["acme_parser"]

[watch]
debounce_seconds = 2.5
max_retries = 5

[llm]
provider = "anthropic"
model = "claude-sonnet-4-20250514"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(!config.ingest.skip_duplicates);
        assert_eq!(config.ingest.parser_plugins, vec!["acme_parser"]);
        assert_eq!(config.watch.debounce_seconds, 2.5);
        assert_eq!(config.watch.max_retries, 5);

        let llm = config.llm.unwrap();
        assert_eq!(llm.provider, LlmProviderKind::Anthropic);
        assert_eq!(llm.timeout_secs, 60);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_provider_endpoints() {
        assert_eq!(
            LlmProviderKind::Anthropic.default_endpoint(),
            "https://api.anthropic.com"
        );
        assert_eq!(
            LlmProviderKind::OpenAI.default_endpoint(),
            "https://api.openai.com"
        );
    }
}
