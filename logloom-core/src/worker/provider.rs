//! LLM provider interface for background workers
//!
//! Providers are synchronous from the worker's perspective; each owns
//! a current-thread tokio runtime driving a reqwest client. Structured
//! output uses native JSON-schema response formats where the API
//! supports them and a prompt-embedded schema otherwise.

use crate::config::{LlmConfig, LlmProviderKind};
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Requests allowed per refill window, per provider instance.
const RATE_LIMIT_REQUESTS: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Minimal token bucket sitting in front of each provider variant.
struct RateLimiter {
    capacity: u32,
    window: Duration,
    state: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    /// Take one token, sleeping until the bucket refills if empty.
    fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let (ref mut tokens, ref mut refilled_at) = *state;
                if refilled_at.elapsed() >= self.window {
                    *tokens = self.capacity;
                    *refilled_at = Instant::now();
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                self.window.saturating_sub(refilled_at.elapsed())
            };
            std::thread::sleep(wait.max(Duration::from_millis(10)));
        }
    }
}

/// One completed LLM call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub finish_reason: Option<String>,
    pub model: String,
    pub duration_ms: u128,
}

/// Polymorphic LLM completion interface.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one completion. `schema` requests structured JSON output.
    fn complete(
        &self,
        system: &str,
        user: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<CompletionResponse>;

    /// Dollar cost of a call with the given token counts.
    fn calculate_cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64;
}

/// Build the provider named in config.
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider {
        LlmProviderKind::OpenAI => Ok(Box::new(OpenAiProvider::new(config)?)),
        LlmProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(config)?)),
    }
}

fn resolve_api_key(config: &LlmConfig, env_var: &str) -> Result<String> {
    config
        .api_key
        .clone()
        .or_else(|| std::env::var(env_var).ok())
        .ok_or_else(|| {
            Error::Config(format!("llm.api_key (or {}) is required", env_var))
        })
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Llm(format!("failed to build tokio runtime: {e}")))
}

fn build_http(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| Error::Llm(format!("failed to build HTTP client: {e}")))
}

// ============================================
// OpenAI
// ============================================

pub struct OpenAiProvider {
    model: String,
    endpoint: String,
    api_key: String,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
    limiter: RateLimiter,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| config.provider.default_endpoint().to_string()),
            api_key: resolve_api_key(config, "OPENAI_API_KEY")?,
            runtime: build_runtime()?,
            http: build_http(config.timeout_secs)?,
            limiter: RateLimiter::new(RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW),
        })
    }
}

impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(
        &self,
        system: &str,
        user: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<CompletionResponse> {
        self.limiter.acquire();
        let started = Instant::now();
        self.runtime.block_on(async {
            let url = format!("{}/v1/chat/completions", self.endpoint.trim_end_matches('/'));

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                    .map_err(|e| Error::Llm(format!("invalid auth header: {e}")))?,
            );

            let mut body = json!({
                "model": self.model,
                "temperature": 0,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
            });
            // Native structured output
            if let Some(schema) = schema {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": "structured_output",
                        "schema": schema,
                        "strict": true,
                    },
                });
            }

            let resp = self
                .http
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| classify_http_error("openai", e))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Llm(format!("openai read body failed: {e}")))?;
            if !status.is_success() {
                return Err(classify_status("openai", status.as_u16(), &text));
            }

            let parsed: serde_json::Value = serde_json::from_str(&text)?;
            let content = parsed
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .ok_or_else(|| {
                    Error::Llm("openai response missing choices[0].message.content".to_string())
                })?;

            Ok(CompletionResponse {
                content,
                prompt_tokens: usage_field(&parsed, "prompt_tokens"),
                completion_tokens: usage_field(&parsed, "completion_tokens"),
                finish_reason: parsed
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("finish_reason"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string),
                model: self.model.clone(),
                duration_ms: started.elapsed().as_millis(),
            })
        })
    }

    fn calculate_cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        // Flat per-million rates; fine-grained per-model pricing is the
        // caller's concern.
        prompt_tokens as f64 * 2.50 / 1_000_000.0 + completion_tokens as f64 * 10.0 / 1_000_000.0
    }
}

// ============================================
// Anthropic
// ============================================

pub struct AnthropicProvider {
    model: String,
    endpoint: String,
    api_key: String,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
    limiter: RateLimiter,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| config.provider.default_endpoint().to_string()),
            api_key: resolve_api_key(config, "ANTHROPIC_API_KEY")?,
            runtime: build_runtime()?,
            http: build_http(config.timeout_secs)?,
            limiter: RateLimiter::new(RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW),
        })
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn complete(
        &self,
        system: &str,
        user: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<CompletionResponse> {
        self.limiter.acquire();
        let started = Instant::now();
        self.runtime.block_on(async {
            let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(&self.api_key)
                    .map_err(|e| Error::Llm(format!("invalid anthropic api key header: {e}")))?,
            );
            headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

            // Prompt-embedded schema: the messages API has no response
            // format parameter.
            let user_content = match schema {
                Some(schema) => format!(
                    "{}\n\nRespond with JSON matching this schema exactly, no other text:\n{}",
                    user, schema
                ),
                None => user.to_string(),
            };

            let resp = self
                .http
                .post(url)
                .headers(headers)
                .json(&json!({
                    "model": self.model,
                    "max_tokens": 1024,
                    "temperature": 0,
                    "system": system,
                    "messages": [{ "role": "user", "content": user_content }],
                }))
                .send()
                .await
                .map_err(|e| classify_http_error("anthropic", e))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Llm(format!("anthropic read body failed: {e}")))?;
            if !status.is_success() {
                return Err(classify_status("anthropic", status.as_u16(), &text));
            }

            let parsed: serde_json::Value = serde_json::from_str(&text)?;
            let content = parsed
                .get("content")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|v| v.get("text"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .ok_or_else(|| Error::Llm("anthropic response missing content[0].text".to_string()))?;

            Ok(CompletionResponse {
                content,
                prompt_tokens: anthropic_usage(&parsed, "input_tokens"),
                completion_tokens: anthropic_usage(&parsed, "output_tokens"),
                finish_reason: parsed
                    .get("stop_reason")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string),
                model: self.model.clone(),
                duration_ms: started.elapsed().as_millis(),
            })
        })
    }

    fn calculate_cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        prompt_tokens as f64 * 3.0 / 1_000_000.0 + completion_tokens as f64 * 15.0 / 1_000_000.0
    }
}

fn usage_field(parsed: &serde_json::Value, field: &str) -> i64 {
    parsed
        .get("usage")
        .and_then(|u| u.get(field))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn anthropic_usage(parsed: &serde_json::Value, field: &str) -> i64 {
    usage_field(parsed, field)
}

/// Network-level failures are transient by definition.
fn classify_http_error(provider: &str, e: reqwest::Error) -> Error {
    Error::Transient(format!("{} request failed: {}", provider, e))
}

/// 5xx and 429 are transient; everything else is a permanent LLM error.
fn classify_status(provider: &str, status: u16, body: &str) -> Error {
    if status >= 500 || status == 429 {
        Error::Transient(format!("{} returned {}: {}", provider, status, body))
    } else {
        Error::Llm(format!("{} returned {}: {}", provider, status, body))
    }
}
