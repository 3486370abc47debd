//! Background workers
//!
//! One coarse queue per job kind (tagging, slash-command detection,
//! MCP detection) over the `worker_jobs` table. Jobs are enqueued
//! inside the transaction that created their conversation; workers
//! claim rows with a single conditional UPDATE so at most one worker
//! processes a job. Each job builds the Insights canonical, calls the
//! configured LLM provider, filters structured output by confidence,
//! and persists tags or recommendations. Transient failures retry
//! with the attempt counter; permanent ones fail terminally.

mod provider;

pub use provider::{create_provider, CompletionResponse, LlmProvider};

use crate::canonical::{get_or_generate, CanonicalRequest, CanonicalType};
use crate::config::WorkerConfig;
use crate::db::{repo, Database};
use crate::error::{Error, Result};
use crate::types::{new_id, CancelToken, Recommendation};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Job kinds drained by the pool.
pub const JOB_KINDS: &[&str] = &["tagging", "slash_command", "mcp_detection"];

const TAGGING_SYSTEM_PROMPT: &str = "You are a conversation analyst for AI coding sessions. \
Given a session transcript, return strict JSON with: outcome (success|failed|partial), \
intent (short string), sentiment (positive|neutral|negative), sentiment_score (0.0-1.0), \
problems (array of short strings), features (array of short strings), \
tools_used (array of tool names), confidence (0.0-1.0).";

const ADVISOR_SYSTEM_PROMPT: &str = "You are an advisor for AI coding workflows. Given a \
session transcript, return strict JSON with: recommendations (array of objects with \
kind, title, body, confidence 0.0-1.0).";

fn tagging_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "outcome": {"type": "string"},
            "intent": {"type": "string"},
            "sentiment": {"type": "string"},
            "sentiment_score": {"type": "number"},
            "problems": {"type": "array", "items": {"type": "string"}},
            "features": {"type": "array", "items": {"type": "string"}},
            "tools_used": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number"}
        },
        "required": ["outcome", "confidence"]
    })
}

fn advisor_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "kind": {"type": "string"},
                        "title": {"type": "string"},
                        "body": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["kind", "title", "confidence"]
                }
            }
        },
        "required": ["recommendations"]
    })
}

/// Pool of worker threads draining the job queue.
pub struct WorkerPool {
    shutdown: CancelToken,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn up to `config.max_concurrency` worker threads.
    pub fn start(
        db_path: PathBuf,
        config: WorkerConfig,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        let shutdown = CancelToken::new();
        let mut threads = Vec::new();

        for worker_index in 0..config.max_concurrency.max(1) {
            let db_path = db_path.clone();
            let config = config.clone();
            let provider = provider.clone();
            let shutdown = shutdown.clone();

            threads.push(std::thread::spawn(move || {
                let db = match Database::open(&db_path) {
                    Ok(db) => db,
                    Err(e) => {
                        tracing::error!(error = %e, "Worker could not open database");
                        return;
                    }
                };
                tracing::debug!(worker_index, "Worker thread started");

                while !shutdown.is_cancelled() {
                    match drain_one(&db, &config, provider.as_ref()) {
                        Ok(true) => continue, // claimed and processed, go again
                        Ok(false) => std::thread::sleep(Duration::from_millis(500)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Worker loop error");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            }));
        }

        Self { shutdown, threads }
    }

    pub fn stop(mut self) {
        self.shutdown.cancel();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("Worker pool stopped");
    }
}

/// Claim and process at most one pending job across all kinds.
/// Returns whether a job was claimed.
pub fn drain_one(db: &Database, config: &WorkerConfig, provider: &dyn LlmProvider) -> Result<bool> {
    for kind in JOB_KINDS {
        let claimed = db.with_conn(|conn| repo::claim_worker_job(conn, kind))?;
        let Some(job) = claimed else {
            continue;
        };

        match process_job(db, config, provider, &job.conversation_id, kind) {
            Ok(()) => {
                db.transaction(|tx| repo::complete_worker_job(tx, &job.id))?;
                tracing::info!(job_id = %job.id, kind, "Worker job complete");
            }
            Err(e) => {
                let retry = e.is_transient() && job.attempts < config.max_attempts;
                db.transaction(|tx| repo::fail_worker_job(tx, &job.id, &e.to_string(), retry))?;
                tracing::warn!(
                    job_id = %job.id,
                    kind,
                    attempts = job.attempts,
                    retry,
                    error = %e,
                    "Worker job failed"
                );
            }
        }
        return Ok(true);
    }
    Ok(false)
}

fn process_job(
    db: &Database,
    config: &WorkerConfig,
    provider: &dyn LlmProvider,
    conversation_id: &str,
    kind: &str,
) -> Result<()> {
    let conversation = db
        .with_conn(|conn| repo::get_conversation_any(conn, conversation_id))?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;

    // Insights canonical feeds every advisor
    let canonical = get_or_generate(
        db,
        &conversation.workspace_id,
        conversation_id,
        &CanonicalRequest::new(CanonicalType::Insights),
    )?;

    match kind {
        "tagging" => run_tagging(db, config, provider, &conversation.id, &canonical.narrative),
        "slash_command" | "mcp_detection" => run_advisor(
            db,
            config,
            provider,
            &conversation.workspace_id,
            &conversation.id,
            kind,
            &canonical.narrative,
        ),
        other => Err(Error::InvalidArgument(format!(
            "unknown worker job kind: {}",
            other
        ))),
    }
}

fn run_tagging(
    db: &Database,
    config: &WorkerConfig,
    provider: &dyn LlmProvider,
    conversation_id: &str,
    narrative: &str,
) -> Result<()> {
    let schema = tagging_schema();
    let response = provider.complete(TAGGING_SYSTEM_PROMPT, narrative, Some(&schema))?;
    let tags = parse_structured(&response.content)?;

    let confidence = tags
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    if confidence < config.confidence_threshold {
        tracing::info!(
            conversation_id,
            confidence,
            threshold = config.confidence_threshold,
            "Tagger output below confidence threshold; discarded"
        );
        return Ok(());
    }

    db.transaction(|tx| repo::update_conversation_tags(tx, conversation_id, &tags))?;
    tracing::debug!(
        conversation_id,
        model = %response.model,
        cost = provider.calculate_cost(response.prompt_tokens, response.completion_tokens),
        "Stored conversation tags"
    );
    Ok(())
}

fn run_advisor(
    db: &Database,
    config: &WorkerConfig,
    provider: &dyn LlmProvider,
    workspace_id: &str,
    conversation_id: &str,
    kind: &str,
    narrative: &str,
) -> Result<()> {
    let schema = advisor_schema();
    let response = provider.complete(ADVISOR_SYSTEM_PROMPT, narrative, Some(&schema))?;
    let parsed = parse_structured(&response.content)?;

    let recommendations = parsed
        .get("recommendations")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    db.transaction(|tx| {
        for rec in &recommendations {
            let confidence = rec.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if confidence < config.confidence_threshold {
                continue;
            }
            repo::insert_recommendation(
                tx,
                &Recommendation {
                    id: new_id(),
                    workspace_id: workspace_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    kind: rec
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .unwrap_or(kind)
                        .to_string(),
                    title: rec
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    body: rec
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    confidence,
                    status: "open".to_string(),
                    created_at: Utc::now(),
                },
            )?;
        }
        Ok(())
    })
}

/// Parse structured JSON, tolerating models that wrap the object in
/// prose or code fences.
fn parse_structured(raw: &str) -> Result<serde_json::Value> {
    let parsed = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(_) => {
            let extracted = extract_json_object(raw)?;
            serde_json::from_str::<serde_json::Value>(&extracted)?
        }
    };

    if !parsed.is_object() {
        return Err(Error::Llm("structured response must be a JSON object".to_string()));
    }
    Ok(parsed)
}

fn extract_json_object(raw: &str) -> Result<String> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Llm("response did not contain a JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| Error::Llm("response did not contain a JSON object".to_string()))?;
    if end <= start {
        return Err(Error::Llm("response JSON bounds are invalid".to_string()));
    }
    Ok(raw[start..=end].to_string())
}
