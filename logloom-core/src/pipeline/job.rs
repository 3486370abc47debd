//! Ingestion job tracking
//!
//! Every ingest attempt produces exactly one [`IngestionJob`] row, even
//! when the ingest transaction rolls back: the tracker accumulates job
//! state in memory and the pipeline persists the failed row in a fresh
//! transaction after rollback.

use crate::types::{IngestionJob, JobStatus, SourceType};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;

/// Wall-clock duration per pipeline stage, recorded into the job's
/// stage_metrics JSON.
#[derive(Debug, Default)]
pub struct StageMetrics {
    durations_ms: HashMap<String, u128>,
    open: HashMap<String, Instant>,
    /// Extra observability fields (parser name, change kind, warnings...)
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&mut self, name: &str) {
        self.open.insert(name.to_string(), Instant::now());
    }

    pub fn end_stage(&mut self, name: &str) {
        if let Some(started) = self.open.remove(name) {
            self.durations_ms
                .insert(name.to_string(), started.elapsed().as_millis());
        }
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    /// Flatten durations and metadata into one JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = self.metadata.clone();
        for (name, ms) in &self.durations_ms {
            map.insert(name.clone(), serde_json::json!(*ms as u64));
        }
        serde_json::Value::Object(map)
    }
}

/// Accumulates job state across pipeline stages.
#[derive(Debug)]
pub struct JobTracker {
    pub job_id: String,
    workspace_id: String,
    source_type: SourceType,
    source_config_id: Option<String>,
    file_path: Option<String>,
    created_by: Option<String>,
    started_at: chrono::DateTime<Utc>,
    pub incremental: bool,
}

impl JobTracker {
    pub fn open(
        workspace_id: &str,
        source_type: SourceType,
        file_path: Option<&str>,
        source_config_id: Option<&str>,
        created_by: Option<&str>,
    ) -> Self {
        Self {
            job_id: crate::types::new_id(),
            workspace_id: workspace_id.to_string(),
            source_type,
            source_config_id: source_config_id.map(ToString::to_string),
            file_path: file_path.map(ToString::to_string),
            created_by: created_by.map(ToString::to_string),
            started_at: Utc::now(),
            incremental: false,
        }
    }

    /// Materialize the finished job row.
    pub fn finish(
        &self,
        status: JobStatus,
        conversation_id: Option<&str>,
        raw_log_id: Option<&str>,
        messages_added: i64,
        metrics: &StageMetrics,
        error: Option<&crate::error::Error>,
    ) -> IngestionJob {
        IngestionJob {
            id: self.job_id.clone(),
            workspace_id: self.workspace_id.clone(),
            status,
            source_type: self.source_type,
            source_config_id: self.source_config_id.clone(),
            file_path: self.file_path.clone(),
            created_by: self.created_by.clone(),
            conversation_id: conversation_id.map(ToString::to_string),
            raw_log_id: raw_log_id.map(ToString::to_string),
            incremental: self.incremental,
            messages_added,
            stage_metrics: metrics.to_json(),
            error_kind: error.map(|e| e.kind().to_string()),
            error_message: error.map(|e| e.to_string()),
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_metrics_json() {
        let mut metrics = StageMetrics::new();
        metrics.start_stage("parse_ms");
        metrics.end_stage("parse_ms");
        metrics.set("parser_name", serde_json::json!("claude-code"));

        let json = metrics.to_json();
        assert!(json.get("parse_ms").is_some());
        assert_eq!(json["parser_name"], "claude-code");
    }

    #[test]
    fn test_tracker_failed_job() {
        let tracker = JobTracker::open("ws-1", SourceType::Cli, Some("/tmp/x.jsonl"), None, None);
        let metrics = StageMetrics::new();
        let err = crate::error::Error::UnknownFormat("nope".into());

        let job = tracker.finish(JobStatus::Failed, None, None, 0, &metrics, Some(&err));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind.as_deref(), Some("unknown_format"));
        assert!(job.finished_at.is_some());
    }
}
