//! Plan-mode extraction
//!
//! Plan mode is signaled by an inline marker in a user message naming
//! a plan file path under a `.claude/plans/` directory. The extractor
//! tracks every plan path seen across the conversation: its initial
//! and final content, how many times it was iterated, the append-only
//! operation log, and whether the plan was approved via the
//! exit-plan-mode tool.

use crate::parse::parsed::{ChangeOp, ParsedMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tool that signals plan approval when invoked.
const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";

/// Lifecycle status of a tracked plan file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created but never approved
    Active,
    /// An exit-plan-mode invocation was seen after creation
    Approved,
    /// The plan file was only read, never written
    Referenced,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Approved => "approved",
            PlanStatus::Referenced => "referenced",
        }
    }
}

/// One create/edit touch on a plan file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOperation {
    /// "create" or "edit"
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Index of the message carrying the tool call
    pub message_index: usize,
}

/// Everything tracked for one plan file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub plan_file_path: String,
    /// Content of the first write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_content: Option<String>,
    /// Content after the last write or edit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    /// 1 on first write, +1 per subsequent edit
    pub iteration_count: i64,
    pub operations: Vec<PlanOperation>,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_message_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_message_index: Option<usize>,
}

impl PlanRecord {
    fn new(plan_file_path: String, entry_message_index: Option<usize>) -> Self {
        Self {
            plan_file_path,
            initial_content: None,
            final_content: None,
            iteration_count: 0,
            operations: vec![],
            status: PlanStatus::Referenced,
            entry_message_index,
            exit_message_index: None,
        }
    }
}

/// Whether a path points at a plan file (`.../.claude/plans/*.md`).
pub fn is_plan_file_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    // Normalize Windows separators before matching
    let normalized = path.replace('\\', "/");
    normalized.contains(".claude/plans/") && normalized.ends_with(".md")
}

/// Detect the plan-mode entry marker in user message content and
/// return the plan file path it names.
///
/// The marker is a system-injected region mentioning plan mode
/// together with a concrete plan file path; the path alone is not
/// enough (plain mentions of a plans directory do not count).
pub fn detect_plan_mode_entry(content: &str) -> Option<String> {
    if !content.to_lowercase().contains("plan mode") {
        return None;
    }

    // Scan tokens for the first plan file path
    for token in content.split_whitespace() {
        let candidate = token
            .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | ',' | ';' | ':' | '(' | ')' | '<' | '>'))
            // A sentence period after the path is not part of it
            .trim_end_matches('.');
        if is_plan_file_path(candidate) {
            return Some(candidate.to_string());
        }
    }

    None
}

/// Walk the message list and build one [`PlanRecord`] per plan file
/// path seen, in order of first appearance.
pub fn extract_plan_operations(messages: &[ParsedMessage]) -> Vec<PlanRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut plans: std::collections::HashMap<String, PlanRecord> =
        std::collections::HashMap::new();

    for (index, msg) in messages.iter().enumerate() {
        // Plan-mode entry markers in user content
        if let Some(path) = detect_plan_mode_entry(&msg.content) {
            if !plans.contains_key(&path) {
                order.push(path.clone());
                plans.insert(path.clone(), PlanRecord::new(path, Some(index)));
            }
        }

        for call in &msg.tool_calls {
            // Approval: exit-plan-mode closes every plan currently open
            if call.tool_name == EXIT_PLAN_MODE_TOOL {
                for plan in plans.values_mut() {
                    if plan.status == PlanStatus::Active {
                        plan.status = PlanStatus::Approved;
                        plan.exit_message_index = Some(index);
                    }
                }
                continue;
            }

            let file_path = call
                .parameters
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !is_plan_file_path(file_path) {
                continue;
            }

            let plan = plans.entry(file_path.to_string()).or_insert_with(|| {
                order.push(file_path.to_string());
                PlanRecord::new(file_path.to_string(), None)
            });

            match call.tool_name.as_str() {
                "Write" => {
                    let content = call
                        .parameters
                        .get("content")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string);
                    if plan.initial_content.is_none() {
                        plan.initial_content = content.clone();
                        plan.iteration_count = 1;
                    } else {
                        plan.iteration_count += 1;
                    }
                    plan.final_content = content;
                    if plan.status == PlanStatus::Referenced {
                        plan.status = PlanStatus::Active;
                    }
                    plan.operations.push(PlanOperation {
                        operation_type: "create".to_string(),
                        timestamp: msg.timestamp,
                        message_index: index,
                    });
                }
                "Edit" => {
                    let old = call.parameters.get("old_string").and_then(|v| v.as_str());
                    let new = call.parameters.get("new_string").and_then(|v| v.as_str());
                    if let (Some(current), Some(old), Some(new)) =
                        (plan.final_content.clone(), old, new)
                    {
                        plan.final_content = Some(current.replacen(old, new, 1));
                    }
                    plan.iteration_count += 1;
                    if plan.status == PlanStatus::Referenced {
                        plan.status = PlanStatus::Active;
                    }
                    plan.operations.push(PlanOperation {
                        operation_type: "edit".to_string(),
                        timestamp: msg.timestamp,
                        message_index: index,
                    });
                }
                // Read-only touches leave the record as Referenced
                _ => {}
            }
        }
    }

    order.into_iter().filter_map(|p| plans.remove(&p)).collect()
}
