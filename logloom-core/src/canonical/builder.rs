//! Play-format narrative builder
//!
//! Renders a sampled conversation as a theatrical transcript: a header
//! with conversation facts, `--- EPOCH N ---` transitions, one
//! `[HH:MM:SS] ROLE:` line per message with tool/code/thinking
//! annotations, inline child blocks, and a trailer with tags and
//! sampling stats.

use crate::canonical::sampler::SampledMessage;
use crate::canonical::{CanonicalConfig, CanonicalConversation, ConversationBundle};
use crate::types::Message;
use std::collections::HashMap;

/// Seconds of slack when matching a child conversation to the message
/// it was spawned near.
const CHILD_SPAWN_WINDOW_SECS: i64 = 60;

pub struct PlayFormatBuilder<'a> {
    config: &'a CanonicalConfig,
}

impl<'a> PlayFormatBuilder<'a> {
    pub fn new(config: &'a CanonicalConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        bundle: &ConversationBundle,
        sampled: &[SampledMessage],
        children: &[CanonicalConversation],
    ) -> String {
        let mut lines: Vec<String> = Vec::new();

        lines.push(self.build_header(bundle));
        lines.push(String::new());

        let epoch_sequences: HashMap<&str, i64> = bundle
            .epochs
            .iter()
            .map(|e| (e.id.as_str(), e.sequence))
            .collect();

        let mut current_epoch: Option<&str> = None;
        for sm in sampled {
            let msg = sm.message;

            // Epoch transition marker
            if current_epoch != Some(msg.epoch_id.as_str()) {
                if current_epoch.is_some() {
                    lines.push(String::new());
                }
                let epoch_num = epoch_sequences.get(msg.epoch_id.as_str()).copied().unwrap_or(0);
                lines.push(format!("--- EPOCH {} ---", epoch_num));
                lines.push(String::new());
                current_epoch = Some(msg.epoch_id.as_str());
            }

            lines.extend(self.build_message(msg));

            // Inline children spawned near this message
            for child in children {
                if child_spawned_after(msg, child) {
                    lines.push(String::new());
                    lines.extend(self.build_child_block(child));
                }
            }

            lines.push(String::new());
        }

        lines.push(self.build_trailer(bundle, sampled));

        lines.join("\n")
    }

    fn build_header(&self, bundle: &ConversationBundle) -> String {
        let conv = &bundle.conversation;

        let mut header = format!("=== CONVERSATION: {} ===\nAgent: {}", conv.id, conv.agent_type);
        if let Some(version) = &conv.agent_version {
            header.push_str(&format!(" v{}", version));
        }
        header.push_str(&format!(
            "\nType: {}\nStarted: {}",
            conv.conversation_type.as_str(),
            conv.start_time.format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(end) = conv.end_time {
            header.push_str(&format!("\nEnded: {}", end.format("%Y-%m-%d %H:%M:%S")));
            let minutes = (end - conv.start_time).num_minutes();
            if minutes > 0 {
                header.push_str(&format!("\nDuration: {} minutes", minutes));
            }
        }

        let mut status = conv.status.as_str().to_uppercase();
        match conv.success {
            Some(true) => status.push_str(" (SUCCESS)"),
            Some(false) => status.push_str(" (FAILED)"),
            None => {}
        }
        header.push_str(&format!(
            "\nStatus: {}\nMessages: {} | Epochs: {} | Files: {}",
            status, conv.message_count, conv.epoch_count, conv.files_count
        ));

        header
    }

    fn build_message(&self, msg: &Message) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();

        let time_str = msg
            .timestamp
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "??:??:??".to_string());

        let content = if msg.content.is_empty() {
            "(no content)".to_string()
        } else {
            truncate_chars(&msg.content, self.config.max_message_chars)
        };
        lines.push(format!(
            "[{}] {}: {}",
            time_str,
            msg.role.as_str().to_uppercase(),
            content
        ));

        if self.config.include_tool_details {
            if let Some(calls) = msg.tool_calls.as_array().filter(|a| !a.is_empty()) {
                let names: Vec<&str> = calls
                    .iter()
                    .map(|c| c.get("tool_name").and_then(|v| v.as_str()).unwrap_or("unknown"))
                    .collect();
                lines.push(format!("  [TOOLS: {}]", names.join(", ")));

                for call in calls {
                    let name = call
                        .get("tool_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let params = call
                        .get("parameters")
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    let params = truncate_chars(&params, self.config.max_tool_param_chars);
                    let mark = if call.get("success").and_then(|v| v.as_bool()).unwrap_or(true) {
                        "✓"
                    } else {
                        "✗"
                    };
                    lines.push(format!("    {} {}: {}", mark, name, params));
                }
            }
        }

        if self.config.include_code_changes {
            if let Some(changes) = msg.code_changes.as_array().filter(|a| !a.is_empty()) {
                for change in changes {
                    let file_path = change
                        .get("file_path")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let change_type = change
                        .get("change_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let added = change.get("lines_added").and_then(|v| v.as_i64()).unwrap_or(0);
                    let deleted = change
                        .get("lines_deleted")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    let mut line = format!("  [CODE: {} - {}", file_path, change_type);
                    if added > 0 || deleted > 0 {
                        line.push_str(&format!(" (+{}/-{})", added, deleted));
                    }
                    line.push(']');
                    lines.push(line);
                }
            }
        }

        if self.config.include_thinking {
            if let Some(thinking) = &msg.thinking_content {
                lines.push(format!(
                    "  [THINKING: {}]",
                    truncate_chars(thinking, self.config.max_thinking_chars)
                ));
            }
        }

        lines
    }

    fn build_child_block(&self, child: &CanonicalConversation) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("  ┌─ AGENT DELEGATION: {} ─┐", child.conversation_id));
        lines.push(format!("  │ Type: {}", child.conversation_type));
        lines.push(format!("  │ Messages: {}", child.message_count));
        if !child.tools_used.is_empty() {
            let shown: Vec<&str> = child.tools_used.iter().take(5).map(String::as_str).collect();
            lines.push(format!("  │ Tools: {}", shown.join(", ")));
        }
        lines.push("  │".to_string());
        for line in child.narrative.lines() {
            if !line.trim().is_empty() {
                lines.push(format!("  │   {}", line));
            }
        }
        lines.push("  └──────────────────────────────────────┘".to_string());
        lines
    }

    fn build_trailer(&self, bundle: &ConversationBundle, sampled: &[SampledMessage]) -> String {
        let tags = &bundle.conversation.tags;
        let mut trailer = String::from("=== SUMMARY ===");

        if let Some(outcome) = tags.get("outcome").and_then(|v| v.as_str()) {
            trailer.push_str(&format!("\nOutcome: {}", outcome.to_uppercase()));
        }
        if let Some(sentiment) = tags.get("sentiment").and_then(|v| v.as_str()) {
            let score = tags
                .get("sentiment_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            trailer.push_str(&format!("\nSentiment: {} ({:.1})", sentiment, score));
        }
        for (key, label) in [("problems", "Problems"), ("features", "Features")] {
            if let Some(items) = tags.get(key).and_then(|v| v.as_array()) {
                let top: Vec<&str> = items.iter().filter_map(|v| v.as_str()).take(3).collect();
                if !top.is_empty() {
                    trailer.push_str(&format!("\n{}: {}", label, top.join(", ")));
                }
            }
        }

        let mut tools: Vec<&str> = sampled
            .iter()
            .flat_map(|sm| {
                sm.message
                    .tool_calls
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|c| c.get("tool_name").and_then(|v| v.as_str()))
            })
            .collect();
        tools.sort_unstable();
        tools.dedup();
        if !tools.is_empty() {
            trailer.push_str(&format!("\nTools Used: {}", tools.join(", ")));
        }

        trailer.push_str(&format!(
            "\n\nSampling: {}/{} messages included",
            sampled.len(),
            bundle.conversation.message_count
        ));

        trailer
    }
}

fn child_spawned_after(msg: &Message, child: &CanonicalConversation) -> bool {
    let Some(timestamp) = msg.timestamp else {
        return false;
    };
    let delta = (child.start_time - timestamp).num_seconds().abs();
    delta < CHILD_SPAWN_WINDOW_SECS
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("0123456789abc", 10), "0123456789...");
        // Multi-byte safety
        assert_eq!(truncate_chars("ééééé", 3), "ééé...");
    }
}
