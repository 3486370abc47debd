//! Message sampling strategies for canonicalization
//!
//! Three strategies collapse arbitrarily large conversations into a
//! bounded, high-signal message subset:
//!
//! - **Semantic** (default): priority scoring, highest first until the
//!   budget is spent, then chronological re-sort.
//! - **Epoch**: first and last epoch in full, key messages from the
//!   middle while budget remains.
//! - **Chronological**: everything, budget ignored; for large-context
//!   consumers and archival.

use crate::canonical::tokens::TokenEstimator;
use crate::canonical::CanonicalConfig;
use crate::error::{Error, Result};
use crate::types::{Epoch, Message};
use std::collections::{HashMap, HashSet};

/// Keywords that mark a message as error-bearing.
const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "exception",
    "failed",
    "failure",
    "traceback",
    "warning",
    "[error]",
    "[warning]",
];

/// Which sampler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingStrategy {
    #[default]
    Semantic,
    Epoch,
    Chronological,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Semantic => "semantic",
            SamplingStrategy::Epoch => "epoch",
            SamplingStrategy::Chronological => "chronological",
        }
    }
}

impl std::str::FromStr for SamplingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(SamplingStrategy::Semantic),
            "epoch" => Ok(SamplingStrategy::Epoch),
            "chronological" => Ok(SamplingStrategy::Chronological),
            other => Err(Error::InvalidArgument(format!(
                "unknown sampling strategy: {}",
                other
            ))),
        }
    }
}

/// A message chosen by a sampler, with why and at what estimated cost.
#[derive(Debug, Clone)]
pub struct SampledMessage<'a> {
    pub message: &'a Message,
    pub priority: i32,
    pub reason: String,
    pub estimated_tokens: i64,
}

// Priority levels (higher wins; ties broken by sequence ascending)
const PRIORITY_FIRST_LAST: i32 = 1000;
const PRIORITY_FIRST_LAST_N: i32 = 900;
const PRIORITY_ERROR: i32 = 900;
const PRIORITY_TOOL_CALL: i32 = 800;
const PRIORITY_THINKING: i32 = 700;
const PRIORITY_EPOCH_BOUNDARY: i32 = 600;
const PRIORITY_CODE_CHANGE: i32 = 500;
const PRIORITY_NORMAL: i32 = 100;

/// Run the selected strategy.
pub fn sample<'a>(
    strategy: SamplingStrategy,
    config: &CanonicalConfig,
    estimator: &TokenEstimator,
    messages: &'a [Message],
    epochs: &[Epoch],
    token_budget: i64,
) -> Vec<SampledMessage<'a>> {
    match strategy {
        SamplingStrategy::Semantic => {
            semantic_sample(config, estimator, messages, epochs, token_budget)
        }
        SamplingStrategy::Epoch => epoch_sample(config, estimator, messages, epochs, token_budget),
        SamplingStrategy::Chronological => chronological_sample(config, estimator, messages),
    }
}

/// Semantic sampler: include highest-priority first until the budget
/// is exhausted; always include at least two messages; output re-sorted
/// by sequence.
pub fn semantic_sample<'a>(
    config: &CanonicalConfig,
    estimator: &TokenEstimator,
    messages: &'a [Message],
    epochs: &[Epoch],
    token_budget: i64,
) -> Vec<SampledMessage<'a>> {
    if messages.is_empty() {
        return vec![];
    }

    let boundaries = epoch_boundaries(messages, epochs);
    let mut prioritized: Vec<SampledMessage<'a>> = Vec::with_capacity(messages.len());

    for (i, msg) in messages.iter().enumerate() {
        let mut priority = PRIORITY_NORMAL;
        let mut reasons: Vec<String> = Vec::new();

        if i == 0 {
            priority = priority.max(PRIORITY_FIRST_LAST);
            reasons.push("first".into());
        } else if i == messages.len() - 1 {
            priority = priority.max(PRIORITY_FIRST_LAST);
            reasons.push("last".into());
        } else if i < config.always_include_first_n {
            priority = priority.max(PRIORITY_FIRST_LAST_N);
            reasons.push(format!("first-{}", config.always_include_first_n));
        } else if i >= messages.len().saturating_sub(config.always_include_last_n) {
            priority = priority.max(PRIORITY_FIRST_LAST_N);
            reasons.push(format!("last-{}", config.always_include_last_n));
        }

        if has_error(msg) {
            priority = priority.max(PRIORITY_ERROR);
            reasons.push("error".into());
        }
        if msg.has_tool_calls() {
            priority = priority.max(PRIORITY_TOOL_CALL);
            reasons.push(format!(
                "tools:{}",
                msg.tool_calls.as_array().map(|a| a.len()).unwrap_or(0)
            ));
        }
        if msg.thinking_content.is_some() && config.include_thinking {
            priority = priority.max(PRIORITY_THINKING);
            reasons.push("thinking".into());
        }
        if boundaries.contains(&msg.id) {
            priority = priority.max(PRIORITY_EPOCH_BOUNDARY);
            reasons.push("epoch-boundary".into());
        }
        if msg.has_code_changes() {
            priority = priority.max(PRIORITY_CODE_CHANGE);
            reasons.push(format!(
                "code:{}",
                msg.code_changes.as_array().map(|a| a.len()).unwrap_or(0)
            ));
        }

        prioritized.push(SampledMessage {
            message: msg,
            priority,
            reason: if reasons.is_empty() {
                "normal".into()
            } else {
                reasons.join(", ")
            },
            estimated_tokens: estimate_message_tokens(config, estimator, msg),
        });
    }

    // Priority descending, sequence ascending on ties
    prioritized.sort_by_key(|sm| (-sm.priority, sm.message.sequence));

    let mut sampled: Vec<SampledMessage<'a>> = Vec::new();
    let mut total_tokens = 0i64;
    for sm in prioritized {
        if total_tokens + sm.estimated_tokens <= token_budget {
            total_tokens += sm.estimated_tokens;
            sampled.push(sm);
        } else if sampled.len() < 2 {
            // Always include at least two messages
            total_tokens += sm.estimated_tokens;
            sampled.push(sm);
        }
    }

    // Chronological output order
    sampled.sort_by_key(|sm| sm.message.sequence);

    tracing::debug!(
        sampled = sampled.len(),
        total = messages.len(),
        tokens = total_tokens,
        budget = token_budget,
        "Semantic sampling complete"
    );

    sampled
}

/// Epoch sampler: first and last epoch fully, key messages from the
/// middle epochs while budget remains.
pub fn epoch_sample<'a>(
    config: &CanonicalConfig,
    estimator: &TokenEstimator,
    messages: &'a [Message],
    epochs: &[Epoch],
    token_budget: i64,
) -> Vec<SampledMessage<'a>> {
    if messages.is_empty() || epochs.is_empty() {
        return vec![];
    }

    let mut by_epoch: HashMap<&str, Vec<&'a Message>> = HashMap::new();
    for msg in messages {
        by_epoch.entry(msg.epoch_id.as_str()).or_default().push(msg);
    }

    let mut sorted_epochs: Vec<&Epoch> = epochs.iter().collect();
    sorted_epochs.sort_by_key(|e| e.sequence);

    let mut sampled: Vec<SampledMessage<'a>> = Vec::new();
    let mut total_tokens = 0i64;

    let include_fully = |epoch: &Epoch,
                             reason: &str,
                             sampled: &mut Vec<SampledMessage<'a>>,
                             total_tokens: &mut i64| {
        if let Some(msgs) = by_epoch.get(epoch.id.as_str()) {
            for msg in msgs {
                let tokens = estimate_message_tokens(config, estimator, msg);
                sampled.push(SampledMessage {
                    message: msg,
                    priority: PRIORITY_FIRST_LAST,
                    reason: reason.to_string(),
                    estimated_tokens: tokens,
                });
                *total_tokens += tokens;
            }
        }
    };

    include_fully(sorted_epochs[0], "first-epoch", &mut sampled, &mut total_tokens);
    if sorted_epochs.len() > 1 {
        include_fully(
            sorted_epochs[sorted_epochs.len() - 1],
            "last-epoch",
            &mut sampled,
            &mut total_tokens,
        );
    }

    // Middle epochs: key messages only, while budget remains
    if sorted_epochs.len() > 2 {
        for epoch in &sorted_epochs[1..sorted_epochs.len() - 1] {
            let Some(msgs) = by_epoch.get(epoch.id.as_str()) else {
                continue;
            };
            for msg in msgs {
                if !is_key_message(config, msg) {
                    continue;
                }
                let tokens = estimate_message_tokens(config, estimator, msg);
                if total_tokens + tokens <= token_budget {
                    sampled.push(SampledMessage {
                        message: msg,
                        priority: PRIORITY_CODE_CHANGE,
                        reason: "middle-epoch-key".to_string(),
                        estimated_tokens: tokens,
                    });
                    total_tokens += tokens;
                }
            }
        }
    }

    sampled.sort_by_key(|sm| sm.message.sequence);
    sampled
}

/// Chronological sampler: everything, in order, budget ignored.
pub fn chronological_sample<'a>(
    config: &CanonicalConfig,
    estimator: &TokenEstimator,
    messages: &'a [Message],
) -> Vec<SampledMessage<'a>> {
    let mut sampled: Vec<SampledMessage<'a>> = messages
        .iter()
        .map(|msg| SampledMessage {
            message: msg,
            priority: PRIORITY_FIRST_LAST,
            reason: "chronological".to_string(),
            estimated_tokens: estimate_message_tokens(config, estimator, msg),
        })
        .collect();
    sampled.sort_by_key(|sm| sm.message.sequence);
    sampled
}

fn epoch_boundaries(messages: &[Message], epochs: &[Epoch]) -> HashSet<String> {
    let mut boundaries = HashSet::new();
    let mut by_epoch: HashMap<&str, Vec<&Message>> = HashMap::new();
    for msg in messages {
        by_epoch.entry(msg.epoch_id.as_str()).or_default().push(msg);
    }
    for epoch in epochs {
        if let Some(msgs) = by_epoch.get_mut(epoch.id.as_str()) {
            msgs.sort_by_key(|m| m.sequence);
            if let Some(first) = msgs.first() {
                boundaries.insert(first.id.clone());
            }
            if msgs.len() > 1 {
                if let Some(last) = msgs.last() {
                    boundaries.insert(last.id.clone());
                }
            }
        }
    }
    boundaries
}

pub(crate) fn has_error(message: &Message) -> bool {
    let content = message.content.to_lowercase();
    ERROR_KEYWORDS.iter().any(|kw| content.contains(kw))
}

fn is_key_message(config: &CanonicalConfig, message: &Message) -> bool {
    message.has_tool_calls()
        || (message.thinking_content.is_some() && config.include_thinking)
        || message.has_code_changes()
        || has_error(message)
}

/// Per-message token estimate: truncated content plus structural
/// overhead for role/timestamp, tool calls, and code changes.
fn estimate_message_tokens(
    config: &CanonicalConfig,
    estimator: &TokenEstimator,
    message: &Message,
) -> i64 {
    let mut tokens = 10i64; // role + timestamp structure

    let content_chars = message.content.chars().count();
    let counted = content_chars.min(config.max_message_chars);
    tokens += estimator.estimate(&message.content.chars().take(counted).collect::<String>());

    if config.include_thinking {
        if let Some(thinking) = &message.thinking_content {
            let counted: String = thinking.chars().take(config.max_thinking_chars).collect();
            tokens += estimator.estimate(&counted);
        }
    }
    if config.include_tool_details {
        tokens += 50 * message.tool_calls.as_array().map(|a| a.len()).unwrap_or(0) as i64;
    }
    if config.include_code_changes {
        tokens += 30 * message.code_changes.as_array().map(|a| a.len()).unwrap_or(0) as i64;
    }

    tokens
}
