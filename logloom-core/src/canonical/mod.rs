//! Canonicalization
//!
//! Collapses a conversation (plus optional child agents) into a
//! bounded textual narrative optimized for downstream LLM consumption.
//! Narratives are cached per `(conversation_id, canonical_type)` and
//! invalidated by algorithm version or estimated source token growth.

mod builder;
mod sampler;
mod tokens;

pub use sampler::{SampledMessage, SamplingStrategy};
pub use tokens::{BudgetAllocator, TokenEstimator};

use crate::db::{repo, Database};
use crate::error::{Error, Result};
use crate::types::*;
use builder::PlayFormatBuilder;
use chrono::{DateTime, Duration, Utc};

/// Bumped whenever the narrative algorithm changes; any cached entry
/// with an older version regenerates on next read.
pub const CANONICAL_VERSION: i64 = 3;

/// Canonical flavor, each with its nominal token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalType {
    Tagging,
    Insights,
    Export,
}

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Tagging => "tagging",
            CanonicalType::Insights => "insights",
            CanonicalType::Export => "export",
        }
    }

    pub fn token_budget(&self) -> i64 {
        match self {
            CanonicalType::Tagging => 8_000,
            CanonicalType::Insights => 12_000,
            CanonicalType::Export => 20_000,
        }
    }
}

impl std::str::FromStr for CanonicalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tagging" => Ok(CanonicalType::Tagging),
            "insights" => Ok(CanonicalType::Insights),
            "export" => Ok(CanonicalType::Export),
            other => Err(Error::InvalidArgument(format!(
                "unknown canonical type: {}",
                other
            ))),
        }
    }
}

/// Tunables for one canonicalization run.
#[derive(Debug, Clone)]
pub struct CanonicalConfig {
    pub token_budget: i64,
    /// Budget ceiling shared across children
    pub child_token_budget: i64,
    pub always_include_first_n: usize,
    pub always_include_last_n: usize,
    pub include_thinking: bool,
    pub include_tool_details: bool,
    pub include_code_changes: bool,
    pub include_children: bool,
    pub max_message_chars: usize,
    pub max_thinking_chars: usize,
    pub max_tool_param_chars: usize,
}

impl CanonicalConfig {
    pub fn for_type(canonical_type: CanonicalType) -> Self {
        Self {
            token_budget: canonical_type.token_budget(),
            child_token_budget: canonical_type.token_budget() / 4,
            always_include_first_n: 3,
            always_include_last_n: 3,
            include_thinking: true,
            include_tool_details: true,
            include_code_changes: true,
            include_children: true,
            max_message_chars: 2000,
            max_thinking_chars: 500,
            max_tool_param_chars: 200,
        }
    }
}

/// Everything the canonicalizer needs about one conversation, loaded
/// in a single workspace-scoped read.
#[derive(Debug)]
pub struct ConversationBundle {
    pub conversation: Conversation,
    pub epochs: Vec<Epoch>,
    pub messages: Vec<Message>,
    pub files_touched: Vec<FileTouched>,
}

impl ConversationBundle {
    pub fn load(db: &Database, workspace_id: &str, conversation_id: &str) -> Result<Self> {
        db.with_conn(|conn| {
            let conversation = repo::get_conversation(conn, workspace_id, conversation_id)?
                .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
            let epochs = repo::list_epochs(conn, conversation_id)?;
            let messages = repo::list_messages(conn, conversation_id)?;
            let files_touched = repo::list_files_touched(conn, conversation_id)?;
            Ok(Self {
                conversation,
                epochs,
                messages,
                files_touched,
            })
        })
    }
}

/// The canonical representation of one conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CanonicalConversation {
    pub conversation_id: String,
    pub session_id: Option<String>,
    pub agent_type: String,
    pub agent_version: Option<String>,
    pub conversation_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub message_count: i64,
    pub epoch_count: i64,
    pub files_count: i64,
    pub tool_calls_count: i64,
    pub sampled_count: i64,
    pub narrative: String,
    pub token_count: i64,
    pub parent_id: Option<String>,
    pub children: Vec<CanonicalConversation>,
    pub tools_used: Vec<String>,
    pub files_touched: Vec<String>,
    pub has_errors: bool,
    pub version: i64,
    pub generated_at: DateTime<Utc>,
    /// True when served from cache rather than regenerated
    pub from_cache: bool,
}

/// Converts conversations into canonical narrative form.
pub struct Canonicalizer {
    canonical_type: CanonicalType,
    config: CanonicalConfig,
    strategy: SamplingStrategy,
    estimator: TokenEstimator,
}

impl Canonicalizer {
    pub fn new(canonical_type: CanonicalType, strategy: SamplingStrategy) -> Self {
        Self {
            canonical_type,
            config: CanonicalConfig::for_type(canonical_type),
            strategy,
            estimator: TokenEstimator::new(),
        }
    }

    pub fn with_config(mut self, config: CanonicalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CanonicalConfig {
        &self.config
    }

    /// Canonicalize one conversation with its (already loaded) children.
    pub fn canonicalize(
        &self,
        bundle: &ConversationBundle,
        children: &[ConversationBundle],
    ) -> CanonicalConversation {
        // Budget allocation: 10% metadata, children capped at 30%,
        // remainder to main messages.
        let mut allocator = BudgetAllocator::new(self.config.token_budget);
        allocator.allocate("metadata", 0.10);
        let child_fraction = if !children.is_empty() && self.config.include_children {
            (self.config.child_token_budget as f64 / self.config.token_budget as f64).min(0.30)
        } else {
            0.0
        };
        allocator.allocate("children", child_fraction);
        allocator.allocate("main_messages", 1.0 - 0.10 - child_fraction);

        let main_budget = allocator.share("main_messages");
        let sampled = sampler::sample(
            self.strategy,
            &self.config,
            &self.estimator,
            &bundle.messages,
            &bundle.epochs,
            main_budget,
        );

        // Children never recurse further: include_children=false caps
        // nesting at one level.
        let canonical_children: Vec<CanonicalConversation> = if child_fraction > 0.0 {
            let per_child = allocator.share("children") / children.len().max(1) as i64;
            let mut child_config = self.config.clone();
            child_config.token_budget = per_child.max(1);
            child_config.include_children = false;
            let child_canonicalizer = Canonicalizer {
                canonical_type: self.canonical_type,
                config: child_config,
                strategy: self.strategy,
                estimator: self.estimator,
            };
            children
                .iter()
                .map(|child| child_canonicalizer.canonicalize(child, &[]))
                .collect()
        } else {
            vec![]
        };

        let narrative = PlayFormatBuilder::new(&self.config).build(
            bundle,
            &sampled,
            &canonical_children,
        );
        let token_count = self.estimator.estimate(&narrative);

        let conv = &bundle.conversation;
        let duration_seconds = conv.end_time.map(|end| (end - conv.start_time).num_seconds());

        let mut tools_used: Vec<String> = sampled
            .iter()
            .flat_map(|sm| {
                sm.message
                    .tool_calls
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|c| c.get("tool_name").and_then(|v| v.as_str()))
                    .map(ToString::to_string)
            })
            .collect();
        tools_used.sort();
        tools_used.dedup();

        let tool_calls_count = sampled
            .iter()
            .map(|sm| sm.message.tool_calls.as_array().map(|a| a.len()).unwrap_or(0) as i64)
            .sum();
        let has_errors = sampled.iter().any(|sm| sampler::has_error(sm.message));

        tracing::info!(
            conversation_id = %conv.id,
            canonical_type = self.canonical_type.as_str(),
            strategy = self.strategy.as_str(),
            tokens = token_count,
            sampled = sampled.len(),
            "Canonicalized conversation"
        );

        CanonicalConversation {
            conversation_id: conv.id.clone(),
            session_id: conv.session_id().map(ToString::to_string),
            agent_type: conv.agent_type.clone(),
            agent_version: conv.agent_version.clone(),
            conversation_type: conv.conversation_type.as_str().to_string(),
            start_time: conv.start_time,
            end_time: conv.end_time,
            duration_seconds,
            message_count: conv.message_count,
            epoch_count: conv.epoch_count,
            files_count: conv.files_count,
            tool_calls_count,
            sampled_count: sampled.len() as i64,
            narrative,
            token_count,
            parent_id: conv.parent_conversation_id.clone(),
            children: canonical_children,
            tools_used,
            files_touched: bundle
                .files_touched
                .iter()
                .map(|f| f.file_path.clone())
                .collect(),
            has_errors,
            version: CANONICAL_VERSION,
            generated_at: Utc::now(),
            from_cache: false,
        }
    }
}

// ============================================
// Cache-first access
// ============================================

/// Options for [`get_or_generate`].
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub canonical_type: CanonicalType,
    pub strategy: SamplingStrategy,
    pub force_regenerate: bool,
    pub regeneration_threshold_tokens: i64,
    pub include_children: bool,
}

impl CanonicalRequest {
    pub fn new(canonical_type: CanonicalType) -> Self {
        Self {
            canonical_type,
            strategy: SamplingStrategy::Semantic,
            force_regenerate: false,
            regeneration_threshold_tokens: 2000,
            include_children: true,
        }
    }
}

/// Cache-first canonical access: return the cached narrative when it
/// is still fresh, otherwise regenerate and store it.
pub fn get_or_generate(
    db: &Database,
    workspace_id: &str,
    conversation_id: &str,
    request: &CanonicalRequest,
) -> Result<CanonicalConversation> {
    let bundle = ConversationBundle::load(db, workspace_id, conversation_id)?;

    if !request.force_regenerate {
        let cached = db.with_conn(|conn| {
            repo::get_canonical_cache(conn, conversation_id, request.canonical_type.as_str())
        })?;
        if let Some(cached) = cached {
            if !should_regenerate(
                &bundle.conversation,
                &cached,
                request.regeneration_threshold_tokens,
            ) {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    canonical_type = request.canonical_type.as_str(),
                    "Serving canonical from cache"
                );
                return Ok(from_cache_entry(&bundle.conversation, &cached));
            }
        }
    }

    // Load children for inlining
    let children: Vec<ConversationBundle> = if request.include_children {
        let child_ids: Vec<String> = db.with_conn(|conn| {
            Ok(repo::list_children(conn, workspace_id, conversation_id)?
                .into_iter()
                .map(|c| c.id)
                .collect())
        })?;
        child_ids
            .iter()
            .filter_map(|id| ConversationBundle::load(db, workspace_id, id).ok())
            .collect()
    } else {
        vec![]
    };

    let canonicalizer = Canonicalizer::new(request.canonical_type, request.strategy);
    let canonical = canonicalizer.canonicalize(&bundle, &children);

    save_canonical(db, workspace_id, &bundle.conversation, &canonical, request)?;

    Ok(canonical)
}

/// Window-based invalidation: version mismatch or estimated token
/// growth past the threshold.
fn should_regenerate(
    conversation: &Conversation,
    cached: &CanonicalCacheEntry,
    threshold_tokens: i64,
) -> bool {
    if cached.version != CANONICAL_VERSION {
        tracing::info!(
            cached_version = cached.version,
            current_version = CANONICAL_VERSION,
            "Canonical regeneration: version mismatch"
        );
        return true;
    }

    let growth = (conversation.message_count - cached.source_message_count).abs();
    if growth > 0 {
        let avg_tokens_per_message = if cached.source_message_count > 0 {
            cached.source_token_estimate as f64 / cached.source_message_count as f64
        } else {
            100.0
        };
        let estimated_growth = growth as f64 * avg_tokens_per_message;
        if estimated_growth > threshold_tokens as f64 {
            tracing::info!(
                cached_messages = cached.source_message_count,
                current_messages = conversation.message_count,
                estimated_growth = estimated_growth as i64,
                threshold = threshold_tokens,
                "Canonical regeneration: token growth threshold exceeded"
            );
            return true;
        }
    }

    false
}

fn from_cache_entry(
    conversation: &Conversation,
    cached: &CanonicalCacheEntry,
) -> CanonicalConversation {
    CanonicalConversation {
        conversation_id: conversation.id.clone(),
        session_id: conversation.session_id().map(ToString::to_string),
        agent_type: conversation.agent_type.clone(),
        agent_version: conversation.agent_version.clone(),
        conversation_type: conversation.conversation_type.as_str().to_string(),
        start_time: conversation.start_time,
        end_time: conversation.end_time,
        duration_seconds: conversation
            .end_time
            .map(|end| (end - conversation.start_time).num_seconds()),
        message_count: cached.source_message_count,
        epoch_count: conversation.epoch_count,
        files_count: conversation.files_count,
        tool_calls_count: 0,
        sampled_count: 0,
        narrative: cached.narrative.clone(),
        token_count: cached.token_count,
        parent_id: conversation.parent_conversation_id.clone(),
        children: vec![],
        tools_used: vec![],
        files_touched: vec![],
        has_errors: false,
        version: cached.version,
        generated_at: cached.generated_at,
        from_cache: true,
    }
}

fn save_canonical(
    db: &Database,
    workspace_id: &str,
    conversation: &Conversation,
    canonical: &CanonicalConversation,
    request: &CanonicalRequest,
) -> Result<()> {
    // TTL: recently active projects churn, so their caches expire in
    // 7 days; dormant ones keep theirs for 30.
    let project_recently_active = db.with_conn(|conn| {
        Ok(match conversation.project_id.as_deref() {
            Some(project_id) => repo::get_project(conn, workspace_id, project_id)?
                .and_then(|p| p.last_activity_at)
                .map(|last| Utc::now() - last < Duration::days(7))
                .unwrap_or(false),
            None => false,
        })
    })?;
    let ttl_days = if project_recently_active { 7 } else { 30 };

    // Source token estimate feeds the growth window on later reads.
    // Conservative flat rate per message; the window only needs to be
    // proportional, not precise.
    let source_token_estimate: i64 = conversation.message_count * 100;

    let entry = CanonicalCacheEntry {
        id: new_id(),
        conversation_id: conversation.id.clone(),
        canonical_type: request.canonical_type.as_str().to_string(),
        version: CANONICAL_VERSION,
        narrative: canonical.narrative.clone(),
        token_count: canonical.token_count,
        source_message_count: conversation.message_count,
        source_token_estimate,
        generated_at: canonical.generated_at,
        expires_at: Some(Utc::now() + Duration::days(ttl_days)),
    };
    db.transaction(|tx| repo::upsert_canonical_cache(tx, &entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::{
        create_organization, create_workspace, get_or_create_default_epoch, insert_conversation,
        insert_message,
    };

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn seed_workspace(db: &Database) -> String {
        db.transaction(|tx| {
            let org = create_organization(tx, "acme")?;
            let ws = create_workspace(tx, &org.id, "dev")?;
            Ok(ws.id)
        })
        .unwrap()
    }

    fn seed_conversation(db: &Database, ws: &str, message_count: usize) -> String {
        let conv = Conversation {
            id: new_id(),
            workspace_id: ws.to_string(),
            project_id: None,
            developer_id: None,
            agent_type: "claude-code".into(),
            agent_version: Some("2.0.14".into()),
            start_time: "2025-03-01T09:00:00Z".parse().unwrap(),
            end_time: Some("2025-03-01T10:00:00Z".parse().unwrap()),
            status: ConversationStatus::Completed,
            success: Some(true),
            conversation_type: ConversationType::Main,
            parent_conversation_id: None,
            collector_session_id: None,
            collector_id: None,
            last_event_sequence: 0,
            message_count: 0,
            epoch_count: 0,
            files_count: 0,
            agent_metadata: serde_json::json!({}),
            extra_data: serde_json::json!({"session_id": "sess-canon"}),
            tags: serde_json::json!({"outcome": "success"}),
            plans: serde_json::json!([]),
        };
        let conv_id = conv.id.clone();
        db.transaction(|tx| {
            insert_conversation(tx, &conv)?;
            let epoch = get_or_create_default_epoch(tx, &conv.id, conv.start_time)?;
            for i in 1..=message_count {
                insert_message(
                    tx,
                    &Message {
                        id: new_id(),
                        conversation_id: conv.id.clone(),
                        epoch_id: epoch.id.clone(),
                        sequence: i as i64,
                        role: if i % 2 == 0 {
                            MessageRole::Assistant
                        } else {
                            MessageRole::User
                        },
                        content: format!("message number {} with some body text", i),
                        timestamp: Some(
                            "2025-03-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap()
                                + Duration::seconds(i as i64),
                        ),
                        model: None,
                        tool_calls: serde_json::json!([]),
                        tool_results: serde_json::json!([]),
                        code_changes: serde_json::json!([]),
                        thinking_content: None,
                        tokens_in: None,
                        tokens_out: None,
                        raw_data: serde_json::json!({}),
                    },
                )?;
            }
            repo::update_conversation_counts(tx, &conv.id)?;
            Ok(())
        })
        .unwrap();
        conv_id
    }

    #[test]
    fn test_narrative_structure() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws, 6);

        let bundle = ConversationBundle::load(&db, &ws, &conv_id).unwrap();
        let canonical = Canonicalizer::new(CanonicalType::Tagging, SamplingStrategy::Semantic)
            .canonicalize(&bundle, &[]);

        assert!(canonical.narrative.contains("=== CONVERSATION:"));
        assert!(canonical.narrative.contains("--- EPOCH 1 ---"));
        assert!(canonical.narrative.contains("USER:"));
        assert!(canonical.narrative.contains("ASSISTANT:"));
        assert!(canonical.narrative.contains("=== SUMMARY ==="));
        assert!(canonical.narrative.contains("Outcome: SUCCESS"));
        assert!(canonical
            .narrative
            .contains(&format!("Sampling: {}/6 messages included", canonical.sampled_count)));
        assert!(canonical.token_count > 0);
    }

    #[test]
    fn test_budget_bound_for_bounded_samplers() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws, 400);
        let bundle = ConversationBundle::load(&db, &ws, &conv_id).unwrap();

        for strategy in [SamplingStrategy::Semantic, SamplingStrategy::Epoch] {
            let canonical = Canonicalizer::new(CanonicalType::Tagging, strategy)
                .canonicalize(&bundle, &[]);
            let budget = CanonicalType::Tagging.token_budget();
            assert!(
                canonical.token_count <= budget + budget / 10,
                "{:?}: {} > 1.1 * {}",
                strategy,
                canonical.token_count,
                budget
            );
        }
    }

    #[test]
    fn test_chronological_may_exceed_and_reports() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws, 50);
        let bundle = ConversationBundle::load(&db, &ws, &conv_id).unwrap();

        let canonical = Canonicalizer::new(CanonicalType::Tagging, SamplingStrategy::Chronological)
            .canonicalize(&bundle, &[]);
        assert_eq!(canonical.sampled_count, 50);
        assert_eq!(
            canonical.token_count,
            TokenEstimator::new().estimate(&canonical.narrative)
        );
    }

    #[test]
    fn test_cache_round_trip_and_invalidation() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws, 10);
        let request = CanonicalRequest::new(CanonicalType::Tagging);

        let first = get_or_generate(&db, &ws, &conv_id, &request).unwrap();
        assert!(!first.from_cache);

        let second = get_or_generate(&db, &ws, &conv_id, &request).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.narrative, first.narrative);

        // Grow the conversation by 25 messages: at the flat 100-token
        // estimate that is ~2500 tokens, past the default 2000 window
        db.transaction(|tx| {
            let epoch = get_or_create_default_epoch(tx, &conv_id, Utc::now())?;
            for i in 11..=35 {
                insert_message(
                    tx,
                    &Message {
                        id: new_id(),
                        conversation_id: conv_id.clone(),
                        epoch_id: epoch.id.clone(),
                        sequence: i,
                        role: MessageRole::User,
                        content: "freshly appended message with plenty of text ".repeat(20),
                        timestamp: Some(Utc::now()),
                        model: None,
                        tool_calls: serde_json::json!([]),
                        tool_results: serde_json::json!([]),
                        code_changes: serde_json::json!([]),
                        thinking_content: None,
                        tokens_in: None,
                        tokens_out: None,
                        raw_data: serde_json::json!({}),
                    },
                )?;
            }
            repo::update_conversation_counts(tx, &conv_id)?;
            Ok(())
        })
        .unwrap();

        let third = get_or_generate(&db, &ws, &conv_id, &request).unwrap();
        assert!(!third.from_cache, "growth must invalidate the cache");
        assert_eq!(third.message_count, 35);

        let entry = db
            .with_conn(|c| repo::get_canonical_cache(c, &conv_id, "tagging"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.source_message_count, 35);
    }

    #[test]
    fn test_force_regenerate() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws, 5);
        let mut request = CanonicalRequest::new(CanonicalType::Insights);

        get_or_generate(&db, &ws, &conv_id, &request).unwrap();
        request.force_regenerate = true;
        let regenerated = get_or_generate(&db, &ws, &conv_id, &request).unwrap();
        assert!(!regenerated.from_cache);
    }

    #[test]
    fn test_children_inline_once() {
        let db = test_db();
        let ws = seed_workspace(&db);
        let parent_id = seed_conversation(&db, &ws, 4);
        let child_id = seed_conversation(&db, &ws, 3);
        db.transaction(|tx| repo::set_conversation_parent(tx, &child_id, &parent_id))
            .unwrap();

        let request = CanonicalRequest::new(CanonicalType::Export);
        let canonical = get_or_generate(&db, &ws, &parent_id, &request).unwrap();

        assert_eq!(canonical.children.len(), 1);
        assert!(canonical.narrative.contains("AGENT DELEGATION"));
        // Children are produced without further nesting
        assert!(canonical.children[0].children.is_empty());
    }

    #[test]
    fn test_cross_workspace_canonical_not_found() {
        let db = test_db();
        let ws1 = seed_workspace(&db);
        let ws2 = seed_workspace(&db);
        let conv_id = seed_conversation(&db, &ws1, 3);

        let request = CanonicalRequest::new(CanonicalType::Tagging);
        let err = get_or_generate(&db, &ws2, &conv_id, &request).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
