//! Memory Engine types (`spec.md` §3 MemoryItem, §6 manifest/entry file
//! formats, GLOSSARY "Scope").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `{userId, agentId, runId}` filter tuple that partitions memory
/// points (GLOSSARY "Scope"). Any field may be absent; absent fields are
/// not filtered on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
}

impl Scope {
    pub fn for_bot(bot_id: crate::BotId) -> Self {
        Self {
            agent_id: Some(bot_id.to_string()),
            ..Default::default()
        }
    }

    /// Scope-filter JSON stored alongside each manifest entry.
    pub fn as_filters(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Whether `item_scope` falls within `self` as a filter: every field
    /// `self` sets must match `item_scope`'s corresponding field; fields
    /// `self` leaves unset match anything.
    pub fn matches(&self, item_scope: &Scope) -> bool {
        fn field_matches(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                None => true,
                Some(f) => value.as_deref() == Some(f.as_str()),
            }
        }
        field_matches(&self.user_id, &item_scope.user_id)
            && field_matches(&self.agent_id, &item_scope.agent_id)
            && field_matches(&self.run_id, &item_scope.run_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Multimodal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    pub text: String,
    pub content_hash: String,
    pub scope: Scope,
    pub modality: Modality,
    pub embedding_model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `hashMemory(text) = md5(text)` per §4.3 Determinism. The embedding-input
/// hash additionally mixes any image/video URLs referenced by the fact so
/// multimodal facts with identical text but different media don't collide.
pub fn hash_memory(text: &str, media_urls: &[String]) -> String {
    let mut input = text.to_string();
    for url in media_urls {
        input.push('\u{0}');
        input.push_str(url);
    }
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// One step of the LLM's `Decide` output (§4.3 Add algorithm step 3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryDecision {
    pub event: DecisionEvent,
    pub id: Option<Uuid>,
    pub text: String,
    pub old_memory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionEvent {
    Add,
    Update,
    Delete,
    None,
}

/// Result of `Extract` (§4.3 step 1).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFacts {
    pub facts: Vec<String>,
}

/// A search hit with its fused score and rank.
#[derive(Debug, Clone)]
pub struct MemorySearchResult {
    pub item: MemoryItem,
    pub score: f64,
    pub rank: usize,
}

/// Where a search result came from, for per-source rank fusion (§4.3
/// Search algorithm, GLOSSARY "RRF").
#[derive(Debug, Clone)]
pub struct SourceHit {
    pub id: Uuid,
    pub rank: usize,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_memory_is_deterministic_and_media_sensitive() {
        let a = hash_memory("loves pizza", &[]);
        let b = hash_memory("loves pizza", &[]);
        assert_eq!(a, b);

        let c = hash_memory("loves pizza", &["https://example.com/img.png".into()]);
        assert_ne!(a, c);
    }

    #[test]
    fn scope_matches_treats_unset_fields_as_wildcards() {
        let filter = Scope { agent_id: Some("bot-1".into()), ..Default::default() };
        let matching = Scope { agent_id: Some("bot-1".into()), user_id: Some("u1".into()), run_id: None };
        let other_bot = Scope { agent_id: Some("bot-2".into()), ..Default::default() };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_bot));
    }
}
