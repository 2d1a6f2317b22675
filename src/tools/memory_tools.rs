//! `search_memory` and `search_inbox` tools (`spec.md` §4.3, §4.4).

use crate::chat_provider::ToolSpec;
use crate::error::Result;
use crate::inbox::InboxStore;
use crate::mcp::ToolExecutor;
use crate::memory::types::Scope;
use crate::memory::{MemoryEngine, SearchSources};
use crate::BotId;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchMemoryArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

pub struct SearchMemoryTool {
    memory: Arc<MemoryEngine>,
}

impl SearchMemoryTool {
    pub fn new(memory: Arc<MemoryEngine>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Search this bot's long-term memory for facts relevant to a query, fused across dense and keyword retrieval.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(SearchMemoryArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: SearchMemoryArgs = serde_json::from_value(input).map_err(|e| {
            crate::error::ToolError::InvalidInput { name: self.name().to_string(), message: e.to_string() }
        })?;

        let scope = Scope::for_bot(bot_id);
        let results = self
            .memory
            .search(bot_id, &args.query, &scope, args.limit, SearchSources::Hybrid)
            .await?;

        let items: Vec<_> = results
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.item.id.to_string(),
                    "text": r.item.text,
                    "score": r.score,
                    "rank": r.rank,
                    "updated_at": r.item.updated_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::json!({"memories": items}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchInboxArgs {
    #[serde(default = "default_limit")]
    limit: usize,
}

pub struct SearchInboxTool {
    inbox: Arc<InboxStore>,
}

impl SearchInboxTool {
    pub fn new(inbox: Arc<InboxStore>) -> Self {
        Self { inbox }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for SearchInboxTool {
    fn name(&self) -> &str {
        "search_inbox"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "List unconsumed notifications from channels/conversations other than the current one.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(SearchInboxArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: SearchInboxArgs = serde_json::from_value(input).map_err(|e| {
            crate::error::ToolError::InvalidInput { name: self.name().to_string(), message: e.to_string() }
        })?;

        let items = self.inbox.unconsumed(bot_id, args.limit).await?;
        let out: Vec<_> = items
            .into_iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id.to_string(),
                    "route_id": i.route_id.to_string(),
                    "channel_type": i.channel_type.to_string(),
                    "summary": i.summary,
                    "created_at": i.created_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::json!({"inbox": out}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompactMemoryArgs {}

pub struct CompactMemoryTool {
    memory: Arc<MemoryEngine>,
}

impl CompactMemoryTool {
    pub fn new(memory: Arc<MemoryEngine>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for CompactMemoryTool {
    fn name(&self) -> &str {
        "compact_memory"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Consolidate this bot's long-term memory into a smaller set of canonical facts, dropping redundant or superseded entries.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(CompactMemoryArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, _input: serde_json::Value) -> Result<serde_json::Value> {
        let scope = Scope::for_bot(bot_id);
        let remaining = self.memory.compact(bot_id, &scope).await?;
        Ok(serde_json::json!({"remaining_facts": remaining}))
    }
}
