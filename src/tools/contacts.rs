//! `get_contacts` tool (`spec.md` §4.4): lists the routes (bound
//! channel/conversation pairs) this bot can target with `send`/`react`.

use crate::chat_provider::ToolSpec;
use crate::error::Result;
use crate::mcp::ToolExecutor;
use crate::routes::RouteStore;
use crate::BotId;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {}

pub struct GetContactsTool {
    routes: Arc<RouteStore>,
}

impl GetContactsTool {
    pub fn new(routes: Arc<RouteStore>) -> Self {
        Self { routes }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for GetContactsTool {
    fn name(&self) -> &str {
        "get_contacts"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "List every channel/conversation this bot has been addressed on, as route ids usable with send/react/schedule.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(Args)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, _input: serde_json::Value) -> Result<serde_json::Value> {
        let routes = self.routes.list_for_bot(bot_id).await?;
        let contacts: Vec<_> = routes
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "route_id": r.id.to_string(),
                    "channel_type": r.channel_type.to_string(),
                    "external_conversation_id": r.external_conversation_id,
                    "external_thread_id": r.external_thread_id,
                    "last_active_at": r.updated_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::json!({"contacts": contacts}))
    }
}
