//! `react` tool (`spec.md` §4.4): sends a reaction-only envelope to a route,
//! e.g. acknowledging a message without composing a reply.

use crate::chat_provider::ToolSpec;
use crate::channels::ChannelManager;
use crate::error::{Result, ToolError};
use crate::mcp::ToolExecutor;
use crate::routes::RouteStore;
use crate::{BotId, Envelope, EnvelopeTarget};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {
    target: String,
    /// Reaction emoji/shortcode, channel-vendor specific (e.g. "👍").
    reaction: String,
    /// External message id to react to, if the channel supports per-message
    /// reactions rather than per-conversation ones.
    reply_to: Option<String>,
}

pub struct ReactTool {
    channels: Arc<ChannelManager>,
    routes: Arc<RouteStore>,
}

impl ReactTool {
    pub fn new(channels: Arc<ChannelManager>, routes: Arc<RouteStore>) -> Self {
        Self { channels, routes }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ReactTool {
    fn name(&self) -> &str {
        "react"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "React to a message on any bound channel/conversation, identified by a route id from get_contacts.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(Args)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: Args = serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;

        let route_id = args.target.parse().map_err(|_| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: format!("not a valid route id: {}", args.target),
        })?;
        let route = self.routes.get(route_id).await?;
        if route.bot_id != bot_id {
            return Err(ToolError::InvalidInput {
                name: self.name().to_string(),
                message: "route does not belong to this bot".into(),
            }
            .into());
        }

        let envelope = Envelope {
            target: EnvelopeTarget {
                conversation_id: route.external_conversation_id.clone(),
                thread_id: route.external_thread_id.clone(),
                reply_to: args.reply_to,
            },
            blocks: vec![],
            reaction: Some(args.reaction),
        };

        self.channels.send(bot_id, route.channel_type, &envelope).await?;
        Ok(serde_json::json!({"reacted": true}))
    }
}
