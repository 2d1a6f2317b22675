//! `send` tool (`spec.md` §4.4, §4.1 edge cases, scenario S3): delivers a
//! message to any route the bot has been addressed on, not just the
//! originating one. `target` is a route id as returned by `get_contacts`.

use crate::chat_provider::ToolSpec;
use crate::error::{Result, ToolError};
use crate::mcp::ToolExecutor;
use crate::channels::ChannelManager;
use crate::routes::RouteStore;
use crate::{AttachmentPart, AttachmentSource, BotId, Envelope, EnvelopeTarget, MessagePart};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {
    /// Route id obtained from `get_contacts`, naming which bound channel and
    /// conversation to deliver to.
    target: String,
    text: String,
    /// Paths under the bot's own workspace to attach, most recent last.
    #[serde(default)]
    attachments: Vec<String>,
}

pub struct SendTool {
    channels: Arc<ChannelManager>,
    routes: Arc<RouteStore>,
}

impl SendTool {
    pub fn new(channels: Arc<ChannelManager>, routes: Arc<RouteStore>) -> Self {
        Self { channels, routes }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for SendTool {
    fn name(&self) -> &str {
        "send"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Send a message to any channel/conversation the bot is bound to, identified by a route id from get_contacts. Use this for cross-channel delivery; for a direct reply in the current conversation, plain assistant text is enough.".into(),
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

        let mut blocks = vec![MessagePart::Text { text: args.text }];
        for path in &args.attachments {
            blocks.push(MessagePart::Attachment(AttachmentPart {
                mime: mime_guess::from_path(path).first_or_octet_stream().to_string(),
                name: std::path::Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned()),
                source: AttachmentSource::Url { url: path.clone() },
            }));
        }

        let envelope = Envelope {
            target: EnvelopeTarget {
                conversation_id: route.external_conversation_id.clone(),
                thread_id: route.external_thread_id.clone(),
                reply_to: None,
            },
            blocks,
            reaction: None,
        };

        self.channels.send(bot_id, route.channel_type, &envelope).await?;

        Ok(serde_json::json!({"sent": true, "target": route_id.to_string()}))
    }
}
