//! `email_send` tool (`spec.md` §4.4, §4.5 channel adapters): sends a
//! one-off email, bypassing the route store since an email address is
//! already a self-describing delivery target.

use crate::chat_provider::ToolSpec;
use crate::channels::ChannelManager;
use crate::error::{Result, ToolError};
use crate::mcp::ToolExecutor;
use crate::{BotId, ChannelType, Envelope, EnvelopeTarget, MessagePart};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {
    to: String,
    subject: String,
    body: String,
}

pub struct EmailSendTool {
    channels: Arc<ChannelManager>,
}

impl EmailSendTool {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for EmailSendTool {
    fn name(&self) -> &str {
        "email_send"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Send an email to an arbitrary address from this bot's configured mailbox.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(Args)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: Args = serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;

        let envelope = Envelope {
            target: EnvelopeTarget {
                conversation_id: args.to.clone(),
                thread_id: None,
                reply_to: None,
            },
            blocks: vec![MessagePart::Text { text: format!("{}\n\n{}", args.subject, args.body) }],
            reaction: None,
        };

        self.channels.send(bot_id, ChannelType::Email, &envelope).await?;
        Ok(serde_json::json!({"sent": true, "to": args.to}))
    }
}
