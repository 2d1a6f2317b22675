//! meshbot: a multi-tenant AI agent runtime.
//!
//! Hosts any number of long-lived bots, each owning an isolated execution
//! container, a structured long-term memory, one or more messaging channel
//! bindings, and a cron scheduler for self-invocation. Inbound messages from
//! channels are routed through a per-bot conversational pipeline that calls
//! an LLM with tool-use, persists history, extracts memories, and delivers
//! replies back through the originating channel or any other bound channel.

pub mod error;
pub mod config;
pub mod db;
pub mod telemetry;

pub mod identity;
pub mod bots;
pub mod routes;
pub mod messages;
pub mod media;
pub mod memory;
pub mod mcp;
pub mod tools;
pub mod channels;
pub mod inbound;
pub mod resolver;
pub mod scheduler;
pub mod inbox;
pub mod events;
pub mod container;
pub mod chat_provider;
pub mod prompts;
pub mod settings;

pub use error::{Error, Result};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Newtype over a UUID for a [`bots::Bot`] id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId(pub uuid::Uuid);

impl BotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BotId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// Newtype over a UUID for a [`routes::BotChannelRoute`] id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub uuid::Uuid);

impl RouteId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RouteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype over a UUID for a [`identity::ChannelIdentity`]'s linked User.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which messaging channel an event/route/config belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Telegram,
    Discord,
    Lark,
    Email,
    LocalWeb,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelType::Telegram => "telegram",
            ChannelType::Discord => "discord",
            ChannelType::Lark => "lark",
            ChannelType::Email => "email",
            ChannelType::LocalWeb => "local_web",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChannelType {
    type Err = crate::error::ValidationError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "telegram" => ChannelType::Telegram,
            "discord" => ChannelType::Discord,
            "lark" => ChannelType::Lark,
            "email" => ChannelType::Email,
            "local_web" => ChannelType::LocalWeb,
            other => {
                return Err(crate::error::ValidationError::MalformedEvent(format!(
                    "unknown channel type: {other}"
                )));
            }
        })
    }
}

/// Role of a message in the conversation history, mirroring `rig`'s message
/// roles plus the `schedule` role used by synthetic scheduler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Schedule,
}

/// One part of an inbound or outbound message payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MessagePart {
    Text { text: String },
    Attachment(AttachmentPart),
}

/// An inbound attachment reference: either inline bytes or a fetchable URL.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentPart {
    pub mime: String,
    pub name: Option<String>,
    #[serde(flatten)]
    pub source: AttachmentSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "source_kind")]
pub enum AttachmentSource {
    Url { url: String },
    Bytes { bytes_b64: String },
}

/// A normalized inbound event from any channel adapter — §6 channel adapter
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_type: ChannelType,
    pub external_conversation_id: String,
    pub thread_id: Option<String>,
    pub sender_subject: String,
    pub sender_display_name: Option<String>,
    pub self_subject: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub reply_to_external_id: Option<String>,
    pub external_message_id: Option<String>,
    pub reaction: Option<String>,
}

/// A normalized outbound payload handed to a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub target: EnvelopeTarget,
    pub blocks: Vec<MessagePart>,
    pub reaction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeTarget {
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A streamed action frame emitted by the conversation resolver — §9 design
/// note: `AgentAction = start|reasoning_*|text_*|tool_*|attachment_delta|end`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AgentAction {
    Start,
    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd,
    TextStart,
    TextDelta { text: String },
    TextEnd,
    ToolCallStart { id: String, name: String },
    ToolCallEnd { id: String, result: String },
    AttachmentDelta { path: String },
    Lag,
    End(Box<AgentEnd>),
}

/// Terminal frame of a resolver run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEnd {
    pub aborted: bool,
    pub skills_used: Vec<String>,
    pub reasoning: Option<String>,
    pub usage: Usage,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Shared, cheaply-clonable dependency bundle threaded through the inbound
/// processor, resolver, scheduler, and tools. Mirrors the teacher's
/// `AgentDeps` bundle shape.
#[derive(Clone)]
pub struct Deps {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<config::RuntimeConfig>,
    pub limits: config::RuntimeLimits,
    pub chat_provider: Arc<dyn chat_provider::ChatProvider>,
    pub memory: Arc<memory::MemoryEngine>,
    pub mcp: Arc<mcp::McpGateway>,
    pub channels: Arc<channels::ChannelManager>,
    pub container: Arc<dyn container::ContainerRuntime>,
    pub events: Arc<events::EventHub>,
}
