//! Discord channel adapter using `serenity`.

use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::{Result, RuntimeTransient, ValidationError};
use crate::{ChannelType, Envelope, InboundEvent, MessagePart, Role};
use serenity::all::{ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Http, Message, Ready, ShardManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub struct DiscordAdapter {
    token: String,
    self_identity: String,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
    connected: Arc<AtomicBool>,
}

impl DiscordAdapter {
    pub fn new(self_identity: String, credentials: &serde_json::Value) -> Result<Self> {
        let token = credentials
            .get("bot_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("credentials.bot_token".into()))?
            .to_string();
        Ok(Self {
            token,
            self_identity,
            http: Arc::new(RwLock::new(None)),
            shard_manager: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct Handler {
    tx: mpsc::Sender<InboundEvent>,
    self_identity: String,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot = %ready.user.name, "discord gateway ready");
        *self.http_slot.write().await = Some(ctx.http.clone());
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let reply_to_external_id = msg.referenced_message.as_ref().map(|m| m.id.get().to_string());
        let event = InboundEvent {
            channel_type: ChannelType::Discord,
            external_conversation_id: msg.channel_id.get().to_string(),
            thread_id: None,
            sender_subject: msg.author.id.get().to_string(),
            sender_display_name: Some(msg.author.name.clone()),
            self_subject: self.self_identity.clone(),
            role: Role::User,
            parts: vec![MessagePart::Text { text: msg.content.clone() }],
            reply_to_external_id,
            external_message_id: Some(msg.id.get().to_string()),
            reaction: None,
        };

        if self.tx.send(event).await.is_err() {
            tracing::warn!("discord inbound channel closed, shutting down shard");
            ctx.shard.shutdown_clean();
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Discord
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let handler = Handler {
            tx,
            self_identity: self.self_identity.clone(),
            http_slot: self.http.clone(),
            connected: self.connected.clone(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| RuntimeTransient::ChannelThrottled(format!("failed to build discord client: {e}")))?;

        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        let result = client.start().await;
        self.connected.store(false, Ordering::SeqCst);
        result.map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()).into())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(shard_manager) = self.shard_manager.read().await.as_ref() {
            shard_manager.shutdown_all().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let http = self.http.read().await.clone().ok_or_else(|| {
            RuntimeTransient::ChannelThrottled("discord adapter not connected".into())
        })?;

        let channel_id = ChannelId::new(
            envelope
                .target
                .conversation_id
                .parse()
                .map_err(|_| ValidationError::MalformedEvent("invalid discord channel id".into()))?,
        );

        for part in &envelope.blocks {
            let MessagePart::Text { text } = part else { continue };
            channel_id
                .send_message(&http, CreateMessage::new().content(text))
                .await
                .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;
        }
        Ok(())
    }

    async fn health(&self) -> Result<HealthStatus> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Down)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_rejected() {
        let err = DiscordAdapter::new("bot1".into(), &serde_json::json!({}));
        assert!(err.is_err());
    }
}
