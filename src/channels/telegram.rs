//! Telegram channel adapter (long polling via `teloxide`).

use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::{Result, RuntimeTransient, ValidationError};
use crate::{ChannelType, Envelope, InboundEvent, MessagePart, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode, UpdateKind};
use tokio::sync::{mpsc, Notify, RwLock};

pub struct TelegramAdapter {
    bot: Bot,
    self_identity: String,
    connected: AtomicBool,
    stop: Arc<Notify>,
    last_offset: RwLock<i32>,
}

impl TelegramAdapter {
    pub fn new(self_identity: String, credentials: &serde_json::Value) -> Result<Self> {
        let token = credentials
            .get("bot_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("credentials.bot_token".into()))?;
        Ok(Self {
            bot: Bot::new(token),
            self_identity,
            connected: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
            last_offset: RwLock::new(0),
        })
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        loop {
            let offset = *self.last_offset.read().await;
            let poll = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(30)
                .send();

            let updates = tokio::select! {
                _ = self.stop.notified() => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                result = poll => result.map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?,
            };

            for update in &updates {
                *self.last_offset.write().await = update.id.0 as i32 + 1;
                let UpdateKind::Message(message) = &update.kind else { continue };
                let Some(text) = message.text() else { continue };

                let reply_to_external_id = message
                    .reply_to_message()
                    .map(|m| m.id.0.to_string());

                let event = InboundEvent {
                    channel_type: ChannelType::Telegram,
                    external_conversation_id: message.chat.id.0.to_string(),
                    thread_id: None,
                    sender_subject: message
                        .from
                        .as_ref()
                        .map(|u| u.id.0.to_string())
                        .unwrap_or_default(),
                    sender_display_name: message.from.as_ref().map(|u| u.full_name()),
                    self_subject: self.self_identity.clone(),
                    role: Role::User,
                    parts: vec![MessagePart::Text { text: text.to_string() }],
                    reply_to_external_id,
                    external_message_id: Some(message.id.0.to_string()),
                    reaction: None,
                };

                if tx.send(event).await.is_err() {
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let chat_id = ChatId(
            envelope
                .target
                .conversation_id
                .parse()
                .map_err(|_| ValidationError::MalformedEvent("invalid telegram chat id".into()))?,
        );

        for part in &envelope.blocks {
            let MessagePart::Text { text } = part else { continue };
            let mut request = self.bot.send_message(chat_id, text).parse_mode(ParseMode::Html);
            if let Some(reply_to) = &envelope.target.reply_to
                && let Ok(id) = reply_to.parse::<i32>()
            {
                request = request.reply_to(MessageId(id));
            }
            request
                .send()
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
        let err = TelegramAdapter::new("bot1".into(), &serde_json::json!({}));
        assert!(err.is_err());
    }
}
