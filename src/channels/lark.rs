//! Lark (Feishu) channel adapter. Inbound events arrive over Lark's event
//! callback webhook; outbound replies go through the Open API's message-send
//! endpoint. Kept thinner than the Telegram/Discord adapters — the vendor's
//! own SDK surface (`open_lark`) is still young, so this talks to the REST
//! API directly the way the other adapters' `reqwest`-based outbound paths
//! already do.

use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::{Result, RuntimeTransient, ValidationError};
use crate::{ChannelType, Envelope, InboundEvent, MessagePart, Role};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

const TOKEN_URL: &str = "https://open.feishu.cn/open-apis/auth/v3/tenant_access_token/internal";
const SEND_URL: &str = "https://open.feishu.cn/open-apis/im/v1/messages?receive_id_type=chat_id";

pub struct LarkAdapter {
    app_id: String,
    app_secret: String,
    self_identity: String,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
    connected: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl LarkAdapter {
    pub fn new(self_identity: String, credentials: &serde_json::Value) -> Result<Self> {
        let app_id = credentials
            .get("app_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("credentials.app_id".into()))?
            .to_string();
        let app_secret = credentials
            .get("app_secret")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("credentials.app_secret".into()))?
            .to_string();
        Ok(Self {
            app_id,
            app_secret,
            self_identity,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
        })
    }

    async fn tenant_access_token(&self) -> Result<String> {
        if let Some(token) = self.token.lock().await.clone() {
            return Ok(token);
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            code: i32,
            msg: String,
            tenant_access_token: Option<String>,
        }

        let resp: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .json(&serde_json::json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?
            .json()
            .await
            .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

        if resp.code != 0 {
            return Err(RuntimeTransient::ChannelThrottled(format!("lark token request failed: {}", resp.msg)).into());
        }
        let token = resp
            .tenant_access_token
            .ok_or_else(|| RuntimeTransient::ChannelThrottled("lark token response missing token".into()))?;
        *self.token.lock().await = Some(token.clone());
        Ok(token)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for LarkAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Lark
    }

    /// Lark event callbacks are delivered to this process over an HTTP
    /// webhook owned by the local-web surface, not by this task — the
    /// adapter just waits here until `stop` is called, mirroring a
    /// long-lived vendor connection.
    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.stop.notified().await;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let token = self.tenant_access_token().await?;

        for part in &envelope.blocks {
            let MessagePart::Text { text } = part else { continue };
            let body = serde_json::json!({
                "receive_id": envelope.target.conversation_id,
                "msg_type": "text",
                "content": serde_json::to_string(&serde_json::json!({"text": text})).unwrap_or_default(),
            });

            let resp = self
                .http
                .post(SEND_URL)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(RuntimeTransient::ChannelThrottled(format!(
                    "lark send failed with status {}",
                    resp.status()
                ))
                .into());
            }
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

/// Normalizes one Lark event-callback payload into an `InboundEvent`. Called
/// by the webhook handler in `crate::channels::webchat`'s router once the
/// callback's signature has been verified.
pub fn parse_webhook_event(self_identity: &str, payload: &serde_json::Value) -> Option<InboundEvent> {
    let event = payload.get("event")?;
    let message = event.get("message")?;
    let chat_id = message.get("chat_id")?.as_str()?.to_string();
    let message_id = message.get("message_id").and_then(|v| v.as_str()).map(str::to_string);
    let content_raw = message.get("content")?.as_str()?;
    let content: serde_json::Value = serde_json::from_str(content_raw).ok()?;
    let text = content.get("text")?.as_str()?.to_string();

    let sender = event.get("sender")?.get("sender_id")?;
    let sender_subject = sender.get("open_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    Some(InboundEvent {
        channel_type: ChannelType::Lark,
        external_conversation_id: chat_id,
        thread_id: None,
        sender_subject,
        sender_display_name: None,
        self_subject: self_identity.to_string(),
        role: Role::User,
        parts: vec![MessagePart::Text { text }],
        reply_to_external_id: None,
        external_message_id: message_id,
        reaction: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_app_id_is_rejected() {
        let err = LarkAdapter::new("bot1".into(), &serde_json::json!({"app_secret": "s"}));
        assert!(err.is_err());
    }

    #[test]
    fn parses_text_webhook_event() {
        let payload = serde_json::json!({
            "event": {
                "sender": {"sender_id": {"open_id": "ou_123"}},
                "message": {
                    "chat_id": "oc_abc",
                    "message_id": "om_1",
                    "content": "{\"text\":\"hello\"}",
                }
            }
        });
        let event = parse_webhook_event("bot1", &payload).expect("should parse");
        assert_eq!(event.external_conversation_id, "oc_abc");
        assert_eq!(event.sender_subject, "ou_123");
    }
}
