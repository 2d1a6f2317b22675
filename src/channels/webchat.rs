//! Local-web channel adapter: a small `axum` server exposing a plain
//! HTTP+SSE chat surface, plus the webhook mount Lark's event callbacks
//! land on (`crate::channels::lark::parse_webhook_event`).

use super::lark;
use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::{Result, RuntimeTransient, ValidationError};
use crate::{ChannelType, Envelope, InboundEvent, MessagePart, Role};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt as _};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};

#[derive(serde::Deserialize)]
struct SendText {
    text: String,
    sender_subject: Option<String>,
}

struct Shared {
    self_identity: String,
    inbound_tx: mpsc::Sender<InboundEvent>,
    conversations: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
}

pub struct WebchatAdapter {
    bind_addr: String,
    self_identity: String,
    conversations: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
    connected: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl WebchatAdapter {
    pub fn new(self_identity: String, credentials: &serde_json::Value) -> Result<Self> {
        let bind_addr = credentials
            .get("bind_addr")
            .and_then(|v| v.as_str())
            .unwrap_or("127.0.0.1:8088")
            .to_string();
        Ok(Self {
            bind_addr,
            self_identity,
            conversations: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
        })
    }
}

async fn post_message(
    State(shared): State<Arc<Shared>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendText>,
) -> impl IntoResponse {
    let event = InboundEvent {
        channel_type: ChannelType::LocalWeb,
        external_conversation_id: conversation_id,
        thread_id: None,
        sender_subject: body.sender_subject.unwrap_or_else(|| "webchat-guest".to_string()),
        sender_display_name: None,
        self_subject: shared.self_identity.clone(),
        role: Role::User,
        parts: vec![MessagePart::Text { text: body.text }],
        reply_to_external_id: None,
        external_message_id: None,
        reaction: None,
    };

    if shared.inbound_tx.send(event).await.is_err() {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE;
    }
    axum::http::StatusCode::ACCEPTED
}

async fn sse_events(
    State(shared): State<Arc<Shared>>,
    Path(conversation_id): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = {
        let mut conversations = shared.conversations.write().await;
        conversations
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    };

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(envelope) => serde_json::to_string(&envelope).ok().map(|json| Ok(Event::default().data(json))),
            Err(_) => None,
        }
    });

    Sse::new(stream)
}

async fn lark_webhook(State(shared): State<Arc<Shared>>, Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    if let Some(challenge) = payload.get("challenge").and_then(|v| v.as_str()) {
        return Json(serde_json::json!({"challenge": challenge})).into_response();
    }

    if let Some(event) = lark::parse_webhook_event(&shared.self_identity, &payload) {
        let _ = shared.inbound_tx.send(event).await;
    }
    axum::http::StatusCode::OK.into_response()
}

#[async_trait::async_trait]
impl ChannelAdapter for WebchatAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::LocalWeb
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let shared = Arc::new(Shared {
            self_identity: self.self_identity.clone(),
            inbound_tx: tx,
            conversations: self.conversations.clone(),
        });

        let app = Router::new()
            .route("/webchat/{conversation_id}/messages", post(post_message))
            .route("/webchat/{conversation_id}/events", get(sse_events))
            .route("/webchat/lark/webhook", post(lark_webhook))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| RuntimeTransient::Io(Arc::new(e)))?;

        self.connected.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.notified().await })
            .await;

        self.connected.store(false, Ordering::SeqCst);
        result.map_err(|e| RuntimeTransient::ChannelThrottled(e.to_string()).into())
    }

    async fn stop(&self) -> Result<()> {
        self.stop.notify_one();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let conversations = self.conversations.read().await;
        let Some(sender) = conversations.get(&envelope.target.conversation_id) else {
            return Ok(());
        };
        let _ = sender.send(envelope.clone());
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
    fn defaults_bind_addr_when_unset() {
        let adapter = WebchatAdapter::new("bot1".into(), &serde_json::json!({})).unwrap();
        assert_eq!(adapter.bind_addr, "127.0.0.1:8088");
    }
}
