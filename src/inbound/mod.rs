//! Inbound Processor (`spec.md` §4.1): turns a channel adapter's normalized
//! `InboundEvent` into at most one persisted `HistoryMessage` and a resolver
//! dispatch, or an `InboxItem` when the bot isn't active on the route.

use crate::bots::{AccessPolicy, BotStore};
use crate::error::{Result, ValidationError};
use crate::identity::IdentityStore;
use crate::inbox::InboxStore;
use crate::media::MediaStore;
use crate::messages::{AssetRef, MessageStore};
use crate::resolver::Resolver;
use crate::routes::RouteStore;
use crate::{
    AttachmentPart, AttachmentSource, BotId, ChannelType, Deps, Envelope, EnvelopeTarget,
    InboundEvent, MessagePart, Role,
};
use std::sync::Arc;

pub struct InboundProcessor {
    deps: Arc<Deps>,
    identity: IdentityStore,
    bots: BotStore,
    routes: Arc<RouteStore>,
    messages: Arc<MessageStore>,
    inbox: InboxStore,
    media: Arc<MediaStore>,
    resolver: Arc<Resolver>,
    http: reqwest::Client,
}

impl InboundProcessor {
    pub fn new(deps: Arc<Deps>, media: Arc<MediaStore>) -> Self {
        Self {
            identity: IdentityStore::new(deps.pool.clone()),
            bots: BotStore::new(deps.pool.clone()),
            routes: Arc::new(RouteStore::new(deps.pool.clone())),
            messages: Arc::new(MessageStore::new(deps.pool.clone())),
            inbox: InboxStore::new(deps.pool.clone()),
            resolver: Arc::new(Resolver::new(deps.clone(), media.clone())),
            media,
            http: reqwest::Client::new(),
            deps,
        }
    }

    /// Runs the full §4.1 algorithm for one inbound event. Authorization and
    /// self-channel failures are dropped silently (logged) per the contract;
    /// everything else propagates so the adapter can decide how to react.
    pub async fn handle(&self, event: InboundEvent) -> Result<()> {
        // 1. Identify self channel.
        let self_cfg = match self
            .bots
            .find_channel_config_by_self(event.channel_type, &event.self_subject)
            .await
        {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(self_subject = %event.self_subject, error = %e, "no bot owns this self-channel identity, dropping event");
                return Ok(());
            }
        };
        let bot_id = self_cfg.bot_id;

        // 2. Identify sender.
        let sender = self
            .identity
            .upsert_channel_identity(
                event.channel_type,
                &event.sender_subject,
                event.sender_display_name.as_deref(),
            )
            .await?;

        // 3. Authorize. Channel-level admission is wide open here; the
        // bot's own `allow_guest` flag (checked inside `authorize_access`)
        // is the real per-bot gate.
        let policy = AccessPolicy { allow_public_member: true, allow_guest: true };
        if let Err(e) = self.bots.authorize_access(sender.user_id, bot_id, policy).await {
            tracing::info!(bot_id = %bot_id, sender = %event.sender_subject, error = %e, "access denied, dropping event");
            return Ok(());
        }

        // 4. Resolve route.
        let default_reply_target = serde_json::json!({
            "conversation_id": event.external_conversation_id,
            "thread_id": event.thread_id,
            "reply_to": event.external_message_id,
        });
        let route = self
            .routes
            .upsert_route(
                bot_id,
                event.channel_type,
                &event.external_conversation_id,
                event.thread_id.as_deref(),
                default_reply_target,
            )
            .await?;

        // Edge case (a): a duplicate external_message_id is ignored outright,
        // before bind-code/attachment/activity work runs again for no reason.
        if let Some(ext_id) = &event.external_message_id
            && self.messages.find_by_external_id(bot_id, ext_id).await?.is_some()
        {
            tracing::debug!(bot_id = %bot_id, external_message_id = %ext_id, "duplicate inbound event, ignored");
            return Ok(());
        }

        let text = first_text(&event.parts).unwrap_or_default();

        // 5. Bind codes.
        if sender.is_guest()
            && let Some(code) = crate::identity::parse_bind_code(&text)
        {
            return self.handle_bind_code(&event, bot_id, sender.id, code).await;
        }

        // 6. Attachment ingest.
        let assets = match self.ingest_attachments(bot_id, &event.parts).await {
            Ok(assets) => assets,
            Err(e @ crate::Error::Validation(ValidationError::AttachmentTooLarge { .. })) => {
                self.reply_apology(&event, bot_id, event.channel_type).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // 7. Activity filter.
        let active = self.is_active(bot_id, &self_cfg.routing_rules, &self_cfg.self_identity, &event, &text).await?;

        if !active {
            let summary = if text.is_empty() { "(attachment)".to_string() } else { truncate(&text, 200) };
            self.inbox.push(bot_id, route.id, event.channel_type, &summary).await?;
            return Ok(());
        }

        let reply_to = match &event.reply_to_external_id {
            Some(ext_id) => self.messages.find_by_external_id(bot_id, ext_id).await?.map(|m| m.id),
            None => None,
        };

        let message = self
            .messages
            .append(
                bot_id,
                Some(route.id),
                Role::User,
                event.parts.clone(),
                event.external_message_id.as_deref(),
                reply_to,
            )
            .await?;

        if !assets.is_empty() {
            self.messages.link_assets(message.id, &assets).await?;
        }

        // Engaging a route clears any stale inbox notifications for it.
        self.inbox.consume_for_route(bot_id, route.id).await?;

        // 8. Resolver dispatch, asynchronous.
        let resolver = self.resolver.clone();
        let messages = self.messages.clone();
        let route_id = route.id;
        let trigger_id = message.id;
        tokio::spawn(async move {
            if let Err(e) = resolver.run(bot_id, route_id, trigger_id).await {
                tracing::error!(bot_id = %bot_id, route_id = %route_id, error = %e, "resolver run failed");
                let _ = messages
                    .append(
                        bot_id,
                        Some(route_id),
                        Role::Tool,
                        vec![MessagePart::Text { text: format!("resolver run failed: {e}") }],
                        None,
                        None,
                    )
                    .await;
            }
        });

        Ok(())
    }

    async fn handle_bind_code(
        &self,
        event: &InboundEvent,
        bot_id: BotId,
        channel_identity_id: uuid::Uuid,
        code: &str,
    ) -> Result<()> {
        match self.identity.consume_bind_code(code, channel_identity_id).await {
            Ok(_user_id) => {
                self.send_reply(event, bot_id, "You're linked. Welcome back!").await;
            }
            Err(e) => {
                tracing::info!(error = %e, "bind code rejected");
                self.send_reply(event, bot_id, "That code didn't work — it may be expired or already used.").await;
            }
        }
        Ok(())
    }

    async fn reply_apology(&self, event: &InboundEvent, bot_id: BotId, _channel_type: ChannelType) {
        self.send_reply(event, bot_id, "Sorry, one of your attachments was too large for me to accept.").await;
    }

    async fn send_reply(&self, event: &InboundEvent, bot_id: BotId, text: &str) {
        let envelope = Envelope {
            target: EnvelopeTarget {
                conversation_id: event.external_conversation_id.clone(),
                thread_id: event.thread_id.clone(),
                reply_to: event.external_message_id.clone(),
            },
            blocks: vec![MessagePart::Text { text: text.to_string() }],
            reaction: None,
        };
        if let Err(e) = self.deps.channels.send(bot_id, event.channel_type, &envelope).await {
            tracing::warn!(bot_id = %bot_id, error = %e, "failed to send reply");
        }
    }

    /// §4.1 step 6: pipes every attachment into the Media Store, rejecting
    /// the whole event (edge case c) if any single attachment exceeds the
    /// configured size limit.
    async fn ingest_attachments(&self, bot_id: BotId, parts: &[MessagePart]) -> Result<Vec<AssetRef>> {
        let limit = self.deps.limits.max_attachment_bytes;
        let mut assets = Vec::new();

        for (ordinal, part) in parts.iter().enumerate() {
            let MessagePart::Attachment(attachment) = part else { continue };
            let bytes = self.fetch_attachment_bytes(attachment).await?;
            if bytes.len() as u64 > limit {
                return Err(ValidationError::AttachmentTooLarge {
                    limit_bytes: limit,
                    actual_bytes: bytes.len() as u64,
                }
                .into());
            }

            let asset = self.media.ingest(bot_id, &bytes, &attachment.mime, None, None).await?;
            assets.push(AssetRef { asset_id: asset.id, role: "inbound".into(), ordinal: ordinal as i64 });
        }

        Ok(assets)
    }

    async fn fetch_attachment_bytes(&self, attachment: &AttachmentPart) -> Result<Vec<u8>> {
        use base64::Engine as _;
        match &attachment.source {
            AttachmentSource::Bytes { bytes_b64 } => base64::engine::general_purpose::STANDARD
                .decode(bytes_b64)
                .map_err(|e| ValidationError::MalformedEvent(format!("invalid base64 attachment: {e}")).into()),
            AttachmentSource::Url { url } => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("attachment fetch failed: {e}"))?;
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| anyhow::anyhow!("attachment read failed: {e}"))?;
                Ok(bytes.to_vec())
            }
        }
    }

    /// §4.1 step 7: a bot is active on a route when it's configured primary
    /// for that route, it was directly mentioned in the message text, or the
    /// message is a reply to a known assistant message (edge case b, which
    /// overrides mention state either way — a reply to the sender's own or
    /// anyone else's message does not count).
    async fn is_active(
        &self,
        bot_id: BotId,
        routing_rules: &serde_json::Value,
        self_identity: &str,
        event: &InboundEvent,
        text: &str,
    ) -> Result<bool> {
        if let Some(ext_id) = &event.reply_to_external_id
            && let Some(replied) = self.messages.find_by_external_id(bot_id, ext_id).await?
            && replied.role == Role::Assistant
        {
            return Ok(true);
        }

        if routing_rules.get("primary").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(true);
        }

        let mention = format!("@{self_identity}");
        Ok(text.to_lowercase().contains(&mention.to_lowercase()))
    }
}

fn first_text(parts: &[MessagePart]) -> Option<String> {
    parts.iter().find_map(|p| match p {
        MessagePart::Text { text } => Some(text.clone()),
        _ => None,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_text_finds_the_first_text_part() {
        let parts = vec![
            MessagePart::Attachment(AttachmentPart {
                source: AttachmentSource::Url { url: "https://example.com/a.png".into() },
                mime: "image/png".into(),
                name: None,
            }),
            MessagePart::Text { text: "hello".into() },
            MessagePart::Text { text: "world".into() },
        ];
        assert_eq!(first_text(&parts).as_deref(), Some("hello"));
    }

    #[test]
    fn first_text_empty_when_no_text_part() {
        let parts = vec![MessagePart::Attachment(AttachmentPart {
            source: AttachmentSource::Url { url: "https://example.com/a.png".into() },
            mime: "image/png".into(),
            name: None,
        })];
        assert_eq!(first_text(&parts), None);
    }

    #[test]
    fn truncate_leaves_short_strings_untouched() {
        assert_eq!(truncate("hi", 200), "hi");
    }

    #[test]
    fn truncate_adds_ellipsis_past_the_limit() {
        let long = "x".repeat(250);
        let truncated = truncate(&long, 200);
        assert_eq!(truncated.chars().count(), 201);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        let multibyte = "é".repeat(10);
        assert_eq!(truncate(&multibyte, 20), multibyte);
    }
}
