//! Conversation Resolver (`spec.md` §4.2): the per-run agent loop. Assembles
//! context, drives a streaming chat completion interleaved with tool calls,
//! parses any trailing `<attachments>` block out of the visible reply, and
//! persists the result. Concurrent runs against the same route are
//! serialized; a caller-initiated cancellation gets a short drain window
//! before the partial reply is persisted with `aborted = true`.

use crate::bots::{Bot, BotStore};
use crate::chat_provider::{ChatChunk, ChatMessage, ChatRequest, ReasoningEffort};
use crate::error::{Result, RuntimeTransient};
use crate::inbox::InboxStore;
use crate::media::MediaStore;
use crate::memory::types::Scope;
use crate::messages::{AssetRef, HistoryMessage, MessageStore};
use crate::routes::{BotChannelRoute, RouteStore};
use crate::{AgentAction, AgentEnd, BotId, Deps, Envelope, EnvelopeTarget, MessagePart, Role, RouteId, Usage};
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-route serialization locks. A route is one logical conversation
/// thread, so keying on `RouteId` alone gives the §4.2 "concurrent runs for
/// the same (bot, thread) are serialized" guarantee.
static RUN_LOCKS: LazyLock<StdMutex<HashMap<RouteId, Arc<AsyncMutex<()>>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

/// Cancellation handles for in-flight runs, keyed by route.
static CANCEL_TOKENS: LazyLock<StdMutex<HashMap<RouteId, CancellationToken>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

fn route_lock(route_id: RouteId) -> Arc<AsyncMutex<()>> {
    RUN_LOCKS
        .lock()
        .unwrap()
        .entry(route_id)
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

/// Requests cancellation of whatever run currently holds `route_id`, if any.
/// Returns `false` when no run is in flight for that route.
pub fn cancel(route_id: RouteId) -> bool {
    match CANCEL_TOKENS.lock().unwrap().get(&route_id) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    }
}

pub struct Resolver {
    deps: Arc<Deps>,
    bots: BotStore,
    routes: Arc<RouteStore>,
    messages: Arc<MessageStore>,
    inbox: InboxStore,
    media: Arc<MediaStore>,
    http: reqwest::Client,
}

impl Resolver {
    pub fn new(deps: Arc<Deps>, media: Arc<MediaStore>) -> Self {
        Self {
            bots: BotStore::new(deps.pool.clone()),
            routes: Arc::new(RouteStore::new(deps.pool.clone())),
            messages: Arc::new(MessageStore::new(deps.pool.clone())),
            inbox: InboxStore::new(deps.pool.clone()),
            media,
            http: reqwest::Client::new(),
            deps,
        }
    }

    /// Runs one resolver pass for `trigger_message_id`, the `HistoryMessage`
    /// that woke this route up. Serializes against any other run on the same
    /// route and registers a cancellation token for the duration.
    pub async fn run(&self, bot_id: BotId, route_id: RouteId, trigger_message_id: Uuid) -> Result<()> {
        let lock = route_lock(route_id);
        let _serialize = lock.lock().await;

        let cancel_token = CancellationToken::new();
        CANCEL_TOKENS.lock().unwrap().insert(route_id, cancel_token.clone());

        let outcome = self.run_locked(bot_id, route_id, trigger_message_id, &cancel_token).await;

        CANCEL_TOKENS.lock().unwrap().remove(&route_id);
        outcome
    }

    async fn run_locked(
        &self,
        bot_id: BotId,
        route_id: RouteId,
        trigger_message_id: Uuid,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        let bot = self.bots.get(bot_id).await?;
        let route = self.routes.get(route_id).await?;
        let runtime = self.deps.config.current();
        let limits = self.deps.limits;

        let history = self
            .messages
            .recent_history(
                bot_id,
                chrono::Duration::minutes(runtime.max_context_load_minutes),
                runtime.max_context_tokens,
            )
            .await?;

        let inbox_items = self.inbox.unconsumed(bot_id, runtime.max_inbox_items).await?;

        let available_channels: Vec<crate::ChannelType> = self
            .bots
            .list_enabled_channel_configs()
            .await?
            .into_iter()
            .filter(|c| c.bot_id == bot_id)
            .map(|c| c.channel_type)
            .collect();

        let system_prompt = crate::prompts::render_system_prompt(
            &runtime,
            &available_channels,
            route.channel_type,
            chrono::Utc::now(),
            &inbox_items,
        )?;

        let tools = self.deps.mcp.list().await;
        let reasoning_effort = reasoning_effort_for(&bot);

        let mut chat_messages: Vec<ChatMessage> = history.iter().map(history_to_chat_message).collect();

        let trigger_text = history
            .iter()
            .rev()
            .find(|m| m.id == trigger_message_id)
            .map(first_text_of)
            .unwrap_or_default();

        self.deps.events.publish_action(bot_id, route_id, AgentAction::Start);

        let mut hops = 0usize;
        let mut reasoning_text = String::new();
        let mut visible_text = String::new();
        let mut usage = Usage::default();
        let mut run_error: Option<String> = None;
        let mut aborted = false;

        'outer: loop {
            let request = ChatRequest {
                model: bot.models.chat_model.clone(),
                system_prompt: system_prompt.clone(),
                messages: chat_messages.clone(),
                tools: tools.clone(),
                reasoning_effort,
            };

            let stream = match self
                .call_with_retry(request, Duration::from_secs(limits.llm_call_timeout_secs))
                .await
            {
                Ok(s) => s,
                Err(e) if e.is_transient() => {
                    run_error = Some(e.to_string());
                    break 'outer;
                }
                Err(e) => return Err(e),
            };
            tokio::pin!(stream);

            let mut hop_text = String::new();
            let mut tool_called = false;

            'chunks: loop {
                let next = if cancel_token.is_cancelled() {
                    match tokio::time::timeout(
                        Duration::from_secs(limits.cancellation_drain_budget_secs),
                        stream.next(),
                    )
                    .await
                    {
                        Ok(n) => n,
                        Err(_) => {
                            aborted = true;
                            break 'chunks;
                        }
                    }
                } else {
                    tokio::select! {
                        _ = cancel_token.cancelled() => continue 'chunks,
                        n = stream.next() => n,
                    }
                };

                match next {
                    None => break 'chunks,
                    Some(Ok(ChatChunk::ReasoningDelta(text))) => {
                        if reasoning_text.is_empty() {
                            self.deps.events.publish_action(bot_id, route_id, AgentAction::ReasoningStart);
                        }
                        self.deps.events.publish_action(
                            bot_id,
                            route_id,
                            AgentAction::ReasoningDelta { text: text.clone() },
                        );
                        reasoning_text.push_str(&text);
                    }
                    Some(Ok(ChatChunk::TextDelta(text))) => {
                        if hop_text.is_empty() {
                            self.deps.events.publish_action(bot_id, route_id, AgentAction::TextStart);
                        }
                        self.deps.events.publish_action(bot_id, route_id, AgentAction::TextDelta { text: text.clone() });
                        hop_text.push_str(&text);
                    }
                    Some(Ok(ChatChunk::ToolCallPartial { .. })) => {}
                    Some(Ok(ChatChunk::ToolCallComplete { id, name, input })) => {
                        tool_called = true;
                        hops += 1;
                        if hops > limits.max_tool_hops {
                            run_error = Some(format!("exceeded the maximum of {} tool calls in one run", limits.max_tool_hops));
                            break 'outer;
                        }

                        self.deps.events.publish_action(
                            bot_id,
                            route_id,
                            AgentAction::ToolCallStart { id: id.clone(), name: name.clone() },
                        );

                        // §7: a failing or slow tool call is captured as the
                        // tool's own result text, never aborts the run.
                        let result_text = match tokio::time::timeout(
                            Duration::from_secs(limits.tool_call_timeout_secs),
                            self.deps.mcp.invoke(bot_id, &name, input),
                        )
                        .await
                        {
                            Ok(Ok(value)) => value.to_string(),
                            Ok(Err(e)) => format!("error: {e}"),
                            Err(_) => format!("error: tool {name} timed out after {}s", limits.tool_call_timeout_secs),
                        };

                        self.deps.events.publish_action(
                            bot_id,
                            route_id,
                            AgentAction::ToolCallEnd { id, result: result_text.clone() },
                        );

                        if !hop_text.is_empty() {
                            chat_messages.push(ChatMessage { role: Role::Assistant, text: hop_text.clone() });
                        }
                        chat_messages.push(ChatMessage { role: Role::Tool, text: format!("[{name}] {result_text}") });
                    }
                    Some(Ok(ChatChunk::End { usage: u })) => {
                        usage.input_tokens += u.input_tokens;
                        usage.output_tokens += u.output_tokens;
                        break 'chunks;
                    }
                    Some(Err(e)) if e.is_transient() => {
                        run_error = Some(e.to_string());
                        break 'outer;
                    }
                    Some(Err(e)) => return Err(e),
                }
            }

            if !hop_text.is_empty() {
                self.deps.events.publish_action(bot_id, route_id, AgentAction::TextEnd);
            }
            if !reasoning_text.is_empty() {
                self.deps.events.publish_action(bot_id, route_id, AgentAction::ReasoningEnd);
            }

            if aborted {
                visible_text = hop_text;
                break 'outer;
            }

            if tool_called {
                continue 'outer;
            }

            visible_text = hop_text;
            break 'outer;
        }

        if aborted {
            return self.persist_aborted(bot_id, route_id, trigger_message_id, &visible_text, reasoning_text, usage).await;
        }

        if let Some(error) = run_error {
            return self.persist_failure(bot_id, &route, trigger_message_id, reasoning_text, usage, error).await;
        }

        let (stripped_text, attachment_paths) = split_attachment_block(&visible_text);
        let assets = self.ingest_reply_attachments(bot_id, route_id, &attachment_paths).await?;

        let assistant_message = self
            .messages
            .append(
                bot_id,
                Some(route_id),
                Role::Assistant,
                vec![MessagePart::Text { text: stripped_text.clone() }],
                None,
                Some(trigger_message_id),
            )
            .await?;

        if !assets.is_empty() {
            self.messages.link_assets(assistant_message.id, &assets).await?;
        }

        self.deps.events.publish_message_created(bot_id, Some(route_id), assistant_message.id);
        self.deps.events.publish_action(
            bot_id,
            route_id,
            AgentAction::End(Box::new(AgentEnd {
                aborted: false,
                skills_used: runtime.skills.keys().cloned().collect(),
                reasoning: non_empty(reasoning_text),
                usage,
                error: None,
            })),
        );

        self.send_reply(bot_id, &route, &stripped_text).await;
        self.spawn_memory_add(bot_id, trigger_text, stripped_text);

        Ok(())
    }

    /// Establishes the chat stream, retrying up to three times with
    /// exponential backoff on a `RuntimeTransient` error or a call timeout
    /// (§7: "retried with jitter; surfaced after 3 failed attempts").
    async fn call_with_retry(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<futures::stream::BoxStream<'static, Result<ChatChunk>>> {
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(timeout, self.deps.chat_provider.stream(request.clone())).await {
                Ok(result) => {
                    match result {
                        Ok(stream) => return Ok(stream),
                        Err(e) if e.is_transient() && attempt < 3 => {
                            attempt += 1;
                            tokio::time::sleep(backoff(attempt)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(_) if attempt < 3 => {
                    attempt += 1;
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(_) => {
                    return Err(RuntimeTransient::Timeout("chat provider call timed out".into()).into());
                }
            }
        }
    }

    async fn persist_aborted(
        &self,
        bot_id: BotId,
        route_id: RouteId,
        trigger_message_id: Uuid,
        partial_text: &str,
        reasoning_text: String,
        usage: Usage,
    ) -> Result<()> {
        let message = self
            .messages
            .append(
                bot_id,
                Some(route_id),
                Role::Assistant,
                vec![MessagePart::Text { text: partial_text.to_string() }],
                None,
                Some(trigger_message_id),
            )
            .await?;
        self.messages.mark_aborted(message.id).await?;
        self.deps.events.publish_message_created(bot_id, Some(route_id), message.id);
        self.deps.events.publish_action(
            bot_id,
            route_id,
            AgentAction::End(Box::new(AgentEnd {
                aborted: true,
                skills_used: Vec::new(),
                reasoning: non_empty(reasoning_text),
                usage,
                error: None,
            })),
        );
        Ok(())
    }

    async fn persist_failure(
        &self,
        bot_id: BotId,
        route: &BotChannelRoute,
        trigger_message_id: Uuid,
        reasoning_text: String,
        usage: Usage,
        error: String,
    ) -> Result<()> {
        tracing::warn!(bot_id = %bot_id, route_id = %route.id, error = %error, "resolver run failed after retries, apologizing");

        let apology = "Sorry, I ran into a problem and couldn't finish that reply. Please try again in a moment.";
        let message = self
            .messages
            .append(
                bot_id,
                Some(route.id),
                Role::Assistant,
                vec![MessagePart::Text { text: apology.to_string() }],
                None,
                Some(trigger_message_id),
            )
            .await?;
        self.deps.events.publish_message_created(bot_id, Some(route.id), message.id);
        self.deps.events.publish_action(
            bot_id,
            route.id,
            AgentAction::End(Box::new(AgentEnd {
                aborted: false,
                skills_used: Vec::new(),
                reasoning: non_empty(reasoning_text),
                usage,
                error: Some(error),
            })),
        );
        self.send_reply(bot_id, route, apology).await;
        Ok(())
    }

    async fn send_reply(&self, bot_id: BotId, route: &BotChannelRoute, text: &str) {
        let reply_to = route
            .default_reply_target
            .get("reply_to")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let envelope = Envelope {
            target: EnvelopeTarget {
                conversation_id: route.external_conversation_id.clone(),
                thread_id: route.external_thread_id.clone(),
                reply_to,
            },
            blocks: vec![MessagePart::Text { text: text.to_string() }],
            reaction: None,
        };

        if let Err(e) = self.deps.channels.send(bot_id, route.channel_type, &envelope).await {
            tracing::warn!(bot_id = %bot_id, route_id = %route.id, error = %e, "failed to deliver resolver reply");
        }
    }

    fn spawn_memory_add(&self, bot_id: BotId, user_text: String, assistant_text: String) {
        let memory = self.deps.memory.clone();
        tokio::spawn(async move {
            let messages = vec![
                ChatMessage { role: Role::User, text: user_text },
                ChatMessage { role: Role::Assistant, text: assistant_text },
            ];
            if let Err(e) = memory.add(bot_id, &messages, Scope::for_bot(bot_id), true).await {
                tracing::warn!(bot_id = %bot_id, error = %e, "post-run memory add failed");
            }
        });
    }

    /// §6 attachment block grammar: each referenced path is ingested into the
    /// Media Store, local paths resolved against the bot's container
    /// workspace and `https?://` paths fetched directly.
    async fn ingest_reply_attachments(&self, bot_id: BotId, route_id: RouteId, paths: &[String]) -> Result<Vec<AssetRef>> {
        let mut assets = Vec::with_capacity(paths.len());
        for (ordinal, path) in paths.iter().enumerate() {
            let bytes = if path.starts_with("http://") || path.starts_with("https://") {
                let resp = self
                    .http
                    .get(path)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("attachment fetch failed: {e}"))?;
                resp.bytes()
                    .await
                    .map_err(|e| anyhow::anyhow!("attachment read failed: {e}"))?
                    .to_vec()
            } else {
                let full = self.deps.container.workspace_dir(&bot_id).join(path.trim_start_matches('/'));
                tokio::fs::read(&full).await?
            };

            let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();
            let asset = self.media.ingest(bot_id, &bytes, &mime, None, None).await?;
            self.deps.events.publish_action(bot_id, route_id, AgentAction::AttachmentDelta { path: path.clone() });
            assets.push(AssetRef { asset_id: asset.id, role: "outbound".into(), ordinal: ordinal as i64 });
        }
        Ok(assets)
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_millis(250 * 2u64.pow(exp))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Whether `bot` should be asked for reasoning output: gated both on the
/// bot's own toggle and a coarse per-model capability heuristic, since not
/// every configured chat model exposes a reasoning channel.
fn reasoning_effort_for(bot: &Bot) -> Option<ReasoningEffort> {
    if !bot.reasoning_enabled {
        return None;
    }
    let model = bot.models.chat_model.to_lowercase();
    let supports_reasoning =
        model.contains("opus") || model.contains("sonnet-4") || model.contains("o1") || model.contains("o3") || model.contains("gpt-5");
    supports_reasoning.then_some(ReasoningEffort::Medium)
}

fn history_to_chat_message(msg: &HistoryMessage) -> ChatMessage {
    ChatMessage { role: msg.role, text: render_parts(&msg.parts) }
}

fn first_text_of(msg: &HistoryMessage) -> String {
    msg.parts
        .iter()
        .find_map(|p| match p {
            MessagePart::Text { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn render_parts(parts: &[MessagePart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            MessagePart::Text { text } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
            MessagePart::Attachment(a) => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[attachment: {}]", a.mime));
            }
        }
    }
    out
}

/// §6: "One path per line, hyphen-space prefix, no other content between the
/// tags." Strips the block (if present) from the visible text and returns
/// the referenced paths in order.
fn split_attachment_block(text: &str) -> (String, Vec<String>) {
    static BLOCK: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<attachments>\n((?:- .+\n)*)</attachments>\n?").unwrap());

    let Some(caps) = BLOCK.captures(text) else {
        return (text.to_string(), Vec::new());
    };

    let whole = caps.get(0).unwrap();
    let paths: Vec<String> = caps[1]
        .lines()
        .filter_map(|line| line.strip_prefix("- ").map(|p| p.trim().to_string()))
        .filter(|p| !p.is_empty())
        .collect();

    let stripped = format!("{}{}", &text[..whole.start()], &text[whole.end()..]);
    (stripped.trim().to_string(), paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_attachment_block_extracts_paths_and_strips_text() {
        let text = "Here you go.\n\n<attachments>\n- /data/out.png\n- https://example.com/a.pdf\n</attachments>\n";
        let (stripped, paths) = split_attachment_block(text);
        assert_eq!(stripped, "Here you go.");
        assert_eq!(paths, vec!["/data/out.png", "https://example.com/a.pdf"]);
    }

    #[test]
    fn split_attachment_block_is_noop_without_a_block() {
        let (stripped, paths) = split_attachment_block("just text");
        assert_eq!(stripped, "just text");
        assert!(paths.is_empty());
    }

    #[test]
    fn reasoning_effort_requires_both_toggle_and_model_support() {
        let mut bot = test_bot("anthropic/claude-sonnet-4-20250514");
        bot.reasoning_enabled = true;
        assert!(reasoning_effort_for(&bot).is_some());

        bot.reasoning_enabled = false;
        assert!(reasoning_effort_for(&bot).is_none());

        bot.reasoning_enabled = true;
        bot.models.chat_model = "openrouter/mistral-large".into();
        assert!(reasoning_effort_for(&bot).is_none());
    }

    fn test_bot(chat_model: &str) -> Bot {
        Bot {
            id: BotId::new(),
            owner_id: crate::UserId::new(),
            name: "test".into(),
            kind: crate::bots::BotKind::Personal,
            status: crate::bots::BotStatus::Ready,
            allow_guest: false,
            models: crate::bots::ModelRefs {
                chat_model: chat_model.into(),
                memory_model: "anthropic/claude-haiku-4.5".into(),
                embedding_model: "fastembed/bge-small-en-v1.5".into(),
            },
            search_provider: None,
            reasoning_enabled: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }
}
