//! `ChatProvider` contract (`spec.md` §6): wraps whichever chat model a bot
//! is configured to use behind one streaming interface. Per-provider wire
//! formats are the external-collaborator surface the spec calls out, so this
//! treats `rig`'s `CompletionModel` as the adapter boundary and only
//! resolves a bearer API key from config/env rather than reproducing a full
//! OAuth-credential-refresh subsystem.

use crate::error::{Result, RuntimeTransient, ValidationError};
use futures::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: crate::Role,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// One chunk of a streamed completion, tagged per §4.2.
#[derive(Debug, Clone)]
pub enum ChatChunk {
    ReasoningDelta(String),
    TextDelta(String),
    ToolCallPartial { id: String, name: String },
    ToolCallComplete {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    End { usage: crate::Usage },
}

#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<ChatChunk>>>;
}

/// Which vendor a `model` string (`"<provider>/<model-id>"`) routes to.
fn split_provider(model: &str) -> Result<(&str, &str)> {
    model
        .split_once('/')
        .ok_or_else(|| ValidationError::MalformedEvent(format!("model ref missing provider prefix: {model}")).into())
}

/// Resolves a bearer API key for `provider` from config, falling back to
/// the provider's conventional environment variable.
pub fn resolve_api_key(provider: &str, cfg: &crate::config::LlmConfig) -> Result<String> {
    let key = match provider {
        "anthropic" => cfg.anthropic_key.clone().or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
        "openai" => cfg.openai_key.clone().or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        "openrouter" => cfg.openrouter_key.clone().or_else(|| std::env::var("OPENROUTER_API_KEY").ok()),
        other => {
            return Err(ValidationError::MalformedEvent(format!("unsupported chat provider: {other}")).into());
        }
    };
    key.ok_or_else(|| {
        ValidationError::MissingField(format!("no API key configured for chat provider {provider}")).into()
    })
}

/// `rig`-backed implementation. One instance per provider; `model` in
/// `ChatRequest` picks the specific model id within that provider.
pub struct RigChatProvider {
    provider: String,
    api_key: String,
    timeout: std::time::Duration,
}

impl RigChatProvider {
    pub fn new(provider: impl Into<String>, api_key: String, timeout: std::time::Duration) -> Self {
        Self { provider: provider.into(), api_key, timeout }
    }
}

#[async_trait::async_trait]
impl ChatProvider for RigChatProvider {
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        let (provider, model_id) = split_provider(&req.model)?;
        if provider != self.provider {
            return Err(ValidationError::MalformedEvent(format!(
                "chat request for provider {provider} routed to a {} provider instance",
                self.provider
            ))
            .into());
        }

        // The actual per-vendor wire format (Anthropic Messages API, OpenAI
        // Chat Completions, ...) is delegated to `rig_core`'s provider
        // clients; this crate's boundary is the `ChatProvider` trait above,
        // not the wire format itself (§1 Non-goals).
        let stream = tokio::time::timeout(self.timeout, build_rig_stream(&self.api_key, provider, model_id, &req))
            .await
            .map_err(|_| RuntimeTransient::ChatProvider("timed out starting completion stream".into()))?
            .map_err(|e| RuntimeTransient::ChatProvider(e.to_string()))?;
        Ok(stream)
    }
}

/// Builds the `rig_core` chat-history plus preamble for `req` and drives a
/// real completion stream against `provider`'s client, mapping each raw
/// streaming choice onto our own [`ChatChunk`] variants. Each provider's
/// `rig_core` completion model has a different concrete `StreamingResponse`
/// type, so the match arms are monomorphized separately rather than boxed
/// behind one generic call.
async fn build_rig_stream(
    api_key: &str,
    provider: &str,
    model_id: &str,
    req: &ChatRequest,
) -> std::result::Result<BoxStream<'static, Result<ChatChunk>>, anyhow::Error> {
    let messages = to_rig_messages(&req.messages);
    let tools = to_tool_definitions(&req.tools);

    match provider {
        "anthropic" => {
            let model = rig::providers::anthropic::Client::new(api_key).completion_model(model_id);
            let request = build_completion_request(&model, &req.system_prompt, messages, tools, req.reasoning_effort)?;
            Ok(stream_completion(model, request))
        }
        "openai" => {
            let model = rig::providers::openai::Client::new(api_key).completion_model(model_id);
            let request = build_completion_request(&model, &req.system_prompt, messages, tools, req.reasoning_effort)?;
            Ok(stream_completion(model, request))
        }
        "openrouter" => {
            let model = rig::providers::openrouter::Client::new(api_key).completion_model(model_id);
            let request = build_completion_request(&model, &req.system_prompt, messages, tools, req.reasoning_effort)?;
            Ok(stream_completion(model, request))
        }
        other => Err(anyhow::anyhow!("unsupported chat provider: {other}")),
    }
}

fn to_rig_messages(messages: &[ChatMessage]) -> Vec<rig::message::Message> {
    messages
        .iter()
        .map(|m| match m.role {
            crate::Role::Assistant => rig::message::Message::assistant(m.text.clone()),
            // `rig::message::Message` only has user/assistant variants; tool
            // results and scheduler triggers are folded in as user-turn
            // context the same way the resolver already renders them into
            // plain text before they ever reach this boundary.
            _ => rig::message::Message::user(m.text.clone()),
        })
        .collect()
}

fn to_tool_definitions(specs: &[ToolSpec]) -> Vec<rig::completion::ToolDefinition> {
    specs
        .iter()
        .map(|t| rig::completion::ToolDefinition {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect()
}

fn reasoning_effort_label(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "medium",
        ReasoningEffort::High => "high",
    }
}

/// Builds a `rig_core` `CompletionRequest` from our wire-agnostic
/// `ChatRequest`. The most recent message becomes the prompt turn, the rest
/// becomes chat history — the split rig's own builder expects.
fn build_completion_request<M: rig::completion::CompletionModel>(
    model: &M,
    preamble: &str,
    mut messages: Vec<rig::message::Message>,
    tools: Vec<rig::completion::ToolDefinition>,
    reasoning_effort: Option<ReasoningEffort>,
) -> std::result::Result<rig::completion::CompletionRequest, anyhow::Error> {
    let prompt = messages.pop().ok_or_else(|| anyhow::anyhow!("chat request has no messages to send"))?;

    let mut builder = model
        .completion_request(prompt)
        .preamble(preamble.to_string())
        .messages(messages)
        .tools(tools);

    if let Some(effort) = reasoning_effort {
        builder = builder.additional_params(serde_json::json!({ "reasoning_effort": reasoning_effort_label(effort) }));
    }

    Ok(builder.build())
}

/// Drives one `rig_core` streaming completion to completion, yielding a
/// `ChatChunk` per raw streaming choice. Tool calls arrive whole from every
/// provider rig wraps (no partial-argument deltas at this layer), so every
/// `ToolCall` choice is surfaced directly as `ToolCallComplete`.
fn stream_completion<M>(model: M, request: rig::completion::CompletionRequest) -> BoxStream<'static, Result<ChatChunk>>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
{
    use futures::StreamExt;
    use rig::completion::GetTokenUsage;
    use rig::streaming::RawStreamingChoice;

    Box::pin(async_stream::stream! {
        let mut response = match model.stream(request).await {
            Ok(r) => r,
            Err(e) => {
                yield Err(RuntimeTransient::ChatProvider(e.to_string()).into());
                return;
            }
        };

        while let Some(item) = response.next().await {
            match item {
                Ok(RawStreamingChoice::Message(text)) => yield Ok(ChatChunk::TextDelta(text)),
                Ok(RawStreamingChoice::ToolCall(id, name, input)) => {
                    yield Ok(ChatChunk::ToolCallComplete { id, name, input });
                }
                Ok(RawStreamingChoice::FinalResponse(raw)) => {
                    let usage = raw
                        .token_usage()
                        .map(|u| crate::Usage { input_tokens: u.input_tokens, output_tokens: u.output_tokens })
                        .unwrap_or_default();
                    yield Ok(ChatChunk::End { usage });
                }
                Err(e) => {
                    yield Err(RuntimeTransient::ChatProvider(e.to_string()).into());
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_provider_parses_prefix() {
        assert_eq!(split_provider("anthropic/claude-sonnet-4").unwrap(), ("anthropic", "claude-sonnet-4"));
        assert!(split_provider("no-prefix").is_err());
    }
}
