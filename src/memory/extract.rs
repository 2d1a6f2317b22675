//! `Extract` (`spec.md` §4.3 Add algorithm step 1): an LLM call over a
//! JSON-mode prompt producing `{facts: string[]}` from a message exchange.

use crate::chat_provider::{ChatMessage, ChatProvider, ChatRequest};
use crate::error::{Result, RuntimeTransient};
use crate::memory::types::{ExtractedFacts, Scope};
use futures::StreamExt as _;

const EXTRACT_SYSTEM_PROMPT: &str = r#"You extract atomic, declarative facts worth remembering long-term from a
conversation exchange. Respond with strict JSON: {"facts": ["fact one", "fact two"]}.
Each fact must stand alone without pronouns referring outside itself. If nothing is
worth remembering, respond with {"facts": []}. Do not include any other text."#;

/// Run the extraction prompt against `messages` and parse the facts out. An
/// empty or malformed response both resolve to an empty fact list rather
/// than failing the whole `Add` call — extraction is a best-effort step.
pub async fn extract(
    provider: &dyn ChatProvider,
    model: &str,
    messages: &[ChatMessage],
    _scope: &Scope,
    timeout: std::time::Duration,
) -> Result<Vec<String>> {
    let transcript = messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.text))
        .collect::<Vec<_>>()
        .join("\n");

    let req = ChatRequest {
        model: model.to_string(),
        system_prompt: EXTRACT_SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage {
            role: crate::Role::User,
            text: transcript,
        }],
        tools: vec![],
        reasoning_effort: None,
    };

    let text = tokio::time::timeout(timeout, collect_text(provider, req))
        .await
        .map_err(|_| RuntimeTransient::Timeout("memory extract".into()))??;

    Ok(parse_facts(&text))
}

async fn collect_text(provider: &dyn ChatProvider, req: ChatRequest) -> Result<String> {
    let mut stream = provider.stream(req).await?;
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        if let crate::chat_provider::ChatChunk::TextDelta(delta) = chunk? {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

fn parse_facts(text: &str) -> Vec<String> {
    let json_slice = text
        .find('{')
        .and_then(|start| text.rfind('}').map(|end| &text[start..=end]))
        .unwrap_or(text);

    serde_json::from_str::<ExtractedFacts>(json_slice)
        .map(|f| f.facts)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_facts_handles_surrounding_prose() {
        let text = "Here you go:\n{\"facts\": [\"likes tea\", \"lives in Berlin\"]}\nThanks";
        assert_eq!(parse_facts(text), vec!["likes tea", "lives in Berlin"]);
    }

    #[test]
    fn parse_facts_defaults_empty_on_malformed() {
        assert_eq!(parse_facts("not json at all"), Vec::<String>::new());
    }
}
