//! `Compact` (`spec.md` §4.3 Compaction): summarizes a scope's memories down
//! to a smaller set of canonical facts via an LLM prompt, mirroring
//! `extract.rs`'s single-shot JSON-mode call shape.

use crate::chat_provider::{ChatMessage, ChatProvider, ChatRequest};
use crate::error::{Result, RuntimeTransient};
use crate::memory::types::ExtractedFacts;
use futures::StreamExt as _;

const COMPACT_SYSTEM_PROMPT: &str = r#"You consolidate a list of long-term memory facts about the same subject into a
smaller set of canonical facts, dropping redundancy and superseded statements while
keeping everything still true. Respond with strict JSON: {"facts": ["fact one", "fact two"]}.
Do not include any other text."#;

/// Summarizes `facts` into a smaller canonical set. Returns the input
/// unchanged if the model response is empty or malformed, so a failed
/// summarization never loses memories outright.
pub async fn summarize(
    provider: &dyn ChatProvider,
    model: &str,
    facts: &[String],
    timeout: std::time::Duration,
) -> Result<Vec<String>> {
    if facts.len() < 2 {
        return Ok(facts.to_vec());
    }

    let transcript = facts.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n");

    let req = ChatRequest {
        model: model.to_string(),
        system_prompt: COMPACT_SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage { role: crate::Role::User, text: transcript }],
        tools: vec![],
        reasoning_effort: None,
    };

    let text = tokio::time::timeout(timeout, collect_text(provider, req))
        .await
        .map_err(|_| RuntimeTransient::Timeout("memory compact".into()))??;

    let summarized = parse_facts(&text);
    if summarized.is_empty() {
        Ok(facts.to_vec())
    } else {
        Ok(summarized)
    }
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
        let text = "Sure:\n{\"facts\": [\"prefers tea\"]}\n";
        assert_eq!(parse_facts(text), vec!["prefers tea"]);
    }

    #[test]
    fn parse_facts_defaults_empty_on_malformed() {
        assert_eq!(parse_facts("nonsense"), Vec::<String>::new());
    }
}
