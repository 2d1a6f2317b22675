//! `Decide` (`spec.md` §4.3 Add algorithm step 3): an LLM call that takes
//! freshly extracted facts plus retrieved candidate memories and returns an
//! ordered list of ADD/UPDATE/DELETE/NONE actions.

use crate::chat_provider::{ChatMessage, ChatProvider, ChatRequest};
use crate::error::{Result, RuntimeTransient};
use crate::memory::types::{DecisionEvent, MemoryDecision, MemoryItem};
use futures::StreamExt as _;

const DECIDE_SYSTEM_PROMPT: &str = r#"You reconcile newly extracted facts against a user's existing memory.
For each new fact, decide one action:
  ADD    - the fact is new information, no existing memory covers it
  UPDATE - an existing memory should be revised to reflect the new fact
  DELETE - an existing memory is now contradicted and should be removed
  NONE   - the fact is already fully covered by an existing memory, do nothing

Respond with strict JSON: {"decisions": [{"event": "ADD"|"UPDATE"|"DELETE"|"NONE",
"id": "<existing memory id, required for UPDATE/DELETE>", "text": "<final memory text>",
"old_memory": "<prior text, only for UPDATE>"}]}. Preserve the order of the new facts."#;

#[derive(serde::Deserialize)]
struct DecideResponse {
    decisions: Vec<MemoryDecision>,
}

pub async fn decide(
    provider: &dyn ChatProvider,
    model: &str,
    new_facts: &[String],
    candidates: &[MemoryItem],
    timeout: std::time::Duration,
) -> Result<Vec<MemoryDecision>> {
    if new_facts.is_empty() {
        return Ok(Vec::new());
    }

    let candidates_block = candidates
        .iter()
        .map(|c| format!("- id={} text={:?}", c.id, c.text))
        .collect::<Vec<_>>()
        .join("\n");
    let facts_block = new_facts
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{}. {f}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Existing memories:\n{candidates_block}\n\nNew facts:\n{facts_block}"
    );

    let req = ChatRequest {
        model: model.to_string(),
        system_prompt: DECIDE_SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage { role: crate::Role::User, text: prompt }],
        tools: vec![],
        reasoning_effort: None,
    };

    let text = tokio::time::timeout(timeout, collect_text(provider, req))
        .await
        .map_err(|_| RuntimeTransient::Timeout("memory decide".into()))??;

    Ok(parse_decisions(&text, new_facts))
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

/// Parse the LLM's decision JSON. On malformed output, falls back to
/// treating every fact as a plain ADD so extraction is never silently
/// dropped by a decide-step parsing failure.
fn parse_decisions(text: &str, new_facts: &[String]) -> Vec<MemoryDecision> {
    let json_slice = text
        .find('{')
        .and_then(|start| text.rfind('}').map(|end| &text[start..=end]))
        .unwrap_or(text);

    match serde_json::from_str::<DecideResponse>(json_slice) {
        Ok(resp) if !resp.decisions.is_empty() => resp.decisions,
        _ => new_facts
            .iter()
            .map(|f| MemoryDecision {
                event: DecisionEvent::Add,
                id: None,
                text: f.clone(),
                old_memory: None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_response_falls_back_to_add() {
        let facts = vec!["likes tea".to_string()];
        let decisions = parse_decisions("garbage", &facts);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].event, DecisionEvent::Add);
    }

    #[test]
    fn parses_update_decision() {
        let json = r#"{"decisions": [{"event": "UPDATE", "id": "11111111-1111-1111-1111-111111111111", "text": "prefers sushi", "old_memory": "loves pizza"}]}"#;
        let decisions = parse_decisions(json, &["prefers sushi".to_string()]);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].event, DecisionEvent::Update);
        assert_eq!(decisions[0].text, "prefers sushi");
    }
}
