//! `web_search` tool (`spec.md` §4.4): the one tool whose backing service
//! is entirely an external collaborator's surface (a search vendor's API);
//! this wraps it behind the same `ToolExecutor` contract as everything else.

use crate::chat_provider::ToolSpec;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeTransient, ToolError, ValidationError};
use crate::mcp::ToolExecutor;
use crate::BotId;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {
    query: String,
    #[serde(default = "default_count")]
    count: u8,
}

fn default_count() -> u8 {
    5
}

pub struct WebSearchTool {
    client: reqwest::Client,
    // Hot-reloadable config is accepted for parity with the other tools
    // wired in `register_builtins`, but nothing here is currently
    // reloadable: the vendor endpoint and key come from the environment.
    _runtime_config: Arc<RuntimeConfig>,
}

impl WebSearchTool {
    pub fn new(runtime_config: Arc<RuntimeConfig>) -> Self {
        Self { client: reqwest::Client::new(), _runtime_config: runtime_config }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Search the public web and return a list of {title, url, snippet} results.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(Args)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, _bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: Args = serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;

        let api_key = std::env::var("BRAVE_SEARCH_API_KEY").map_err(|_| {
            ValidationError::MissingField("BRAVE_SEARCH_API_KEY".into())
        })?;

        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", args.query.as_str()), ("count", &args.count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .send()
            .await
            .map_err(|e| RuntimeTransient::Timeout(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeTransient::ChannelThrottled(format!(
                "search vendor returned {}",
                response.status()
            ))
            .into());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RuntimeTransient::ChatProvider(e.to_string()))?;

        let results: Vec<_> = body
            .pointer("/web/results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(args.count as usize)
            .map(|r| {
                serde_json::json!({
                    "title": r.get("title").and_then(|v| v.as_str()).unwrap_or_default(),
                    "url": r.get("url").and_then(|v| v.as_str()).unwrap_or_default(),
                    "snippet": r.get("description").and_then(|v| v.as_str()).unwrap_or_default(),
                })
            })
            .collect();

        Ok(serde_json::json!({"results": results}))
    }
}
