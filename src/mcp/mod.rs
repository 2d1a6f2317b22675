//! MCP Tool Gateway (`spec.md` §4.4): registers built-in tool executors
//! under stable names and merges in federated tools discovered from
//! external MCP servers, all dispatched through one `invoke(bot, name,
//! input)` surface (§9 design note: "avoid reflection-based dispatch").

mod federation;

use crate::chat_provider::ToolSpec;
use crate::error::{Result, ToolError};
use crate::BotId;
use federation::FederatedServer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Common surface every built-in tool implements. Kept deliberately thin —
/// typed `Args`/`Output` structs live inside each tool in `crate::tools`
/// and are serialized at this boundary, mirroring the teacher's
/// `rig::tool::Tool` pattern without forcing the gateway itself to know
/// any tool's concrete argument type.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value>;
}

pub struct McpGateway {
    builtins: HashMap<String, Arc<dyn ToolExecutor>>,
    federated: RwLock<HashMap<String, Arc<FederatedServer>>>,
}

impl McpGateway {
    pub fn new() -> Self {
        Self {
            builtins: HashMap::new(),
            federated: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) {
        self.builtins.insert(tool.name().to_string(), tool);
    }

    /// Connects to every configured federated server, tolerating individual
    /// failures (a server that's down shouldn't take down the others).
    pub async fn connect_federated(&self, configs: &[crate::config::McpServerConfig]) {
        for cfg in configs {
            if !cfg.enabled {
                continue;
            }
            let server = Arc::new(FederatedServer::new(cfg.clone()));
            if let Err(e) = server.connect().await {
                tracing::warn!(server = %cfg.name, error = %e, "failed to connect mcp server");
            }
            self.federated.write().await.insert(cfg.name.clone(), server);
        }
    }

    /// Full catalog: built-ins by their own name, federated tools prefixed
    /// `<source>:<tool>` (§4.4).
    pub async fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.builtins.values().map(|t| t.spec()).collect();

        for (source, server) in self.federated.read().await.iter() {
            for tool in server.list_tools().await {
                specs.push(ToolSpec {
                    name: format!("{source}:{}", tool.name),
                    description: tool.description.clone().unwrap_or_default().into_owned(),
                    parameters: serde_json::to_value(&tool.input_schema).unwrap_or(serde_json::Value::Null),
                });
            }
        }

        specs
    }

    /// Dispatch by stable name. A `<source>:<tool>` name routes to the
    /// federated server `<source>`; anything else is looked up in the
    /// built-in registry.
    pub async fn invoke(&self, bot_id: BotId, tool_name: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        if let Some((source, remote_tool)) = tool_name.split_once(':') {
            let federated = self.federated.read().await;
            let server = federated
                .get(source)
                .ok_or_else(|| ToolError::Unknown(tool_name.to_string()))?;
            return server.call_tool(remote_tool, input).await;
        }

        let tool = self
            .builtins
            .get(tool_name)
            .ok_or_else(|| ToolError::Unknown(tool_name.to_string()))?;
        tool.invoke(bot_id, input).await
    }
}

impl Default for McpGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl ToolExecutor for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "echoes input".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }
        async fn invoke(&self, _bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_builtin() {
        let mut gateway = McpGateway::new();
        gateway.register(Arc::new(EchoTool));

        let specs = gateway.list().await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");

        let out = gateway.invoke(BotId::new(), "echo", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(out, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_tool_name_errors() {
        let gateway = McpGateway::new();
        let err = gateway.invoke(BotId::new(), "nope", serde_json::Value::Null).await;
        assert!(err.is_err());
    }
}
