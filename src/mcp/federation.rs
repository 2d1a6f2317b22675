//! A single federated MCP server connection, adapted from the teacher's
//! `mcp.rs` `McpConnection`: owns an `rmcp` client session, caches the
//! remote tool list, and re-lists it when the server signals a change.

use crate::config::{McpServerConfig, McpTransport};
use crate::error::{Result, ToolError};
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use rmcp::ClientHandler;
use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

type Session = RunningService<RoleClient, FederationClientHandler>;

#[derive(Clone)]
struct FederationClientHandler {
    tool_list_changed: std::sync::Arc<AtomicBool>,
    client_info: rmcp::model::ClientInfo,
}

impl FederationClientHandler {
    fn new(tool_list_changed: std::sync::Arc<AtomicBool>) -> Self {
        Self {
            tool_list_changed,
            client_info: rmcp::model::ClientInfo {
                meta: None,
                protocol_version: rmcp::model::ProtocolVersion::default(),
                capabilities: rmcp::model::ClientCapabilities::default(),
                client_info: rmcp::model::Implementation {
                    name: "meshbot".to_string(),
                    title: None,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    description: Some("meshbot MCP client".to_string()),
                    icons: None,
                    website_url: None,
                },
            },
        }
    }
}

impl ClientHandler for FederationClientHandler {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.tool_list_changed.store(true, Ordering::SeqCst);
        std::future::ready(())
    }

    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

pub struct FederatedServer {
    name: String,
    config: McpServerConfig,
    session: Mutex<Option<Session>>,
    tools: RwLock<Vec<rmcp::model::Tool>>,
    tool_list_changed: std::sync::Arc<AtomicBool>,
}

impl FederatedServer {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            session: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            tool_list_changed: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let handler = FederationClientHandler::new(self.tool_list_changed.clone());
        let session = self.open_session(handler).await?;

        let tools = session
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("failed to list tools for mcp server {}: {e}", self.name))?;

        *self.session.lock().await = Some(session);
        *self.tools.write().await = tools;
        self.tool_list_changed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self, handler: FederationClientHandler) -> Result<Session> {
        match &self.config.transport {
            McpTransport::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_, _>>());

                let transport = rmcp::transport::TokioChildProcess::new(cmd)
                    .map_err(|e| anyhow::anyhow!("failed to spawn mcp server {}: {e}", self.name))?;

                rmcp::serve_client(handler, transport)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to initialize mcp server {}: {e}", self.name).into())
            }
            McpTransport::Http { url, headers } => {
                let mut custom_headers = HashMap::new();
                for (name, value) in headers {
                    let parsed_name = reqwest::header::HeaderName::from_str(name)
                        .map_err(|e| anyhow::anyhow!("invalid mcp header name {name}: {e}"))?;
                    let parsed_value = reqwest::header::HeaderValue::from_str(value)
                        .map_err(|e| anyhow::anyhow!("invalid mcp header value for {name}: {e}"))?;
                    custom_headers.insert(parsed_name, parsed_value);
                }

                let transport_config =
                    rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                        url.clone(),
                    )
                    .custom_headers(custom_headers);
                let transport = rmcp::transport::StreamableHttpClientTransport::from_config(transport_config);

                rmcp::serve_client(handler, transport)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to initialize mcp server {}: {e}", self.name).into())
            }
        }
    }

    pub async fn list_tools(&self) -> Vec<rmcp::model::Tool> {
        if self.tool_list_changed.swap(false, Ordering::SeqCst)
            && let Err(e) = self.refresh_tools().await
        {
            tracing::warn!(server = %self.name, error = %e, "failed to refresh mcp tool list");
        }
        self.tools.read().await.clone()
    }

    async fn refresh_tools(&self) -> Result<()> {
        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref() else {
            return Err(anyhow::anyhow!("mcp server {} is not connected", self.name).into());
        };
        let tools = session
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("failed to list tools for mcp server {}: {e}", self.name))?;
        drop(guard);
        *self.tools.write().await = tools;
        Ok(())
    }

    pub async fn call_tool(&self, tool_name: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        let arguments = match input {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => {
                return Err(ToolError::InvalidInput {
                    name: tool_name.to_string(),
                    message: "mcp tool arguments must be a JSON object or null".into(),
                }
                .into());
            }
        };

        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref() else {
            return Err(ToolError::Failed {
                name: tool_name.to_string(),
                message: format!("mcp server {} is not connected", self.name),
            }
            .into());
        };

        let params = rmcp::model::CallToolRequestParams {
            meta: None,
            name: Cow::Owned(tool_name.to_string()),
            arguments,
            task: None,
        };

        let result = session
            .call_tool(params)
            .await
            .map_err(|e| ToolError::Failed { name: tool_name.to_string(), message: e.to_string() })?;

        serde_json::to_value(result).map_err(|e| anyhow::anyhow!(e).into())
    }
}
