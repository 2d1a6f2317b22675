//! `list`/`read`/`write`/`edit`/`exec` tools (`spec.md` §4.4, §9 design
//! note on the container boundary): every path argument is resolved against
//! the bot's own workspace through [`super::safe_join`] before touching disk
//! or the container runtime.

use crate::chat_provider::ToolSpec;
use crate::container::ContainerRuntime;
use crate::error::{Result, ToolError};
use crate::mcp::ToolExecutor;
use crate::BotId;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

fn invalid(name: &str, e: impl std::fmt::Display) -> crate::error::Error {
    ToolError::InvalidInput { name: name.to_string(), message: e.to_string() }.into()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListArgs {
    #[serde(default)]
    path: String,
}

pub struct ListTool {
    container: Arc<dyn ContainerRuntime>,
}

impl ListTool {
    pub fn new(container: Arc<dyn ContainerRuntime>) -> Self {
        Self { container }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "List files and directories under a path in this bot's own workspace.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(ListArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: ListArgs = serde_json::from_value(input).map_err(|e| invalid(self.name(), e))?;
        let root = self.container.workspace_dir(&bot_id);
        let dir = super::safe_join(&root, &args.path)?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|e| invalid(self.name(), e))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| invalid(self.name(), e))? {
            let file_type = entry.file_type().await.map_err(|e| invalid(self.name(), e))?;
            entries.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": file_type.is_dir(),
            }));
        }
        Ok(serde_json::json!({"entries": entries}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadArgs {
    path: String,
}

pub struct ReadTool {
    container: Arc<dyn ContainerRuntime>,
}

impl ReadTool {
    pub fn new(container: Arc<dyn ContainerRuntime>) -> Self {
        Self { container }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Read a text file from this bot's own workspace.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(ReadArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: ReadArgs = serde_json::from_value(input).map_err(|e| invalid(self.name(), e))?;
        let root = self.container.workspace_dir(&bot_id);
        let path = super::safe_join(&root, &args.path)?;
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| invalid(self.name(), e))?;
        Ok(serde_json::json!({"contents": contents}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteArgs {
    path: String,
    contents: String,
}

pub struct WriteTool {
    container: Arc<dyn ContainerRuntime>,
}

impl WriteTool {
    pub fn new(container: Arc<dyn ContainerRuntime>) -> Self {
        Self { container }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Create or overwrite a text file in this bot's own workspace, creating parent directories as needed.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(WriteArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: WriteArgs = serde_json::from_value(input).map_err(|e| invalid(self.name(), e))?;
        let root = self.container.workspace_dir(&bot_id);
        let path = super::safe_join(&root, &args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| invalid(self.name(), e))?;
        }
        tokio::fs::write(&path, &args.contents).await.map_err(|e| invalid(self.name(), e))?;
        Ok(serde_json::json!({"written": true, "bytes": args.contents.len()}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EditArgs {
    path: String,
    old_string: String,
    new_string: String,
}

pub struct EditTool {
    container: Arc<dyn ContainerRuntime>,
}

impl EditTool {
    pub fn new(container: Arc<dyn ContainerRuntime>) -> Self {
        Self { container }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Replace one exact, unique occurrence of old_string with new_string in a workspace file.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(EditArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: EditArgs = serde_json::from_value(input).map_err(|e| invalid(self.name(), e))?;
        let root = self.container.workspace_dir(&bot_id);
        let path = super::safe_join(&root, &args.path)?;
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| invalid(self.name(), e))?;

        let occurrences = contents.matches(args.old_string.as_str()).count();
        if occurrences == 0 {
            return Err(invalid(self.name(), "old_string not found in file"));
        }
        if occurrences > 1 {
            return Err(invalid(self.name(), format!("old_string is not unique ({occurrences} matches)")));
        }

        let updated = contents.replacen(&args.old_string, &args.new_string, 1);
        tokio::fs::write(&path, &updated).await.map_err(|e| invalid(self.name(), e))?;
        Ok(serde_json::json!({"edited": true}))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecArgs {
    /// Argv, e.g. `["bash", "-lc", "ls -la"]`.
    command: Vec<String>,
    #[serde(default)]
    cwd: String,
}

pub struct ExecTool {
    container: Arc<dyn ContainerRuntime>,
}

impl ExecTool {
    pub fn new(container: Arc<dyn ContainerRuntime>) -> Self {
        Self { container }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Run a command inside this bot's own container workspace and return its stdout/stderr/exit code.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(ExecArgs)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: ExecArgs = serde_json::from_value(input).map_err(|e| invalid(self.name(), e))?;
        if args.command.is_empty() {
            return Err(invalid(self.name(), "command must not be empty"));
        }

        // cwd is relative to the workspace root but is passed straight to
        // ContainerRuntime::exec, which itself joins it under the bot's
        // workspace_dir(); validate it here too so `..` can't escape.
        super::safe_join(&self.container.workspace_dir(&bot_id), &args.cwd)?;

        let output = self
            .container
            .exec(&bot_id, &args.command, std::path::Path::new(&args.cwd))
            .await?;

        Ok(serde_json::json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
        }))
    }
}
