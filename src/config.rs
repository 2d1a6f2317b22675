//! Static process configuration plus the hot-reloadable runtime config.

use crate::error::{Result, ValidationError};
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level process configuration, loaded once at startup from TOML layered
/// over environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for SQLite/LanceDB/redb and per-bot workspaces.
    pub data_dir: PathBuf,

    /// Address the local-web channel binds to, if any bot enables it.
    pub bind_addr: std::net::SocketAddr,

    /// Chat provider defaults.
    pub llm: LlmConfig,

    /// Memory engine thresholds.
    pub memory: MemoryConfig,

    /// Inbound/resolver concurrency and timeout defaults.
    pub runtime: RuntimeLimits,

    /// Path to the hot-reloadable TOML file watched for `RuntimeConfig`.
    pub runtime_config_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub default_chat_model: String,
    pub default_memory_model: String,
    pub default_embedding_model: String,
    pub anthropic_key: Option<String>,
    pub openai_key: Option<String>,
    pub openrouter_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    pub rrf_k: f64,
    pub search_candidates_per_fact: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            search_candidates_per_fact: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub llm_call_timeout_secs: u64,
    pub tool_call_timeout_secs: u64,
    pub memory_llm_timeout_secs: u64,
    pub channel_send_timeout_secs: u64,
    pub max_tool_hops: usize,
    pub inbound_queue_capacity: usize,
    pub subscriber_queue_capacity: usize,
    pub cancellation_drain_budget_secs: u64,
    pub max_attachment_bytes: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            llm_call_timeout_secs: 120,
            tool_call_timeout_secs: 60,
            memory_llm_timeout_secs: 30,
            channel_send_timeout_secs: 15,
            max_tool_hops: 8,
            inbound_queue_capacity: 1000,
            subscriber_queue_capacity: 64,
            cancellation_drain_budget_secs: 5,
            max_attachment_bytes: 200 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment and an optional TOML file.
    pub fn load() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("meshbot"))
            .unwrap_or_else(|| PathBuf::from("./data"));

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        Self::load_from_path(&data_dir.join("config.toml"))
    }

    /// Load from a specific TOML file path, falling back to defaults/env for
    /// anything the file doesn't set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("bind_addr", "127.0.0.1:8787")?
            .set_default("llm.default_chat_model", "anthropic/claude-sonnet-4-20250514")?
            .set_default("llm.default_memory_model", "anthropic/claude-haiku-4.5-20250514")?
            .set_default("llm.default_embedding_model", "fastembed/bge-small-en-v1.5")?
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MESHBOT").separator("__"));

        let raw = builder.build().context("failed to assemble configuration")?;

        let data_dir = dirs::data_dir()
            .map(|d| d.join("meshbot"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let bind_addr: std::net::SocketAddr = raw
            .get_string("bind_addr")
            .unwrap_or_else(|_| "127.0.0.1:8787".into())
            .parse()
            .context("invalid bind_addr")?;

        let llm = LlmConfig {
            default_chat_model: raw
                .get_string("llm.default_chat_model")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4-20250514".into()),
            default_memory_model: raw
                .get_string("llm.default_memory_model")
                .unwrap_or_else(|_| "anthropic/claude-haiku-4.5-20250514".into()),
            default_embedding_model: raw
                .get_string("llm.default_embedding_model")
                .unwrap_or_else(|_| "fastembed/bge-small-en-v1.5".into()),
            anthropic_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_key: std::env::var("OPENAI_API_KEY").ok(),
            openrouter_key: std::env::var("OPENROUTER_API_KEY").ok(),
        };

        if llm.anthropic_key.is_none() && llm.openai_key.is_none() && llm.openrouter_key.is_none() {
            return Err(ValidationError::MissingField(
                "no chat provider API key found: set ANTHROPIC_API_KEY, OPENAI_API_KEY, or OPENROUTER_API_KEY".into(),
            )
            .into());
        }

        Ok(Self {
            runtime_config_path: data_dir.join("runtime.toml"),
            data_dir,
            bind_addr,
            llm,
            memory: MemoryConfig::default(),
            runtime: RuntimeLimits::default(),
        })
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("meshbot.db")
    }

    pub fn lancedb_path(&self) -> PathBuf {
        self.data_dir.join("lancedb")
    }

    pub fn redb_path(&self) -> PathBuf {
        self.data_dir.join("settings.redb")
    }

    pub fn bot_workspace_dir(&self, bot_id: &crate::BotId) -> PathBuf {
        self.data_dir.join("bots").join(bot_id.to_string())
    }
}

/// One configured external MCP server (`spec.md` §4.4 "Federated tools").
#[derive(Debug, Clone, serde::Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: McpTransport,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: std::collections::HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
    },
}

/// Hot-reloadable pieces of configuration, held behind an `ArcSwap` so
/// resolver/scheduler/channel tasks always read the latest snapshot without
/// taking a lock. Swapped wholesale on a filesystem change to
/// `Config::runtime_config_path`.
pub struct RuntimeConfig {
    inner: arc_swap::ArcSwap<RuntimeConfigInner>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RuntimeConfigInner {
    /// Identity/persona text injected into every bot's system prompt unless
    /// overridden per-bot.
    #[serde(default)]
    pub default_identity: String,

    /// Enabled skill descriptions, keyed by skill name.
    #[serde(default)]
    pub skills: std::collections::HashMap<String, String>,

    /// IANA timezone used for cron evaluation display (evaluation itself is
    /// always UTC per §6).
    #[serde(default = "default_timezone")]
    pub cron_timezone: String,

    /// Maximum inbox notifications loaded into context per resolver run.
    #[serde(default = "default_max_inbox_items")]
    pub max_inbox_items: usize,

    /// Maximum history load window in minutes.
    #[serde(default = "default_max_context_load_minutes")]
    pub max_context_load_minutes: i64,

    /// Maximum history load window in tokens (whichever binds first).
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Federated MCP servers to connect the Tool Gateway to.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

fn default_timezone() -> String {
    "UTC".into()
}
fn default_max_inbox_items() -> usize {
    20
}
fn default_max_context_load_minutes() -> i64 {
    720
}
fn default_max_context_tokens() -> usize {
    128_000
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let inner = Self::read_inner(path).unwrap_or_default();
        Ok(Self {
            inner: arc_swap::ArcSwap::from_pointee(inner),
        })
    }

    fn read_inner(path: &Path) -> Option<RuntimeConfigInner> {
        let text = std::fs::read_to_string(path).ok()?;
        toml::from_str(&text).ok()
    }

    pub fn current(&self) -> Arc<RuntimeConfigInner> {
        self.inner.load_full()
    }

    pub fn reload_from(&self, path: &Path) {
        if let Some(fresh) = Self::read_inner(path) {
            self.inner.store(Arc::new(fresh));
        } else {
            tracing::warn!(path = %path.display(), "failed to reload runtime config, keeping prior snapshot");
        }
    }
}

/// Spawns a `notify` watcher on `path` that reloads `runtime` whenever the
/// file changes. Returns the watcher so the caller keeps it alive for the
/// process lifetime.
pub fn watch_runtime_config(
    path: PathBuf,
    runtime: Arc<RuntimeConfig>,
) -> Result<notify::RecommendedWatcher> {
    use notify::Watcher;

    let watch_path = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res
            && event.kind.is_modify()
        {
            runtime.reload_from(&watch_path);
        }
    })
    .context("failed to construct config file watcher")?;

    if let Some(parent) = path.parent() {
        watcher
            .watch(parent, notify::RecursiveMode::NonRecursive)
            .context("failed to watch config directory")?;
    }

    Ok(watcher)
}
