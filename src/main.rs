//! meshbot daemon entrypoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use meshbot::bots::BotStore;
use meshbot::channels::{discord, email, lark, telegram, webchat, ChannelManager};
use meshbot::chat_provider::RigChatProvider;
use meshbot::config::{Config, RuntimeConfig};
use meshbot::container::{ContainerRuntime, LocalProcessRuntime};
use meshbot::events::EventHub;
use meshbot::inbound::InboundProcessor;
use meshbot::mcp::McpGateway;
use meshbot::media::{LocalStorageProvider, MediaStore};
use meshbot::memory::MemoryEngine;
use meshbot::scheduler::Scheduler;
use meshbot::{BotId, ChannelType, Deps};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshbot", version)]
#[command(about = "A multi-tenant AI agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the static config TOML (defaults to `<data_dir>/config.toml`)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given)
    Run,
    /// Load and validate configuration without starting anything
    ConfigCheck,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let config = load_config(&cli.config)?;

    match command {
        Command::ConfigCheck => {
            println!("config OK: data_dir={}", config.data_dir.display());
            Ok(())
        }
        Command::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build Tokio runtime")?;
            runtime.block_on(run(config))
        }
    }
}

fn load_config(path: &Option<std::path::PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Ok(Config::load_from_path(p)?),
        None => Ok(Config::load()?),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let _logging_guard = meshbot::telemetry::init(&config.data_dir)?;
    tracing::info!(data_dir = %config.data_dir.display(), "starting meshbot");

    let pool = meshbot::db::open_pool(&config.sqlite_path()).await?;
    meshbot::db::run_migrations(&pool).await?;

    let runtime_config = Arc::new(RuntimeConfig::load(&config.runtime_config_path)?);
    let _config_watcher =
        meshbot::config::watch_runtime_config(config.runtime_config_path.clone(), runtime_config.clone())
            .context("failed to start runtime config watcher")?;

    let container: Arc<dyn ContainerRuntime> =
        Arc::new(LocalProcessRuntime::new(config.data_dir.join("bots")));

    let chat_provider = Arc::new(build_chat_provider(&config)?);

    let memory = Arc::new(MemoryEngine::new(
        container.clone(),
        chat_provider.clone(),
        config.lancedb_path(),
        config.llm.default_memory_model.clone(),
        config.llm.default_embedding_model.clone(),
        384,
        config.memory,
        config.runtime,
    ));

    let events = Arc::new(EventHub::default());
    let channels = Arc::new(ChannelManager::new(config.runtime.inbound_queue_capacity));

    // `register_builtins` only reads `deps.{pool,channels,memory,container,config}`,
    // never `deps.mcp` itself, so a placeholder empty gateway here is safe — it's
    // discarded once the populated one is built below.
    let bootstrap_deps = Arc::new(Deps {
        pool: pool.clone(),
        config: runtime_config.clone(),
        limits: config.runtime,
        chat_provider: chat_provider.clone(),
        memory: memory.clone(),
        mcp: Arc::new(McpGateway::new()),
        channels: channels.clone(),
        container: container.clone(),
        events: events.clone(),
    });

    let mut mcp = McpGateway::new();
    meshbot::tools::register_builtins(&mut mcp, &bootstrap_deps);
    mcp.connect_federated(&runtime_config.current().mcp_servers).await;

    let deps = Arc::new(Deps {
        pool: pool.clone(),
        config: runtime_config.clone(),
        limits: config.runtime,
        chat_provider: chat_provider.clone(),
        memory: memory.clone(),
        mcp: Arc::new(mcp),
        channels: channels.clone(),
        container: container.clone(),
        events: events.clone(),
    });

    let media = Arc::new(MediaStore::new(
        pool.clone(),
        Arc::new(LocalStorageProvider::new(config.data_dir.join("bots"))),
    ));

    let processor = Arc::new(InboundProcessor::new(deps.clone(), media.clone()));

    let scheduler = Arc::new(Scheduler::new(pool.clone(), channels.queue.clone()));
    tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    start_configured_channels(&pool, &channels, processor.clone()).await?;

    tracing::info!("meshbot is running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    Ok(())
}

fn build_chat_provider(config: &Config) -> anyhow::Result<RigChatProvider> {
    let (provider, _) = config
        .llm
        .default_chat_model
        .split_once('/')
        .context("default_chat_model must be `<provider>/<model-id>`")?;
    let api_key = meshbot::chat_provider::resolve_api_key(provider, &config.llm)?;
    Ok(RigChatProvider::new(
        provider,
        api_key,
        Duration::from_secs(config.runtime.llm_call_timeout_secs),
    ))
}

/// Starts every enabled `BotChannelConfig`'s adapter, plus a drain task per
/// bot that pops events off its queue and hands them to the Inbound
/// Processor (`spec.md` §4.5, §4.1).
async fn start_configured_channels(
    pool: &sqlx::SqlitePool,
    channels: &Arc<ChannelManager>,
    processor: Arc<InboundProcessor>,
) -> anyhow::Result<()> {
    let bots = BotStore::new(pool.clone());
    let configs = bots.list_enabled_channel_configs().await?;

    let mut started_drain_for: std::collections::HashSet<BotId> = std::collections::HashSet::new();

    for cfg in configs {
        let adapter: Arc<dyn meshbot::channels::ChannelAdapter> = match cfg.channel_type {
            ChannelType::Telegram => {
                Arc::new(telegram::TelegramAdapter::new(cfg.self_identity.clone(), &cfg.credentials)?)
            }
            ChannelType::Discord => {
                Arc::new(discord::DiscordAdapter::new(cfg.self_identity.clone(), &cfg.credentials)?)
            }
            ChannelType::Lark => Arc::new(lark::LarkAdapter::new(cfg.self_identity.clone(), &cfg.credentials)?),
            ChannelType::Email => Arc::new(email::EmailAdapter::new(cfg.self_identity.clone(), &cfg.credentials)?),
            ChannelType::LocalWeb => {
                Arc::new(webchat::WebchatAdapter::new(cfg.self_identity.clone(), &cfg.credentials)?)
            }
        };

        channels.start_adapter(cfg.bot_id, adapter).await;

        if started_drain_for.insert(cfg.bot_id) {
            let queue = channels.queue.clone();
            let processor = processor.clone();
            let bot_id = cfg.bot_id;
            tokio::spawn(async move {
                loop {
                    let event = queue.pop(bot_id).await;
                    if let Err(e) = processor.handle(event).await {
                        tracing::error!(bot_id = %bot_id, error = %e, "failed to handle inbound event");
                    }
                }
            });
        }
    }

    Ok(())
}
