//! Relaybot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use relaybot::access::AccessPolicy;
use relaybot::bot::{BotHandler, COMMANDS};
use relaybot::config::{Config, StorageBackend};
use relaybot::conversation::TiktokenCounter;
use relaybot::llm::OpenAiClient;
use relaybot::messaging::{Messaging, TelegramAdapter};
use relaybot::storage::{MemoryStorage, RedbStorage, Storage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaybot")]
#[command(about = "Telegram bot that streams chat-completion answers as live message edits")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting relaybot");

    let config = if let Some(config_path) = cli.config {
        Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration")?
    };

    tracing::info!(instance_dir = %config.instance_dir.display(), "configuration loaded");

    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, chats are lost on restart");
            serve(config, Arc::new(MemoryStorage::new())).await
        }
        StorageBackend::Redb => {
            let storage = RedbStorage::open(&config.storage.path).with_context(|| {
                format!("failed to open storage at {}", config.storage.path.display())
            })?;
            serve(config, Arc::new(storage)).await
        }
    }
}

async fn serve<S: Storage>(config: Config, storage: Arc<S>) -> anyhow::Result<()> {
    let provider = Arc::new(
        OpenAiClient::new(&config.llm).with_context(|| "failed to initialize completion client")?,
    );
    let messaging = Arc::new(TelegramAdapter::new(config.telegram.token.clone()));
    let policy = AccessPolicy::from_config(&config);

    let counter = Arc::new(TiktokenCounter::new());
    let models = policy.configured_models();
    tokio::task::spawn_blocking({
        let counter = counter.clone();
        move || counter.preload(models.iter().map(String::as_str))
    })
    .await
    .context("tokenizer preload task failed")?
    .context("failed to load tokenizers")?;

    let handler = Arc::new(BotHandler::new(
        messaging.clone(),
        storage,
        provider,
        counter,
        policy,
        config.pipeline,
        config.llm.default_temperature,
    ));

    if let Err(error) = messaging.register_commands(COMMANDS).await {
        tracing::warn!(%error, "failed to register bot commands");
    }

    let inbound = messaging
        .start()
        .await
        .with_context(|| "failed to start telegram adapter")?;

    tracing::info!(adapter = messaging.name(), "relaybot running");

    tokio::select! {
        _ = handler.run(inbound) => {
            tracing::warn!("inbound stream ended");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
    }

    messaging
        .shutdown()
        .await
        .with_context(|| "failed to shut down telegram adapter")?;

    tracing::info!("relaybot stopped");
    Ok(())
}
