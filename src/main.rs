use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use synthesis::config::Config;
use synthesis::discord::HttpDiscordClient;
use synthesis::engine::{Backends, SynthesisEngine};
use synthesis::server::{shutdown_signal, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "synthesis", version, about = "Rate-limited Discord mutation job engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine and its HTTP surface (default)
    Serve,
    /// Validate the environment and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => check_config(&config),
        Command::Serve => serve(config).await,
    }
}

fn check_config(config: &Config) -> Result<()> {
    let settings = serde_json::to_string_pretty(&config.engine_settings())?;
    println!("bind_addr: {}", config.bind_addr);
    println!(
        "store: {}",
        if config.uses_redis() { "redis" } else { "in-memory" }
    );
    println!("{}", settings);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting synthesis engine");
    let settings = config.engine_settings();

    let backends = if config.uses_redis() {
        Backends::redis(&config.redis_url, &settings)
            .await
            .context("Failed to initialize Redis backends")?
    } else {
        tracing::warn!("REDIS_URL not set, using in-memory state; limits are not shared across processes");
        Backends::in_memory(&settings)
    };

    if config.discord_token.is_empty() {
        tracing::warn!("DISCORD_TOKEN is empty, external calls will be rejected");
    }
    let client = HttpDiscordClient::new(
        &config.discord_api_base,
        &config.discord_token,
        Duration::from_secs(15),
    )
    .context("Failed to build Discord client")?;

    let engine = Arc::new(SynthesisEngine::new(backends, Arc::new(client), settings));
    engine.start().await;

    Server::new(engine.clone(), config.bind_addr)
        .run(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown(engine.shutdown_grace()).await;
    tracing::info!("Synthesis engine stopped");
    Ok(())
}
