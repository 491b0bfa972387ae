use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use switchboard_core::{
    HttpProvider, MemoryCache, MemoryTranscripts, NormalizedResponse, Pipeline, PipelineConfig,
};

mod config;
mod seed;

use config::SwitchboardConfig;
use seed::Seed;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Switchboard — multi-tenant agent routing")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and seed file
    Init,

    /// Show current configuration
    Config,

    /// Send a one-shot message through the pipeline
    Ask {
        /// The message to route
        message: String,

        /// Tenant to act as
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },

    /// Interactive session (one line per message)
    Chat {
        /// Tenant to act as
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli.config).await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Ask { message, tenant } => cmd_ask(&cli.config, &tenant, &message).await,
        Commands::Chat { tenant } => cmd_chat(&cli.config, &tenant).await,
    }
}

async fn cmd_init(config_path: &Option<PathBuf>) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(config::default_config_path);

    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        tokio::fs::write(&path, config::default_config())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Created config at {}", path.display());
    }

    let seed_path = path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("seed.toml");
    if seed_path.exists() {
        println!("Seed already exists at {}", seed_path.display());
    } else {
        tokio::fs::write(&seed_path, seed::default_seed())
            .await
            .with_context(|| format!("Failed to write {}", seed_path.display()))?;
        println!("Created seed at {}", seed_path.display());
    }

    println!("Edit {} to configure your API key and handlers.", path.display());
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let config = SwitchboardConfig::load(config_path)?;
    println!("{config:#?}");
    Ok(())
}

async fn build_pipeline(config_path: &Option<PathBuf>) -> Result<(Pipeline, SwitchboardConfig)> {
    let config = SwitchboardConfig::load(config_path)?;
    if config.provider.api_key.is_empty() {
        anyhow::bail!(
            "No API key configured. Set provider.api_key or the ANTHROPIC_API_KEY \
             environment variable."
        );
    }

    let seed_path = config.seed_path(config_path);
    let seed = Seed::load(&seed_path)?;
    let store = seed.build_store().await?;
    info!(
        handlers = seed.handlers.len(),
        capabilities = seed.capabilities.len(),
        "seeded configuration store"
    );

    let provider = HttpProvider::new(config.provider.api_key.clone())
        .with_base_url(config.provider.base_url.clone())
        .with_max_tokens(config.provider.max_tokens);

    let pipeline = Pipeline::new(
        Arc::new(store),
        Arc::new(MemoryTranscripts::new()),
        Arc::new(provider),
        Arc::new(MemoryCache::new()),
    )
    .with_router_model(config.provider.router_model.clone())
    .with_config(PipelineConfig {
        budget: Duration::from_secs(config.pipeline.budget_secs),
        window: config.pipeline.window,
    });

    Ok((pipeline, config))
}

async fn cmd_ask(config_path: &Option<PathBuf>, tenant: &str, message: &str) -> Result<()> {
    let (pipeline, config) = build_pipeline(config_path).await?;
    let session = Uuid::new_v4().to_string();

    let response = pipeline
        .handle(tenant, &session, message, &config.provider.capability_credential)
        .await;
    print_response(&response)?;
    Ok(())
}

async fn cmd_chat(config_path: &Option<PathBuf>, tenant: &str) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (pipeline, config) = build_pipeline(config_path).await?;
    let session = Uuid::new_v4().to_string();
    println!("Chatting as tenant '{tenant}' (session {session}). Ctrl-D to exit.");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let response = pipeline
            .handle(tenant, &session, message, &config.provider.capability_credential)
            .await;
        print_response(&response)?;
    }

    println!("Bye.");
    Ok(())
}

fn print_response(response: &NormalizedResponse) -> Result<()> {
    if let Some(message) = response.data.get("message").and_then(|m| m.as_str()) {
        println!("{message}");
    } else {
        println!("{}", serde_json::to_string_pretty(&response.data)?);
    }
    println!(
        "  [{:?} | {} | {} | {}ms]",
        response.status,
        response.handler.as_deref().unwrap_or("-"),
        response.format,
        response.elapsed_ms
    );
    Ok(())
}
