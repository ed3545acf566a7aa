//! CLI entry point for threadline

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input};
use std::path::PathBuf;
use std::sync::Arc;
use threadline_agent::{build_backends, ConversationRelay, RelayThreads};
use threadline_channels::{ChannelHandler, ChannelHandlerPtr, TelegramHandler};
use threadline_core::config::{Config, ConfigLoader};
use threadline_core::lifecycle::{LifecycleConfig, LifecycleManager};
use threadline_core::logging::init_logging;
use threadline_core::ThreadState;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "Threaded Telegram conversations with chat-completion backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an initial configuration
    Onboard {
        /// Accept the defaults without prompting
        #[arg(long)]
        defaults: bool,
    },
    /// Run the Telegram gateway
    Gateway,
    /// Show the effective configuration
    Status {
        /// Print the lifecycle settings as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = match cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };

    match cli.command {
        Commands::Onboard { defaults } => run_onboard(&config_loader, defaults)?,
        Commands::Gateway => run_gateway(&config_loader).await?,
        Commands::Status { json } => run_status(&config_loader, json)?,
    }

    Ok(())
}

/// Log directory, resolved against the config directory when relative
fn log_dir(loader: &ConfigLoader, config: &Config) -> PathBuf {
    let dir = PathBuf::from(&config.logging.dir);
    if dir.is_absolute() {
        dir
    } else {
        loader.config_dir().join(dir)
    }
}

fn run_onboard(loader: &ConfigLoader, defaults: bool) -> Result<()> {
    println!("{}", style("Welcome to threadline!").bold().cyan());

    let config_path = loader.config_path();
    if config_path.exists() {
        if defaults {
            println!("Configuration already exists at {}", config_path.display());
            return Ok(());
        }
        let overwrite = Confirm::new()
            .with_prompt("Configuration already exists. Overwrite?")
            .default(false)
            .interact()?;
        if !overwrite {
            println!("Onboard cancelled.");
            return Ok(());
        }
    }

    let mut config = Config::default();
    if !defaults {
        let token: String = Input::new()
            .with_prompt("Telegram bot token (empty to set later)")
            .allow_empty(true)
            .interact_text()?;
        config.telegram.enabled = !token.trim().is_empty();
        config.telegram.token = token.trim().to_string();

        config.backends.stateless.api_key = Input::new()
            .with_prompt("Chat-completion API key")
            .allow_empty(true)
            .interact_text()?;
        config.backends.stateless.model = Input::new()
            .with_prompt("Model")
            .default(config.backends.stateless.model.clone())
            .interact_text()?;

        config.backends.stateful.enabled = Confirm::new()
            .with_prompt("Enable the stateful conversation backend?")
            .default(false)
            .interact()?;
        if config.backends.stateful.enabled {
            config.backends.stateful.api_base = Input::new()
                .with_prompt("Stateful backend URL")
                .default(config.backends.stateful.api_base.clone())
                .interact_text()?;
        }
    }

    loader.save(&config)?;

    println!(
        "\n{}",
        style("Configuration saved successfully!").green().bold()
    );
    println!("Config location: {}", config_path.display());
    println!("\nYou can now run:");
    println!("  {} - Start the gateway", style("threadline gateway").cyan());
    println!("  {} - Check the settings", style("threadline status").cyan());

    Ok(())
}

async fn run_gateway(loader: &ConfigLoader) -> Result<()> {
    let mut config = loader.load()?;
    config.logging.dir = log_dir(loader, &config).to_string_lossy().into_owned();
    let _log_guard = init_logging(&config.logging);

    if !config.telegram.enabled {
        anyhow::bail!(
            "Telegram is disabled; set telegram.enabled in {}",
            loader.config_path().display()
        );
    }

    println!("{}", style("Starting threadline gateway...").bold().cyan());
    println!("Backends: {}", config.backends.enabled().join(", "));
    println!(
        "Session timeout: {} ticks of {:?}",
        config.threads.effective_timeout(),
        config.threads.tick_interval()
    );

    let threads: RelayThreads = ThreadState::shared();
    let (stateless, stateful) = build_backends(&config.backends);

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let mut telegram = TelegramHandler::new(&config.telegram);
    telegram.set_inbound_sender(inbound_tx);
    telegram.start().await?;
    let channel: ChannelHandlerPtr = Arc::new(RwLock::new(telegram));

    let mut relay = ConversationRelay::new(
        Arc::clone(&channel),
        Arc::clone(&threads),
        config.retry.policy(),
    );
    if let Some(backend) = stateless {
        relay = relay.with_stateless(backend);
    }
    if let Some(provider) = stateful {
        relay = relay.with_stateful(provider);
    }
    let relay_handle = tokio::spawn(Arc::new(relay).run(inbound_rx));

    let lifecycle = LifecycleManager::new(threads, LifecycleConfig::from(&config.threads));
    lifecycle.start().await;

    println!(
        "\n{}",
        style("Gateway is running. Press Ctrl+C to stop.").green()
    );

    tokio::signal::ctrl_c().await?;
    println!("\n{}", style("Shutting down...").yellow());

    lifecycle.stop().await;
    if let Err(e) = channel.write().await.stop().await {
        error!("Failed to stop Telegram channel: {}", e);
    }
    relay_handle.abort();
    let _ = relay_handle.await;
    info!("Gateway stopped");

    println!("{}", style("Gateway stopped.").green());
    Ok(())
}

fn run_status(loader: &ConfigLoader, json: bool) -> Result<()> {
    let config = loader.load()?;
    let lifecycle = LifecycleConfig::from(&config.threads);

    if json {
        println!("{}", serde_json::to_string_pretty(&lifecycle)?);
        return Ok(());
    }

    println!("{}", style("threadline status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    println!("  Config directory: {}", loader.config_dir().display());
    println!("  Log directory: {}", log_dir(loader, &config).display());
    println!();

    println!("{}", style("Sessions:").bold());
    println!("  Timeout: {} ticks", lifecycle.timeout_ticks);
    println!("  Tick interval: {:?}", lifecycle.tick_interval);
    println!(
        "  Retry: {} attempt(s), {} ms apart",
        config.retry.max_attempts, config.retry.delay_ms
    );
    println!();

    println!("{}", style("Channels:").bold());
    let telegram = if config.telegram.enabled {
        style("enabled").green()
    } else {
        style("disabled").dim()
    };
    println!("  Telegram: {}", telegram);
    println!();

    println!("{}", style("Backends:").bold());
    for (name, enabled, endpoint) in [
        (
            "stateless",
            config.backends.stateless.enabled,
            &config.backends.stateless.api_base,
        ),
        (
            "stateful",
            config.backends.stateful.enabled,
            &config.backends.stateful.api_base,
        ),
    ] {
        let status = if enabled {
            style("enabled").green()
        } else {
            style("disabled").dim()
        };
        println!("  {}: {} ({})", name, status, endpoint);
    }

    Ok(())
}
