//! Telegram auto-forward service - CLI entry point.

mod cli;
mod commands;
mod config;
mod error;
mod health;
mod listener;
mod relay;
mod store;
mod transport;
mod types;
mod wizard;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use commands::App;
use config::Config;
use listener::ListenerRegistry;
use relay::Relay;
use std::path::PathBuf;
use std::sync::Arc;
use store::UserStore;
use teloxide::Bot;
use transport::telegram::TelegramBotTransport;
use transport::SecondaryConnector;
use wizard::SessionWizard;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run(config).await.context("Failed to run the bot")?;
        }
        Commands::Status { config } => {
            print_status(config)?;
        }
    }

    Ok(())
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = UserStore::open(&config.database_path)?;

    let bot = Bot::new(&config.bot_token);
    let transport = Arc::new(TelegramBotTransport::new(bot.clone()));
    let relay = Relay::new(transport, store.clone());
    let connector = secondary_connector(&config);
    let listeners = ListenerRegistry::new(Arc::clone(&connector), Arc::clone(&relay), store.clone());
    let wizard = Arc::new(SessionWizard::new(
        connector,
        store.clone(),
        Arc::clone(&listeners),
    ));

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(err) = health::serve(health_port).await {
            tracing::error!(error = %err, "health endpoint failed");
        }
    });

    // Bring up listeners for every stored credential before taking updates.
    let registry = Arc::clone(&listeners);
    tokio::spawn(async move {
        registry.reconcile().await;
    });

    tracing::info!("Starting auto-forward bot...");

    let app = App {
        store,
        relay,
        wizard,
        listeners: Arc::clone(&listeners),
        owner: config.owner_id,
    };
    commands::run(bot, app).await;

    listeners.shutdown().await;
    Ok(())
}

#[cfg(feature = "userbot")]
fn secondary_connector(config: &Config) -> Arc<dyn SecondaryConnector> {
    Arc::new(transport::userbot::GrammersConnector::new(
        config.api_id,
        config.api_hash.clone(),
    ))
}

#[cfg(not(feature = "userbot"))]
fn secondary_connector(_config: &Config) -> Arc<dyn SecondaryConnector> {
    Arc::new(transport::DisabledConnector)
}

/// Print configuration status.
fn print_status(config_path: Option<PathBuf>) -> Result<()> {
    println!("📊 Auto-Forward Bot Status\n");

    match Config::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration: Found");
            println!("   Owner: {}", match config.owner_id {
                Some(id) => id.to_string(),
                None => "not set".to_string(),
            });
            println!("   Database: {}", config.database_path.display());
            println!("   Health port: {}", config.health_port);
            println!();
            println!("📱 Personal-account sessions:");
            if cfg!(feature = "userbot") {
                println!("   Status: Available (api_id {})", config.api_id);
            } else {
                println!("   Status: Not available (compile with --features userbot)");
            }
            println!();
            if config.database_path.exists() {
                println!("💾 Database: Present");
            } else {
                println!("💾 Database: Will be created on first run");
            }
        }
        Err(e) => {
            println!("❌ Configuration: Not found or invalid");
            println!("   Error: {}", e);
            println!();
            println!("Create config at ~/.autoforward/config.json:");
            println!(r#"  {{"bot_token": "...", "api_id": 12345, "api_hash": "..."}}"#);
        }
    }

    Ok(())
}
