//! CLI argument parsing with subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Telegram auto-forward service.
///
/// Forwards messages from a source chat to each user's destination chats,
/// with optional personal-account listeners for private sources (requires
/// --features userbot).
#[derive(Parser)]
#[command(name = "autoforward-telegram")]
#[command(about = "Telegram auto-forward bot with per-user routing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot, listeners, and health endpoint
    Run {
        /// Path to the configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration status
    Status {
        /// Path to the configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
