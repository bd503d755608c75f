//! Configuration management.
//!
//! Loads from a JSON file at `~/.autoforward/config.json`, falling back to
//! environment variables (`API_ID`, `API_HASH`, `BOT_TOKEN`, `OWNER_ID`,
//! `DATABASE_PATH`, `PORT`). A `.env` file in the config directory is
//! honored for the environment path.

use crate::error::ConfigError;
use crate::types::UserId;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs_config_dir().join("config.json")
}

/// Default database file path.
pub fn default_database_path() -> PathBuf {
    dirs_config_dir().join("users.redb")
}

/// Get the .autoforward config directory path.
fn dirs_config_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".autoforward"))
        .unwrap_or_else(|| PathBuf::from(".autoforward"))
}

/// JSON configuration file structure.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    api_id: i32,
    api_hash: String,
    bot_token: String,
    #[serde(default)]
    owner_id: Option<i64>,
    #[serde(default)]
    database_path: Option<PathBuf>,
    #[serde(default = "default_health_port")]
    health_port: u16,
}

fn default_health_port() -> u16 {
    8080
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram application identity, shared by the bot and userbot sessions.
    pub api_id: i32,
    pub api_hash: String,
    /// Bot credential used for the primary connection.
    pub bot_token: String,
    /// User allowed to run /stats and /broadcast.
    pub owner_id: Option<UserId>,
    /// Path of the embedded user database.
    pub database_path: PathBuf,
    /// Healthcheck listen port.
    pub health_port: u16,
}

impl Config {
    /// Load configuration from JSON file, falling back to environment variables.
    ///
    /// Search order:
    /// 1. Provided config_path (if any)
    /// 2. `~/.autoforward/config.json`
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            if path.exists() {
                return Self::from_json(&path);
            }
        }

        let default_path = default_config_path();
        if default_path.exists() {
            return Self::from_json(&default_path);
        }

        Self::from_env()
    }

    /// Load configuration from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&content)?;

        if file.bot_token.is_empty() {
            return Err(ConfigError::MissingField("bot_token".to_string()));
        }
        if file.api_hash.is_empty() {
            return Err(ConfigError::MissingField("api_hash".to_string()));
        }

        Ok(Self {
            api_id: file.api_id,
            api_hash: file.api_hash,
            bot_token: file.bot_token,
            owner_id: file.owner_id.map(UserId),
            database_path: file.database_path.unwrap_or_else(default_database_path),
            health_port: file.health_port,
        })
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::from_path(dirs_config_dir().join(".env"));

        let api_id = env::var("API_ID")
            .map_err(|_| ConfigError::MissingEnvVar("API_ID".to_string()))?
            .parse::<i32>()
            .map_err(|_| ConfigError::MissingField("API_ID must be a valid integer".to_string()))?;

        let api_hash =
            env::var("API_HASH").map_err(|_| ConfigError::MissingEnvVar("API_HASH".to_string()))?;

        let bot_token = env::var("BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("BOT_TOKEN".to_string()))?;

        let owner_id = match env::var("OWNER_ID") {
            Ok(value) => Some(UserId(value.parse::<i64>().map_err(|_| {
                ConfigError::MissingField("OWNER_ID must be a valid integer".to_string())
            })?)),
            Err(_) => None,
        };

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_database_path());

        let health_port = match env::var("PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| {
                ConfigError::MissingField("PORT must be a valid port number".to_string())
            })?,
            Err(_) => default_health_port(),
        };

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            owner_id,
            database_path,
            health_port,
        })
    }
}
