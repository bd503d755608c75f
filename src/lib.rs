//! Telegram auto-forward service library.
//!
//! Forwards messages from per-user source chats to destination chats, and
//! optionally listens on linked personal accounts for private sources
//! (with the `userbot` feature).

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod health;
pub mod listener;
pub mod relay;
pub mod store;
pub mod transport;
pub mod types;
pub mod wizard;

// Re-export commonly used types
pub use commands::App;
pub use config::Config;
pub use listener::ListenerRegistry;
pub use relay::Relay;
pub use store::UserStore;
pub use types::{ChatRef, Credential, MessageRef, UserConfig, UserId};
pub use wizard::{SessionWizard, WizardReply};
