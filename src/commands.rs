//! Bot command surface and update dispatch.

use crate::listener::ListenerRegistry;
use crate::relay::Relay;
use crate::store::UserStore;
use crate::types::{ChatRef, MessageRef, UserId};
use crate::wizard::{SessionWizard, WizardReply};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

/// Shared application context handed to every handler.
#[derive(Clone)]
pub struct App {
    pub store: UserStore,
    pub relay: Arc<Relay>,
    pub wizard: Arc<SessionWizard>,
    pub listeners: Arc<ListenerRegistry>,
    pub owner: Option<UserId>,
}

/// Available bot commands.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "Available commands:")]
pub enum Command {
    #[command(description = "Show a welcome message and your chat ID")]
    Start,
    #[command(description = "Show help")]
    Help,
    #[command(description = "Set the source chat to forward from")]
    SetSource(i64),
    #[command(description = "Clear the source chat")]
    DelSource,
    #[command(description = "Add a destination chat")]
    AddDestination(i64),
    #[command(description = "Remove a destination chat")]
    RemoveDestination(i64),
    #[command(description = "List configured destination chats")]
    Destinations,
    #[command(description = "Show the configured source chats")]
    Sources,
    #[command(description = "Link a personal account for private sources")]
    AddSession,
    #[command(description = "Cancel the sign-in in progress")]
    Cancel,
    #[command(description = "Add a private chat to forward from")]
    AddPrivateSource(i64),
    #[command(description = "Remove a private source chat")]
    RemovePrivateSource(i64),
    #[command(description = "Show usage statistics (owner only)")]
    Stats,
    #[command(description = "Send a message to every user (owner only)")]
    Broadcast(String),
}

/// Run the update dispatcher until shutdown.
pub async fn run(bot: Bot, app: App) {
    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(channel_post_handler))
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(command_handler),
        )
        .branch(Update::filter_message().endpoint(message_handler));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![app])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// A post in a channel the bot is a member of. Forwarding runs in its own
/// task so the dispatcher never waits on rate-limit cooldowns.
async fn channel_post_handler(msg: Message, app: App) -> ResponseResult<()> {
    let source = ChatRef(msg.chat.id.0);
    let message = MessageRef(msg.id.0);
    let relay = Arc::clone(&app.relay);
    tokio::spawn(async move {
        relay.on_source_message(source, message).await;
    });
    Ok(())
}

async fn command_handler(bot: Bot, msg: Message, cmd: Command, app: App) -> ResponseResult<()> {
    let Some(user) = sender(&msg) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    let text = match cmd {
        Command::Start => format!(
            "👋 Welcome! This bot forwards messages from a source chat to \
             your destination chats.\n\nYour ID is: {}\n\nUse /help to get started.",
            user
        ),
        Command::Help => Command::descriptions().to_string(),
        Command::SetSource(id) => match app.store.set_source(user, ChatRef(id)) {
            Ok(()) => format!("✅ Source chat set to {id}."),
            Err(err) => storage_failure(user, &err),
        },
        Command::DelSource => match app.store.clear_source(user) {
            Ok(()) => "✅ Source chat cleared.".to_string(),
            Err(err) => storage_failure(user, &err),
        },
        Command::AddDestination(id) => match app.store.add_destination(user, ChatRef(id)) {
            Ok(true) => format!("✅ Destination {id} added."),
            Ok(false) => format!("ℹ️ Destination {id} is already configured."),
            Err(err) => storage_failure(user, &err),
        },
        Command::RemoveDestination(id) => match app.store.remove_destination(user, ChatRef(id)) {
            Ok(true) => format!("✅ Destination {id} removed."),
            Ok(false) => format!("ℹ️ Destination {id} was not configured."),
            Err(err) => storage_failure(user, &err),
        },
        Command::Destinations => match app.store.get(user) {
            Ok(config) if config.destination_chats.is_empty() => {
                "No destination chats configured. Use /add_destination <chat_id>.".to_string()
            }
            Ok(config) => {
                let list: Vec<String> = config
                    .destination_chats
                    .iter()
                    .map(|c| format!("  • {c}"))
                    .collect();
                format!("Destination chats:\n{}", list.join("\n"))
            }
            Err(err) => storage_failure(user, &err),
        },
        Command::Sources => match app.store.get(user) {
            Ok(config) => {
                let source = config
                    .source_chat
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "not set".to_string());
                let private = if config.private_sources.is_empty() {
                    "none".to_string()
                } else {
                    config
                        .private_sources
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!("Source chat: {source}\nPrivate sources: {private}")
            }
            Err(err) => storage_failure(user, &err),
        },
        Command::AddSession => wizard_reply(&app.wizard.start(user).await),
        Command::Cancel => wizard_reply(&app.wizard.cancel(user).await),
        Command::AddPrivateSource(id) => match app.store.get(user) {
            Ok(config) if config.credential.is_none() => {
                "You need a linked account first. Start with /add_session.".to_string()
            }
            Ok(_) => match app.store.add_private_source(user, ChatRef(id)) {
                Ok(true) => format!("✅ Private source {id} added."),
                Ok(false) => format!("ℹ️ Private source {id} is already configured."),
                Err(err) => storage_failure(user, &err),
            },
            Err(err) => storage_failure(user, &err),
        },
        Command::RemovePrivateSource(id) => {
            match app.store.remove_private_source(user, ChatRef(id)) {
                Ok(true) => format!("✅ Private source {id} removed."),
                Ok(false) => format!("ℹ️ Private source {id} was not configured."),
                Err(err) => storage_failure(user, &err),
            }
        }
        Command::Stats => {
            if !is_owner(&app, user) {
                "This command is restricted to the bot owner.".to_string()
            } else {
                match app.store.stats() {
                    Ok(stats) => format!(
                        "📊 Stats\nUsers: {}\nSources set: {}\nUsers with private sources: {}\n\
                         Destinations: {}\nActive listeners: {}",
                        stats.users,
                        stats.sources_set,
                        stats.users_with_private_sources,
                        stats.destinations,
                        app.listeners.active_count(),
                    ),
                    Err(err) => storage_failure(user, &err),
                }
            }
        }
        Command::Broadcast(text) => {
            if !is_owner(&app, user) {
                "This command is restricted to the bot owner.".to_string()
            } else if text.trim().is_empty() {
                "Usage: /broadcast <message>".to_string()
            } else {
                let (sent, failed) = app.relay.broadcast(text.trim()).await;
                format!("📣 Broadcast delivered to {sent} users, {failed} failed.")
            }
        }
    };

    bot.send_message(chat_id, text).await?;
    Ok(())
}

/// Plain (non-command) messages. In a private chat they feed the sign-in
/// wizard when one is active; anywhere else they are candidate source
/// messages for forwarding.
async fn message_handler(bot: Bot, msg: Message, app: App) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        let source = ChatRef(msg.chat.id.0);
        let message = MessageRef(msg.id.0);
        let relay = Arc::clone(&app.relay);
        tokio::spawn(async move {
            relay.on_source_message(source, message).await;
        });
        return Ok(());
    }

    let Some(user) = sender(&msg) else {
        return Ok(());
    };
    if !app.wizard.is_active(user).await {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let reply = app.wizard.submit(user, text).await;
    bot.send_message(msg.chat.id, wizard_reply(&reply)).await?;
    Ok(())
}

fn sender(msg: &Message) -> Option<UserId> {
    msg.from.as_ref().map(|u| UserId(u.id.0 as i64))
}

fn is_owner(app: &App, user: UserId) -> bool {
    app.owner == Some(user)
}

fn storage_failure(user: UserId, err: &crate::error::StoreError) -> String {
    tracing::error!(user_id = user.0, error = %err, "storage operation failed");
    "⚠️ Something went wrong saving your settings. Please try again.".to_string()
}

/// User-facing text for each wizard outcome.
fn wizard_reply(reply: &WizardReply) -> String {
    match reply {
        WizardReply::PhoneRequested => {
            "📱 Send your phone number in international format (e.g. +15551234567).\n\
             Use /cancel to abort."
                .to_string()
        }
        WizardReply::InvalidPhone => {
            "That doesn't look like an international number. It must start with '+'.".to_string()
        }
        WizardReply::CodeRequested(phone) => {
            format!("🔑 A sign-in code was sent to {phone}. Send it here.")
        }
        WizardReply::CodeRejected => "❌ Wrong code, try again.".to_string(),
        WizardReply::SecondFactorRequired => {
            "🔒 Your account has two-step verification. Send your password.".to_string()
        }
        WizardReply::PasswordRejected => "❌ Wrong password, try again.".to_string(),
        WizardReply::Completed => {
            "✅ Account linked. You can now add private sources with /add_private_source."
                .to_string()
        }
        WizardReply::Failed(reason) => format!("⚠️ Sign-in failed: {reason}. Start over with /add_session."),
        WizardReply::Unsupported => {
            "This deployment was built without personal-account support.".to_string()
        }
        WizardReply::NotActive => "No sign-in in progress. Start one with /add_session.".to_string(),
        WizardReply::Cancelled => "🚫 Sign-in cancelled.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let cmd = Command::parse("/set_source -1001234", "testbot").unwrap();
        assert!(matches!(cmd, Command::SetSource(-1001234)));

        let cmd = Command::parse("/broadcast maintenance tonight", "testbot").unwrap();
        assert!(matches!(cmd, Command::Broadcast(text) if text == "maintenance tonight"));

        assert!(Command::parse("/set_source not-a-number", "testbot").is_err());
    }
}
