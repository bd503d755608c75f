//! Telegram bot transport implementation.
//!
//! Maps teloxide request errors onto [`SendOutcome`] so the relay never has
//! to inspect API errors itself: `RetryAfter` becomes a rate-limit cooldown,
//! blocked/permission errors become permanent rejections, everything else
//! is transient.

use super::{BotTransport, SendOutcome};
use crate::types::{ChatRef, MessageRef};
use async_trait::async_trait;
use teloxide::payloads::CopyMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId};
use teloxide::{ApiError, RequestError};

/// Bot-identity transport backed by the Telegram Bot API.
pub struct TelegramBotTransport {
    bot: Bot,
}

impl TelegramBotTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl BotTransport for TelegramBotTransport {
    async fn copy_message(
        &self,
        dest: ChatRef,
        from: ChatRef,
        message: MessageRef,
    ) -> SendOutcome {
        let result = self
            .bot
            .copy_message(ChatId(dest.0), ChatId(from.0), MessageId(message.0))
            .disable_notification(true)
            .await;

        match result {
            Ok(_) => SendOutcome::Delivered,
            Err(err) => outcome_from_error(err),
        }
    }

    async fn send_text(&self, chat: ChatRef, text: &str) -> SendOutcome {
        match self.bot.send_message(ChatId(chat.0), text).await {
            Ok(_) => SendOutcome::Delivered,
            Err(err) => outcome_from_error(err),
        }
    }
}

/// Classify a teloxide error into a send outcome.
fn outcome_from_error(error: RequestError) -> SendOutcome {
    match error {
        RequestError::RetryAfter(wait) => SendOutcome::RateLimited(wait.duration()),
        RequestError::Api(api_error) if is_permanent(&api_error) => {
            SendOutcome::Forbidden(api_error.to_string())
        }
        other => SendOutcome::Transient(other.to_string()),
    }
}

/// API errors that no amount of retrying will fix.
fn is_permanent(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::GroupDeactivated
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::NotEnoughRightsToPostMessages
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_after_maps_to_rate_limited() {
        let err = RequestError::RetryAfter(teloxide::types::Seconds::from_seconds(42));
        assert_eq!(
            outcome_from_error(err),
            SendOutcome::RateLimited(Duration::from_secs(42))
        );
    }

    #[test]
    fn test_blocked_maps_to_forbidden() {
        let err = RequestError::Api(ApiError::BotBlocked);
        assert!(matches!(
            outcome_from_error(err),
            SendOutcome::Forbidden(_)
        ));
    }

    #[test]
    fn test_missing_rights_maps_to_forbidden() {
        let err = RequestError::Api(ApiError::NotEnoughRightsToPostMessages);
        assert!(matches!(
            outcome_from_error(err),
            SendOutcome::Forbidden(_)
        ));
    }

    #[test]
    fn test_other_api_errors_are_transient() {
        let err = RequestError::Api(ApiError::InvalidQueryId);
        assert!(matches!(
            outcome_from_error(err),
            SendOutcome::Transient(_)
        ));
    }
}
