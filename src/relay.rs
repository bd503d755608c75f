//! Relay dispatcher - fan-out of inbound messages to destination chats.
//!
//! All outbound traffic funnels through two bounded retry primitives:
//! [`Relay::copy_with_retry`] for message copies and
//! [`Relay::send_with_retry`] for plain text sends. Copies and sends draw
//! from separate concurrency budgets so a broadcast cannot starve
//! forwarding and vice versa. Nothing in here ever escalates a delivery
//! failure beyond its own fan-out task.

use crate::store::UserStore;
use crate::transport::{BotTransport, SendOutcome};
use crate::types::{ChatRef, MessageRef, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Simultaneous in-flight copy operations.
const COPY_PERMITS: usize = 5;
/// Simultaneous in-flight text sends.
const SEND_PERMITS: usize = 10;
/// Attempts per operation. Every sleep-then-retry consumes one.
const MAX_ATTEMPTS: u32 = 3;
/// Safety margin added to server-dictated cooldowns.
const RATE_LIMIT_MARGIN: Duration = Duration::from_secs(1);
/// Fixed backoff after a transient failure.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(1);

/// Result of a bounded delivery attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Not delivered, with a human-readable reason for the failure report.
    NotDelivered(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Shared fan-out engine for both the public-source and private-source paths.
pub struct Relay {
    transport: Arc<dyn BotTransport>,
    store: UserStore,
    copy_permits: Semaphore,
    send_permits: Semaphore,
}

impl Relay {
    pub fn new(transport: Arc<dyn BotTransport>, store: UserStore) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            copy_permits: Semaphore::new(COPY_PERMITS),
            send_permits: Semaphore::new(SEND_PERMITS),
        })
    }

    /// Copy a message into `dest`, retrying up to [`MAX_ATTEMPTS`] times.
    ///
    /// Rate limits sleep for the reported cooldown plus a margin; transient
    /// failures back off briefly; permanent rejections stop immediately.
    pub async fn copy_with_retry(
        &self,
        dest: ChatRef,
        from: ChatRef,
        message: MessageRef,
    ) -> Delivery {
        let Ok(_permit) = self.copy_permits.acquire().await else {
            return Delivery::NotDelivered("copy budget closed".to_string());
        };

        self.attempt_loop(dest, || self.transport.copy_message(dest, from, message))
            .await
    }

    /// Send a plain text message with the same retry policy, on the
    /// independent send budget.
    pub async fn send_with_retry(&self, chat: ChatRef, text: &str) -> Delivery {
        let Ok(_permit) = self.send_permits.acquire().await else {
            return Delivery::NotDelivered("send budget closed".to_string());
        };

        self.attempt_loop(chat, || self.transport.send_text(chat, text))
            .await
    }

    async fn attempt_loop<F, Fut>(&self, chat: ChatRef, mut request: F) -> Delivery
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SendOutcome>,
    {
        let mut last_reason = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match request().await {
                SendOutcome::Delivered => return Delivery::Delivered,
                SendOutcome::RateLimited(cooldown) => {
                    tracing::warn!(
                        chat_id = chat.0,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        retry_after_secs = cooldown.as_secs(),
                        "rate limited, waiting before retry"
                    );
                    last_reason = "rate limited".to_string();
                    if attempt < MAX_ATTEMPTS {
                        sleep(cooldown + RATE_LIMIT_MARGIN).await;
                    }
                }
                SendOutcome::Forbidden(reason) => {
                    tracing::info!(chat_id = chat.0, reason, "delivery permanently rejected");
                    return Delivery::NotDelivered(reason);
                }
                SendOutcome::Transient(reason) => {
                    tracing::warn!(
                        chat_id = chat.0,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        reason,
                        "transient delivery failure"
                    );
                    last_reason = reason;
                    if attempt < MAX_ATTEMPTS {
                        sleep(TRANSIENT_BACKOFF).await;
                    }
                }
            }
        }

        Delivery::NotDelivered(format!(
            "{last_reason} after {MAX_ATTEMPTS} attempts"
        ))
    }

    /// Handle "message posted in public source chat" from the bot connection.
    ///
    /// Best-effort: store failures are logged and swallowed, and no
    /// destination or user failure propagates to the caller.
    pub async fn on_source_message(self: &Arc<Self>, chat: ChatRef, message: MessageRef) {
        let users = match self.store.find_by_source(chat) {
            Ok(users) => users,
            Err(err) => {
                tracing::error!(chat_id = chat.0, error = %err, "source lookup failed, dropping message");
                return;
            }
        };

        let mut tasks = Vec::with_capacity(users.len());
        for user in users {
            let relay = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                relay
                    .relay_for_user(user.user_id, user.destination_chats, chat, message)
                    .await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Fan a message out to one user's destinations, one independent task
    /// per destination. Shared by the public path and the private-source
    /// listeners.
    pub async fn relay_for_user(
        self: &Arc<Self>,
        user: UserId,
        destinations: Vec<ChatRef>,
        from: ChatRef,
        message: MessageRef,
    ) {
        let mut tasks = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let relay = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                if let Delivery::NotDelivered(reason) =
                    relay.copy_with_retry(dest, from, message).await
                {
                    relay.notify_delivery_failure(user, dest, &reason).await;
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Best-effort failure report to the owning user. Its own failure is
    /// only logged.
    async fn notify_delivery_failure(&self, user: UserId, dest: ChatRef, reason: &str) {
        let text = format!("⚠️ Failed to forward a message to destination {dest}: {reason}");
        if let Delivery::NotDelivered(notify_reason) = self.notify_user(user, &text).await {
            tracing::warn!(
                user_id = user.0,
                dest_chat = dest.0,
                reason = notify_reason,
                "failure notification could not be delivered"
            );
        }
    }

    /// Send a message to the user's private chat with the bot.
    pub async fn notify_user(&self, user: UserId, text: &str) -> Delivery {
        self.send_with_retry(ChatRef(user.0), text).await
    }

    /// Owner broadcast to every known user. Returns (sent, failed).
    pub async fn broadcast(self: &Arc<Self>, text: &str) -> (usize, usize) {
        let users = match self.store.all_users() {
            Ok(users) => users,
            Err(err) => {
                tracing::error!(error = %err, "broadcast enumeration failed");
                return (0, 0);
            }
        };

        let mut tasks = Vec::with_capacity(users.len());
        for user in users {
            let relay = Arc::clone(self);
            let text = text.to_string();
            tasks.push(tokio::spawn(async move {
                relay.notify_user(user, &text).await.is_delivered()
            }));
        }

        let mut sent = 0;
        let mut failed = 0;
        for task in tasks {
            match task.await {
                Ok(true) => sent += 1,
                _ => failed += 1,
            }
        }
        (sent, failed)
    }
}
