//! Shared identifier types and the per-user configuration document.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of an end user of the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a chat (channel, group, or private chat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef(pub i64);

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to a message within its chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub i32);

/// Durable, opaque secondary-session token.
///
/// Treated as an unparsed blob everywhere; only the transport that produced
/// it knows how to turn it back into a live connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(pub String);

impl fmt::Debug for Credential {
    // Never log the token itself.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Per-user configuration document, owned by the store.
///
/// `destination_chats` and `private_sources` have set semantics: the store's
/// add/remove operations keep them duplicate-free, order is irrelevant.
/// A `private_sources` entry without a `credential` is tolerated (the
/// listener is simply absent) and repaired on the next wizard run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: UserId,
    #[serde(default)]
    pub source_chat: Option<ChatRef>,
    #[serde(default)]
    pub destination_chats: Vec<ChatRef>,
    #[serde(default)]
    pub private_sources: Vec<ChatRef>,
    #[serde(default)]
    pub credential: Option<Credential>,
}

impl UserConfig {
    /// Empty defaults for a user seen for the first time.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            source_chat: None,
            destination_chats: Vec::new(),
            private_sources: Vec::new(),
            credential: None,
        }
    }
}
