//! Transport abstraction over the messaging network.
//!
//! Two independent halves:
//! - [`BotTransport`]: the bot-identity connection used for every outbound
//!   copy and send. Calls report a [`SendOutcome`] instead of raising, so
//!   the relay's retry logic is a plain branch.
//! - [`SecondaryConnector`] / [`PendingLogin`] / [`SecondaryConnection`]:
//!   user-identity sessions for observing private sources. The connector
//!   runs the phone → code → second-factor login and turns a durable
//!   [`Credential`] back into a live connection.

pub mod telegram;

#[cfg(test)]
pub mod testing;

#[cfg(feature = "userbot")]
pub mod userbot;

use crate::error::TransportError;
use crate::types::{ChatRef, Credential, MessageRef};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a single send or copy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The service asked us to back off for the given cooldown.
    RateLimited(Duration),
    /// Permanently rejected (blocked, missing rights). Not worth retrying.
    Forbidden(String),
    /// Transient failure; a retry may succeed.
    Transient(String),
}

/// A message observed by a secondary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat: ChatRef,
    pub message: MessageRef,
}

/// Outcome of submitting a verification code.
pub enum SignInStep {
    Authorized(Credential),
    SecondFactorRequired,
}

/// Bot-identity operations used by the relay.
#[async_trait]
pub trait BotTransport: Send + Sync {
    /// Copy a message into `dest` without attribution metadata.
    async fn copy_message(&self, dest: ChatRef, from: ChatRef, message: MessageRef)
        -> SendOutcome;

    /// Send a plain text message.
    async fn send_text(&self, chat: ChatRef, text: &str) -> SendOutcome;
}

/// Factory for secondary (user-identity) sessions.
#[async_trait]
pub trait SecondaryConnector: Send + Sync {
    /// Open a transient connection under the application identity (no bot
    /// token) and request a verification code for `phone`.
    async fn begin_login(&self, phone: &str) -> Result<Box<dyn PendingLogin>, TransportError>;

    /// Open a live connection from a durable credential.
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn SecondaryConnection>, TransportError>;
}

/// A login in progress; owns the transient connection.
///
/// Callers must end every login, successful or not, with [`disconnect`], so
/// the transient connection never leaks.
///
/// [`disconnect`]: PendingLogin::disconnect
#[async_trait]
pub trait PendingLogin: Send {
    /// Submit the verification code the user received.
    async fn submit_code(&mut self, code: &str) -> Result<SignInStep, TransportError>;

    /// Submit the second-factor password, completing sign-in.
    async fn submit_password(&mut self, password: &str) -> Result<Credential, TransportError>;

    /// Disconnect the transient connection.
    async fn disconnect(self: Box<Self>);
}

/// A live user-identity connection delivering inbound messages.
#[async_trait]
pub trait SecondaryConnection: Send {
    /// Next inbound message. `Ok(None)` means the connection closed in an
    /// orderly fashion; `Err(CredentialRevoked)` means the credential died.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    /// Close the connection.
    async fn disconnect(&mut self);
}

/// Connector used when the crate is built without the `userbot` feature.
///
/// Every operation reports [`TransportError::Unsupported`]; the wizard
/// surfaces that to the user and the rest of the system is unaffected.
pub struct DisabledConnector;

#[async_trait]
impl SecondaryConnector for DisabledConnector {
    async fn begin_login(&self, _phone: &str) -> Result<Box<dyn PendingLogin>, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn connect(
        &self,
        _credential: &Credential,
    ) -> Result<Box<dyn SecondaryConnection>, TransportError> {
        Err(TransportError::Unsupported)
    }
}
