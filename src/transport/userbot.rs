//! Personal-account transport backed by MTProto (`userbot` feature).
//!
//! Credentials are the serialized session bytes, base64-encoded. They are
//! opaque to the rest of the crate.

use crate::error::TransportError;
use crate::transport::{
    InboundMessage, PendingLogin, SecondaryConnection, SecondaryConnector, SignInStep,
};
use crate::types::{ChatRef, Credential, MessageRef};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use grammers_client::types::{LoginToken, PasswordToken};
use grammers_client::{Client, Config, InitParams, InvocationError, SignInError, Update};
use grammers_session::{PackedChat, PackedType, Session};

/// RPC error names that mean the stored session is gone for good.
const REVOKED_NAMES: [&str; 3] = [
    "SESSION_REVOKED",
    "AUTH_KEY_UNREGISTERED",
    "USER_DEACTIVATED",
];

pub struct GrammersConnector {
    api_id: i32,
    api_hash: String,
}

impl GrammersConnector {
    pub fn new(api_id: i32, api_hash: String) -> Self {
        Self { api_id, api_hash }
    }

    async fn connect_with(&self, session: Session) -> Result<Client, TransportError> {
        Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| TransportError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl SecondaryConnector for GrammersConnector {
    async fn begin_login(&self, phone: &str) -> Result<Box<dyn PendingLogin>, TransportError> {
        let client = self.connect_with(Session::new()).await?;
        let token = client
            .request_login_code(phone)
            .await
            .map_err(map_invocation)?;
        Ok(Box::new(GrammersLogin {
            client,
            token,
            password_token: None,
        }))
    }

    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn SecondaryConnection>, TransportError> {
        let session = decode_session(credential)?;
        let client = self.connect_with(session).await?;
        Ok(Box::new(GrammersConnection {
            client: Some(client),
        }))
    }
}

struct GrammersLogin {
    client: Client,
    token: LoginToken,
    password_token: Option<PasswordToken>,
}

#[async_trait]
impl PendingLogin for GrammersLogin {
    async fn submit_code(&mut self, code: &str) -> Result<SignInStep, TransportError> {
        match self.client.sign_in(&self.token, code).await {
            Ok(_user) => Ok(SignInStep::Authorized(export_credential(&self.client)?)),
            Err(SignInError::PasswordRequired(token)) => {
                self.password_token = Some(token);
                Ok(SignInStep::SecondFactorRequired)
            }
            Err(SignInError::InvalidCode) => Err(TransportError::CodeRejected),
            Err(err) => Err(TransportError::Rpc(err.to_string())),
        }
    }

    async fn submit_password(&mut self, password: &str) -> Result<Credential, TransportError> {
        let Some(token) = self.password_token.take() else {
            return Err(TransportError::Rpc(
                "no second factor was requested".to_string(),
            ));
        };
        match self.client.check_password(token, password).await {
            Ok(_user) => export_credential(&self.client),
            // check_password consumes the token; a failed retry restarts the wizard.
            Err(SignInError::InvalidPassword) => Err(TransportError::PasswordRejected),
            Err(err) => Err(TransportError::Rpc(err.to_string())),
        }
    }

    async fn disconnect(self: Box<Self>) {
        drop(self);
    }
}

struct GrammersConnection {
    client: Option<Client>,
}

#[async_trait]
impl SecondaryConnection for GrammersConnection {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let Some(client) = self.client.as_ref() else {
            return Ok(None);
        };
        loop {
            match client.next_update().await {
                Ok(Update::NewMessage(message)) => {
                    return Ok(Some(InboundMessage {
                        chat: ChatRef(bot_api_id(message.chat().pack())),
                        message: MessageRef(message.id()),
                    }));
                }
                Ok(_) => continue,
                Err(err) => return Err(map_invocation(err)),
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client.take();
    }
}

/// MTProto updates carry bare peer ids. Everything else in the crate
/// speaks Bot API ids (negative for groups, -100 prefixed for channels
/// and supergroups), so normalize before the message leaves the
/// transport.
fn bot_api_id(peer: PackedChat) -> i64 {
    match peer.ty {
        PackedType::User | PackedType::Bot => peer.id,
        PackedType::Chat => -peer.id,
        PackedType::Megagroup | PackedType::Broadcast | PackedType::Gigagroup => {
            -1_000_000_000_000 - peer.id
        }
    }
}

fn export_credential(client: &Client) -> Result<Credential, TransportError> {
    Ok(Credential(BASE64.encode(client.session().save())))
}

fn decode_session(credential: &Credential) -> Result<Session, TransportError> {
    let bytes = BASE64
        .decode(&credential.0)
        .map_err(|_| TransportError::CredentialRevoked)?;
    Session::load(&bytes).map_err(|_| TransportError::CredentialRevoked)
}

fn map_invocation(err: InvocationError) -> TransportError {
    match &err {
        InvocationError::Rpc(rpc) if REVOKED_NAMES.contains(&rpc.name.as_str()) => {
            TransportError::CredentialRevoked
        }
        InvocationError::Rpc(rpc) if rpc.name.starts_with("PHONE_NUMBER_") => {
            TransportError::InvalidPhone
        }
        _ => TransportError::Rpc(err.to_string()),
    }
}
