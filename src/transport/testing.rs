//! In-memory fake transports for tests.

use super::{
    BotTransport, InboundMessage, PendingLogin, SecondaryConnection, SecondaryConnector,
    SendOutcome, SignInStep,
};
use crate::error::TransportError;
use crate::types::{ChatRef, Credential, MessageRef};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

enum Script {
    Always(SendOutcome),
    Queue(VecDeque<SendOutcome>),
}

/// Scriptable bot transport recording every copy and send.
///
/// Chats without a script always report [`SendOutcome::Delivered`].
#[derive(Default)]
pub struct FakeBotTransport {
    scripts: Mutex<HashMap<ChatRef, Script>>,
    copies: Mutex<Vec<(ChatRef, ChatRef, MessageRef)>>,
    sends: Mutex<Vec<(ChatRef, String)>>,
}

impl FakeBotTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call targeting `chat` report `outcome`.
    pub fn always(&self, chat: ChatRef, outcome: SendOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .insert(chat, Script::Always(outcome));
    }

    /// Script one outcome per call targeting `chat`; once drained the chat
    /// reports `Delivered`.
    pub fn script(&self, chat: ChatRef, outcomes: Vec<SendOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(chat, Script::Queue(outcomes.into()));
    }

    fn next_outcome(&self, chat: ChatRef) -> SendOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&chat) {
            Some(Script::Always(outcome)) => outcome.clone(),
            Some(Script::Queue(queue)) => queue.pop_front().unwrap_or(SendOutcome::Delivered),
            None => SendOutcome::Delivered,
        }
    }

    /// Number of copy calls targeting `dest`.
    pub fn copy_count(&self, dest: ChatRef) -> usize {
        self.copies
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _, _)| *d == dest)
            .count()
    }

    /// Texts sent to `chat`, in call order.
    pub fn sent_to(&self, chat: ChatRef) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl BotTransport for FakeBotTransport {
    async fn copy_message(
        &self,
        dest: ChatRef,
        from: ChatRef,
        message: MessageRef,
    ) -> SendOutcome {
        self.copies.lock().unwrap().push((dest, from, message));
        self.next_outcome(dest)
    }

    async fn send_text(&self, chat: ChatRef, text: &str) -> SendOutcome {
        self.sends.lock().unwrap().push((chat, text.to_string()));
        self.next_outcome(chat)
    }
}

/// Scriptable pending login with a shared disconnect flag.
pub struct FakeLogin {
    code_results: Mutex<VecDeque<Result<SignInStep, TransportError>>>,
    password_results: Mutex<VecDeque<Result<Credential, TransportError>>>,
    code_gate: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
    disconnected: Arc<AtomicBool>,
}

impl FakeLogin {
    pub fn new() -> (Box<Self>, Arc<AtomicBool>) {
        let disconnected = Arc::new(AtomicBool::new(false));
        let login = Box::new(Self {
            code_results: Mutex::new(VecDeque::new()),
            password_results: Mutex::new(VecDeque::new()),
            code_gate: Mutex::new(None),
            disconnected: Arc::clone(&disconnected),
        });
        (login, disconnected)
    }

    pub fn on_code(&self, result: Result<SignInStep, TransportError>) {
        self.code_results.lock().unwrap().push_back(result);
    }

    pub fn on_password(&self, result: Result<Credential, TransportError>) {
        self.password_results.lock().unwrap().push_back(result);
    }

    /// Make the next `submit_code` block until the returned gate gets a
    /// permit, so a test can interleave other calls mid-step.
    pub fn hold_code(&self) -> Arc<tokio::sync::Semaphore> {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        *self.code_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl PendingLogin for FakeLogin {
    async fn submit_code(&mut self, _code: &str) -> Result<SignInStep, TransportError> {
        let gate = self.code_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        self.code_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Rpc("unscripted code submit".into())))
    }

    async fn submit_password(&mut self, _password: &str) -> Result<Credential, TransportError> {
        self.password_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Rpc(
                "unscripted password submit".into(),
            )))
    }

    async fn disconnect(self: Box<Self>) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Channel-fed secondary connection with a shared disconnect flag.
pub struct FakeConnection {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage, TransportError>>,
    disconnected: Arc<AtomicBool>,
}

/// Events pushed into a [`FakeConnection`] by a test.
pub type FakeConnectionFeed = mpsc::UnboundedSender<Result<InboundMessage, TransportError>>;

impl FakeConnection {
    /// Connection plus the sender that feeds it and its disconnect flag.
    /// Dropping the sender closes the connection in an orderly fashion.
    pub fn new() -> (Box<Self>, FakeConnectionFeed, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));
        let conn = Box::new(Self {
            rx,
            disconnected: Arc::clone(&disconnected),
        });
        (conn, tx, disconnected)
    }
}

#[async_trait]
impl SecondaryConnection for FakeConnection {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

/// Connector handing out pre-scripted logins and connections.
#[derive(Default)]
pub struct FakeConnector {
    logins: Mutex<VecDeque<Result<Box<dyn PendingLogin>, TransportError>>>,
    connections: Mutex<VecDeque<Result<Box<dyn SecondaryConnection>, TransportError>>>,
    begin_phones: Mutex<Vec<String>>,
    connect_credentials: Mutex<Vec<Credential>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_login(&self, result: Result<Box<dyn PendingLogin>, TransportError>) {
        self.logins.lock().unwrap().push_back(result);
    }

    pub fn push_connection(&self, result: Result<Box<dyn SecondaryConnection>, TransportError>) {
        self.connections.lock().unwrap().push_back(result);
    }

    /// Phone numbers passed to `begin_login`, in call order.
    pub fn begin_phones(&self) -> Vec<String> {
        self.begin_phones.lock().unwrap().clone()
    }

    /// Credentials passed to `connect`, in call order.
    pub fn connect_credentials(&self) -> Vec<Credential> {
        self.connect_credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecondaryConnector for FakeConnector {
    async fn begin_login(&self, phone: &str) -> Result<Box<dyn PendingLogin>, TransportError> {
        self.begin_phones.lock().unwrap().push(phone.to_string());
        self.logins
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Rpc("unscripted login".into())))
    }

    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn SecondaryConnection>, TransportError> {
        self.connect_credentials
            .lock()
            .unwrap()
            .push(credential.clone());
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Rpc("unscripted connection".into())))
    }
}
