//! Authentication wizard - phone → code → second factor.
//!
//! One in-memory session per user mid-wizard, held in a keyed registry.
//! A session's state is *taken out* of its registry entry while a step
//! runs, so users never serialize on each other and a user can never have
//! two steps in flight. Each session carries a generation stamp: a step
//! that finishes after the wizard was restarted or cancelled finds a
//! different (or no) generation in the registry and tears its own
//! connection down instead of resurrecting stale state. Sessions are
//! never persisted: a restart mid-wizard means the user starts over.
//!
//! The pending login owns the transient connection; every exit path
//! (success, fatal error, cancellation, replacement) disconnects it.

use crate::error::TransportError;
use crate::listener::ListenerRegistry;
use crate::store::UserStore;
use crate::transport::{PendingLogin, SecondaryConnector, SignInStep};
use crate::types::{Credential, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

enum WizardState {
    AwaitingPhone,
    AwaitingCode {
        phone: String,
        login: Box<dyn PendingLogin>,
    },
    AwaitingSecondFactor {
        phone: String,
        login: Box<dyn PendingLogin>,
    },
}

struct Session {
    generation: u64,
    /// Taken while a step is in flight.
    state: Option<WizardState>,
}

/// What the command layer should tell the user after a wizard step.
#[derive(Debug, PartialEq, Eq)]
pub enum WizardReply {
    /// Wizard started; waiting for a phone number.
    PhoneRequested,
    /// Input did not look like an international number; still waiting.
    InvalidPhone,
    /// Code sent to the given number; waiting for it.
    CodeRequested(String),
    /// Wrong code; the user may retry in place.
    CodeRejected,
    /// Account has two-step verification; waiting for the password.
    SecondFactorRequired,
    /// Wrong password; the user may retry in place.
    PasswordRejected,
    /// Credential exported, persisted, and the listener (re)started.
    Completed,
    /// Wizard aborted; the session is gone.
    Failed(String),
    /// This build has no secondary-session support.
    Unsupported,
    /// No wizard in progress for this user.
    NotActive,
    Cancelled,
}

/// Keyed registry of in-flight authentication sessions.
pub struct SessionWizard {
    connector: Arc<dyn SecondaryConnector>,
    store: UserStore,
    listeners: Arc<ListenerRegistry>,
    sessions: Mutex<HashMap<UserId, Session>>,
    next_generation: AtomicU64,
}

impl SessionWizard {
    pub fn new(
        connector: Arc<dyn SecondaryConnector>,
        store: UserStore,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            connector,
            store,
            listeners,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Whether `user` is mid-wizard (the command layer routes plain text
    /// here only when this holds).
    pub async fn is_active(&self, user: UserId) -> bool {
        self.sessions.lock().await.contains_key(&user)
    }

    /// Begin (or restart) the wizard, replacing any in-flight session.
    pub async fn start(&self, user: UserId) -> WizardReply {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.sessions.lock().await.insert(
            user,
            Session {
                generation,
                state: Some(WizardState::AwaitingPhone),
            },
        );
        // A step still in flight for the old generation tears its own
        // connection down when it fails to restore.
        teardown(previous.and_then(|session| session.state)).await;
        tracing::info!(user_id = user.0, "session wizard started");
        WizardReply::PhoneRequested
    }

    /// Cancel any in-flight session, tearing its connection down.
    pub async fn cancel(&self, user: UserId) -> WizardReply {
        match self.sessions.lock().await.remove(&user) {
            Some(session) => {
                teardown(session.state).await;
                tracing::info!(user_id = user.0, "session wizard cancelled");
                WizardReply::Cancelled
            }
            None => WizardReply::NotActive,
        }
    }

    /// Feed one line of user input to whichever state is active.
    pub async fn submit(&self, user: UserId, text: &str) -> WizardReply {
        let (generation, state) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&user) else {
                return WizardReply::NotActive;
            };
            // state is None while another step runs for this user.
            let Some(state) = session.state.take() else {
                return WizardReply::NotActive;
            };
            (session.generation, state)
        };

        match state {
            WizardState::AwaitingPhone => self.submit_phone(user, generation, text.trim()).await,
            WizardState::AwaitingCode { phone, login } => {
                self.submit_code(user, generation, phone, login, text.trim())
                    .await
            }
            WizardState::AwaitingSecondFactor { phone, login } => {
                self.submit_password(user, generation, phone, login, text.trim())
                    .await
            }
        }
    }

    async fn submit_phone(&self, user: UserId, generation: u64, phone: &str) -> WizardReply {
        if !phone.starts_with('+') {
            // Config error, not a transport one: stay in AwaitingPhone.
            self.restore(user, generation, WizardState::AwaitingPhone)
                .await;
            return WizardReply::InvalidPhone;
        }

        match self.connector.begin_login(phone).await {
            Ok(login) => {
                let accepted = self
                    .restore(
                        user,
                        generation,
                        WizardState::AwaitingCode {
                            phone: phone.to_string(),
                            login,
                        },
                    )
                    .await;
                if accepted {
                    WizardReply::CodeRequested(phone.to_string())
                } else {
                    WizardReply::Cancelled
                }
            }
            Err(TransportError::Unsupported) => {
                self.finish(user, generation).await;
                WizardReply::Unsupported
            }
            Err(err) => {
                tracing::warn!(user_id = user.0, error = %err, "login request failed");
                self.finish(user, generation).await;
                WizardReply::Failed(err.to_string())
            }
        }
    }

    async fn submit_code(
        &self,
        user: UserId,
        generation: u64,
        phone: String,
        mut login: Box<dyn PendingLogin>,
        code: &str,
    ) -> WizardReply {
        match login.submit_code(code).await {
            Ok(SignInStep::Authorized(credential)) => {
                login.disconnect().await;
                self.finish(user, generation).await;
                self.complete(user, credential).await
            }
            Ok(SignInStep::SecondFactorRequired) => {
                let accepted = self
                    .restore(
                        user,
                        generation,
                        WizardState::AwaitingSecondFactor { phone, login },
                    )
                    .await;
                if accepted {
                    WizardReply::SecondFactorRequired
                } else {
                    WizardReply::Cancelled
                }
            }
            Err(TransportError::CodeRejected) => {
                // Recoverably wrong: keep the session, let the user retry.
                let accepted = self
                    .restore(user, generation, WizardState::AwaitingCode { phone, login })
                    .await;
                if accepted {
                    WizardReply::CodeRejected
                } else {
                    WizardReply::Cancelled
                }
            }
            Err(err) => {
                tracing::warn!(user_id = user.0, error = %err, "sign-in failed");
                login.disconnect().await;
                self.finish(user, generation).await;
                WizardReply::Failed(err.to_string())
            }
        }
    }

    async fn submit_password(
        &self,
        user: UserId,
        generation: u64,
        phone: String,
        mut login: Box<dyn PendingLogin>,
        password: &str,
    ) -> WizardReply {
        match login.submit_password(password).await {
            Ok(credential) => {
                login.disconnect().await;
                self.finish(user, generation).await;
                self.complete(user, credential).await
            }
            Err(TransportError::PasswordRejected) => {
                let accepted = self
                    .restore(
                        user,
                        generation,
                        WizardState::AwaitingSecondFactor { phone, login },
                    )
                    .await;
                if accepted {
                    WizardReply::PasswordRejected
                } else {
                    WizardReply::Cancelled
                }
            }
            Err(err) => {
                tracing::warn!(user_id = user.0, error = %err, "second-factor check failed");
                login.disconnect().await;
                self.finish(user, generation).await;
                WizardReply::Failed(err.to_string())
            }
        }
    }

    /// Put a step's state back into its registry entry.
    ///
    /// Returns false when the wizard was restarted or cancelled while the
    /// step ran; the stale state (and its connection) is torn down and the
    /// newer session is left untouched.
    async fn restore(&self, user: UserId, generation: u64, state: WizardState) -> bool {
        let stale = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&user) {
                Some(session) if session.generation == generation => {
                    session.state = Some(state);
                    None
                }
                _ => Some(state),
            }
        };
        match stale {
            None => true,
            Some(state) => {
                teardown(Some(state)).await;
                false
            }
        }
    }

    /// Remove a terminal session, unless a newer one replaced it mid-step.
    async fn finish(&self, user: UserId, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(&user)
            .is_some_and(|session| session.generation == generation)
        {
            sessions.remove(&user);
        }
    }

    /// Persist the credential and (re)start the listener before reporting
    /// the wizard complete.
    async fn complete(&self, user: UserId, credential: Credential) -> WizardReply {
        if let Err(err) = self.store.set_credential(user, credential.clone()) {
            tracing::error!(user_id = user.0, error = %err, "failed to persist credential");
            return WizardReply::Failed("could not save the session".to_string());
        }

        if let Err(err) = self.listeners.start_or_restart(user, credential).await {
            // Credential is saved; reconciliation will retry the listener.
            tracing::warn!(user_id = user.0, error = %err, "listener start after sign-in failed");
        }

        tracing::info!(user_id = user.0, "session wizard completed");
        WizardReply::Completed
    }
}

async fn teardown(state: Option<WizardState>) {
    match state {
        Some(WizardState::AwaitingCode { login, .. })
        | Some(WizardState::AwaitingSecondFactor { login, .. }) => login.disconnect().await,
        _ => {}
    }
}
