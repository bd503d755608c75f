//! Secondary-listener registry and supervisor.
//!
//! One listener per user with private-source forwarding enabled: a live
//! user-identity connection plus a background task relaying messages from
//! that user's private sources through the bot transport. Start/stop for
//! the same user is serialized by a per-user lock so there are never two
//! connections racing on one credential; different users never wait on
//! each other.

use crate::error::TransportError;
use crate::relay::Relay;
use crate::store::UserStore;
use crate::transport::{InboundMessage, SecondaryConnection, SecondaryConnector};
use crate::types::{Credential, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Backoff between reconnection attempts after a transient failure.
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

struct ListenerHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of running secondary listeners.
pub struct ListenerRegistry {
    connector: Arc<dyn SecondaryConnector>,
    relay: Arc<Relay>,
    store: UserStore,
    listeners: Mutex<HashMap<UserId, ListenerHandle>>,
    start_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(
        connector: Arc<dyn SecondaryConnector>,
        relay: Arc<Relay>,
        store: UserStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            relay,
            store,
            listeners: Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    fn user_lock(&self, user: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock().unwrap();
        Arc::clone(locks.entry(user).or_default())
    }

    /// Number of currently running listeners.
    pub fn active_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Start a listener for `user`, fully stopping any existing one first.
    pub async fn start_or_restart(
        self: &Arc<Self>,
        user: UserId,
        credential: Credential,
    ) -> Result<(), TransportError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        self.stop_current(user).await;

        let connection = self.connector.connect(&credential).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(self).run(
            user,
            credential,
            connection,
            cancel.clone(),
            generation,
        ));

        self.listeners.lock().unwrap().insert(
            user,
            ListenerHandle {
                generation,
                cancel,
                task,
            },
        );
        tracing::info!(user_id = user.0, "secondary listener started");
        Ok(())
    }

    /// Stop the listener for `user`, if any.
    pub async fn stop(&self, user: UserId) {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;
        self.stop_current(user).await;
    }

    /// Stop every listener. Used on process shutdown.
    pub async fn shutdown(&self) {
        let users: Vec<UserId> = self.listeners.lock().unwrap().keys().copied().collect();
        for user in users {
            self.stop(user).await;
        }
    }

    /// Start listeners for every persisted user holding a credential.
    ///
    /// Starts run concurrently; one user's connection failing neither blocks
    /// nor delays the others.
    pub async fn reconcile(self: &Arc<Self>) {
        let users = match self.store.users_with_credential() {
            Ok(users) => users,
            Err(err) => {
                tracing::error!(error = %err, "reconciliation query failed");
                return;
            }
        };

        let mut tasks = Vec::with_capacity(users.len());
        for config in users {
            let Some(credential) = config.credential else {
                continue;
            };
            let registry = Arc::clone(self);
            let user = config.user_id;
            tasks.push(tokio::spawn(async move {
                if let Err(err) = registry.start_or_restart(user, credential).await {
                    tracing::warn!(user_id = user.0, error = %err, "listener start failed during reconciliation");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    // Caller must hold the user's start lock.
    async fn stop_current(&self, user: UserId) {
        let handle = self.listeners.lock().unwrap().remove(&user);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
            tracing::info!(user_id = user.0, "secondary listener stopped");
        }
    }

    async fn run(
        self: Arc<Self>,
        user: UserId,
        credential: Credential,
        mut connection: Box<dyn SecondaryConnection>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    connection.disconnect().await;
                    break;
                }
                next = connection.next_message() => match next {
                    Ok(Some(message)) => self.deliver(user, message).await,
                    Ok(None) => {
                        tracing::info!(user_id = user.0, "secondary connection closed");
                        break;
                    }
                    Err(TransportError::CredentialRevoked) => {
                        connection.disconnect().await;
                        self.credential_revoked(user).await;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(user_id = user.0, error = %err, "secondary connection failed, reconnecting");
                        connection.disconnect().await;
                        match self.reconnect(user, &credential, &cancel).await {
                            Some(new_connection) => connection = new_connection,
                            None => break,
                        }
                    }
                }
            }
        }
        self.deregister(user, generation);
    }

    /// Relay one observed message if it comes from a recognized private
    /// source. The user's config is re-fetched at delivery time, never
    /// snapshotted at listener start, so edits take effect immediately.
    async fn deliver(&self, user: UserId, message: InboundMessage) {
        let config = match self.store.get(user) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(user_id = user.0, error = %err, "config lookup failed, dropping message");
                return;
            }
        };

        if !config.private_sources.contains(&message.chat) {
            return;
        }

        self.relay
            .relay_for_user(user, config.destination_chats, message.chat, message.message)
            .await;
    }

    async fn reconnect(
        &self,
        user: UserId,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn SecondaryConnection>> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(RECONNECT_BACKOFF) => {}
            }

            match self.connector.connect(credential).await {
                Ok(connection) => {
                    tracing::info!(user_id = user.0, "secondary connection re-established");
                    return Some(connection);
                }
                Err(TransportError::CredentialRevoked) => {
                    self.credential_revoked(user).await;
                    return None;
                }
                Err(err) => {
                    tracing::warn!(user_id = user.0, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    /// Terminal for this user's listener only: drop the dead credential so
    /// reconciliation stops retrying it, and tell the user once.
    async fn credential_revoked(&self, user: UserId) {
        tracing::warn!(user_id = user.0, "secondary credential revoked");
        if let Err(err) = self.store.clear_credential(user) {
            tracing::error!(user_id = user.0, error = %err, "failed to clear revoked credential");
        }
        self.relay
            .notify_user(
                user,
                "⚠️ Your account session was revoked. Private-source forwarding is paused; use /add_session to sign in again.",
            )
            .await;
    }

    fn deregister(&self, user: UserId, generation: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners
            .get(&user)
            .is_some_and(|handle| handle.generation == generation)
        {
            listeners.remove(&user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{FakeBotTransport, FakeConnection, FakeConnector};
    use crate::types::{ChatRef, MessageRef};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: UserStore,
        transport: Arc<FakeBotTransport>,
        connector: Arc<FakeConnector>,
        registry: Arc<ListenerRegistry>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = UserStore::open(&dir.path().join("test.redb")).unwrap();
        let transport = FakeBotTransport::new();
        let connector = FakeConnector::new();
        let relay = Relay::new(
            Arc::clone(&transport) as Arc<dyn crate::transport::BotTransport>,
            store.clone(),
        );
        let registry = ListenerRegistry::new(
            Arc::clone(&connector) as Arc<dyn SecondaryConnector>,
            relay,
            store.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            transport,
            connector,
            registry,
        }
    }

    // Poll window must comfortably exceed RECONNECT_BACKOFF.
    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..800 {
            if check() {
                return;
            }
            sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn cred(tag: &str) -> Credential {
        Credential(tag.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_leaves_one_listener_and_closes_old_connection() {
        let fx = fixture();
        let (conn1, _feed1, closed1) = FakeConnection::new();
        let (conn2, _feed2, closed2) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn1));
        fx.connector.push_connection(Ok(conn2));

        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();
        fx.registry
            .start_or_restart(UserId(7), cred("b"))
            .await
            .unwrap();

        assert_eq!(fx.registry.active_count(), 1);
        assert!(closed1.load(Ordering::SeqCst));
        assert!(!closed2.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_source_message_is_relayed_via_bot_transport() {
        let fx = fixture();
        fx.store.add_private_source(UserId(7), ChatRef(-500)).unwrap();
        fx.store.add_destination(UserId(7), ChatRef(-1)).unwrap();
        fx.store.add_destination(UserId(7), ChatRef(-2)).unwrap();

        let (conn, feed, _closed) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn));
        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();

        feed.send(Ok(InboundMessage {
            chat: ChatRef(-500),
            message: MessageRef(11),
        }))
        .unwrap();

        let transport = Arc::clone(&fx.transport);
        wait_until(move || {
            transport.copy_count(ChatRef(-1)) == 1 && transport.copy_count(ChatRef(-2)) == 1
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_from_unrecognized_chat_is_ignored() {
        let fx = fixture();
        fx.store.add_private_source(UserId(7), ChatRef(-500)).unwrap();
        fx.store.add_destination(UserId(7), ChatRef(-1)).unwrap();

        let (conn, feed, _closed) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn));
        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();

        feed.send(Ok(InboundMessage {
            chat: ChatRef(-999),
            message: MessageRef(11),
        }))
        .unwrap();
        // Marker message from the real source proves the first was processed.
        feed.send(Ok(InboundMessage {
            chat: ChatRef(-500),
            message: MessageRef(12),
        }))
        .unwrap();

        let transport = Arc::clone(&fx.transport);
        wait_until(move || transport.copy_count(ChatRef(-1)) == 1).await;
        assert_eq!(fx.transport.copy_count(ChatRef(-1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_edits_apply_at_delivery_time() {
        let fx = fixture();
        fx.store.add_private_source(UserId(7), ChatRef(-500)).unwrap();
        fx.store.add_destination(UserId(7), ChatRef(-1)).unwrap();

        let (conn, feed, _closed) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn));
        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();

        feed.send(Ok(InboundMessage {
            chat: ChatRef(-500),
            message: MessageRef(1),
        }))
        .unwrap();
        let transport = Arc::clone(&fx.transport);
        wait_until(move || transport.copy_count(ChatRef(-1)) == 1).await;

        // Edited while the listener is running; no restart required.
        fx.store.add_destination(UserId(7), ChatRef(-2)).unwrap();
        feed.send(Ok(InboundMessage {
            chat: ChatRef(-500),
            message: MessageRef(2),
        }))
        .unwrap();

        let transport = Arc::clone(&fx.transport);
        wait_until(move || transport.copy_count(ChatRef(-2)) == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_credential_clears_store_and_notifies_user() {
        let fx = fixture();
        fx.store.set_credential(UserId(7), cred("a")).unwrap();

        let (conn, feed, _closed) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn));
        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();

        feed.send(Err(TransportError::CredentialRevoked)).unwrap();

        let store = fx.store.clone();
        wait_until(move || store.get(UserId(7)).unwrap().credential.is_none()).await;
        let registry = Arc::clone(&fx.registry);
        wait_until(move || registry.active_count() == 0).await;
        assert_eq!(fx.transport.sent_to(ChatRef(7)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_reconnects() {
        let fx = fixture();
        let (conn1, feed1, _closed1) = FakeConnection::new();
        let (conn2, feed2, _closed2) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn1));
        fx.connector.push_connection(Ok(conn2));

        fx.store.add_private_source(UserId(7), ChatRef(-500)).unwrap();
        fx.store.add_destination(UserId(7), ChatRef(-1)).unwrap();

        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();

        feed1
            .send(Err(TransportError::Rpc("connection reset".into())))
            .unwrap();

        let connector = Arc::clone(&fx.connector);
        wait_until(move || connector.connect_credentials().len() == 2).await;

        // The replacement connection is live.
        feed2
            .send(Ok(InboundMessage {
                chat: ChatRef(-500),
                message: MessageRef(5),
            }))
            .unwrap();
        let transport = Arc::clone(&fx.transport);
        wait_until(move || transport.copy_count(ChatRef(-1)) == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_disconnects() {
        let fx = fixture();
        let (conn, _feed, closed) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn));

        fx.registry
            .start_or_restart(UserId(7), cred("a"))
            .await
            .unwrap();
        fx.registry.stop(UserId(7)).await;

        assert_eq!(fx.registry.active_count(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_starts_only_credentialed_users() {
        let fx = fixture();
        fx.store.set_credential(UserId(1), cred("a")).unwrap();
        fx.store.set_credential(UserId(2), cred("b")).unwrap();
        fx.store.set_credential(UserId(3), cred("c")).unwrap();
        fx.store.get(UserId(4)).unwrap(); // no credential

        // One of the three fails to connect; the others still come up.
        let (conn1, _feed1, _c1) = FakeConnection::new();
        let (conn2, _feed2, _c2) = FakeConnection::new();
        fx.connector.push_connection(Ok(conn1));
        fx.connector
            .push_connection(Err(TransportError::Rpc("unreachable".into())));
        fx.connector.push_connection(Ok(conn2));

        fx.registry.reconcile().await;

        assert_eq!(fx.connector.connect_credentials().len(), 3);
        assert_eq!(fx.registry.active_count(), 2);
    }
}
