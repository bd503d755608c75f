//! User store - durable per-user configuration documents.
//!
//! One redb table keyed by user id, holding JSON-encoded [`UserConfig`]
//! documents. Every mutation runs read-modify-write inside a single write
//! transaction; redb serializes writers, which gives the atomic
//! set / add-to-set / remove-from-set semantics the rest of the system
//! relies on. No caller ever mutates a document in application memory.

use crate::error::StoreError;
use crate::types::{ChatRef, Credential, UserConfig, UserId};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const USERS: TableDefinition<'static, i64, &'static [u8]> = TableDefinition::new("users");

/// Aggregate counters for the owner's /stats command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub users: usize,
    pub sources_set: usize,
    pub users_with_private_sources: usize,
    pub destinations: usize,
}

/// redb-backed store of [`UserConfig`] documents.
#[derive(Debug, Clone)]
pub struct UserStore {
    db: Arc<Database>,
}

impl UserStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let db = Database::create(path).map_err(StoreError::Database)?;
        Self::new(Arc::new(db))
    }

    /// Wrap an existing database handle, creating the table if needed.
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(USERS)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Fetch a user's document, creating and persisting empty defaults if absent.
    pub fn get(&self, user: UserId) -> Result<UserConfig, StoreError> {
        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(USERS)?;
            if let Some(value) = table.get(user.0)? {
                return Ok(serde_json::from_slice(value.value())?);
            }
        }

        let config = UserConfig::new(user);
        self.put(&config)?;
        Ok(config)
    }

    fn put(&self, config: &UserConfig) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(config)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            table.insert(config.user_id.0, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Apply a mutation to a user's document atomically.
    ///
    /// The document is read, updated, and written back inside one write
    /// transaction; absent documents start from empty defaults (upsert).
    fn update<F, T>(&self, user: UserId, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut UserConfig) -> T,
    {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(USERS)?;
            let mut config = match table.get(user.0)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => UserConfig::new(user),
            };
            let result = mutate(&mut config);
            let bytes = serde_json::to_vec(&config)?;
            table.insert(user.0, bytes.as_slice())?;
            result
        };
        write_txn.commit()?;
        Ok(result)
    }

    pub fn set_source(&self, user: UserId, chat: ChatRef) -> Result<(), StoreError> {
        self.update(user, |config| config.source_chat = Some(chat))
    }

    pub fn clear_source(&self, user: UserId) -> Result<(), StoreError> {
        self.update(user, |config| config.source_chat = None)
    }

    /// Add a destination chat. Returns false if it was already present.
    pub fn add_destination(&self, user: UserId, chat: ChatRef) -> Result<bool, StoreError> {
        self.update(user, |config| {
            if config.destination_chats.contains(&chat) {
                false
            } else {
                config.destination_chats.push(chat);
                true
            }
        })
    }

    /// Remove a destination chat. Returns false if it was not present.
    pub fn remove_destination(&self, user: UserId, chat: ChatRef) -> Result<bool, StoreError> {
        self.update(user, |config| {
            let before = config.destination_chats.len();
            config.destination_chats.retain(|c| *c != chat);
            config.destination_chats.len() != before
        })
    }

    /// Add a private source chat. Returns false if it was already present.
    pub fn add_private_source(&self, user: UserId, chat: ChatRef) -> Result<bool, StoreError> {
        self.update(user, |config| {
            if config.private_sources.contains(&chat) {
                false
            } else {
                config.private_sources.push(chat);
                true
            }
        })
    }

    /// Remove a private source chat. Returns false if it was not present.
    pub fn remove_private_source(&self, user: UserId, chat: ChatRef) -> Result<bool, StoreError> {
        self.update(user, |config| {
            let before = config.private_sources.len();
            config.private_sources.retain(|c| *c != chat);
            config.private_sources.len() != before
        })
    }

    pub fn set_credential(&self, user: UserId, credential: Credential) -> Result<(), StoreError> {
        self.update(user, |config| config.credential = Some(credential))
    }

    pub fn clear_credential(&self, user: UserId) -> Result<(), StoreError> {
        self.update(user, |config| config.credential = None)
    }

    /// All users whose public source is `chat` (the dispatcher's fan-out query).
    pub fn find_by_source(&self, chat: ChatRef) -> Result<Vec<UserConfig>, StoreError> {
        self.scan(|config| config.source_chat == Some(chat))
    }

    /// All users holding a secondary credential (the reconciliation query).
    pub fn users_with_credential(&self) -> Result<Vec<UserConfig>, StoreError> {
        self.scan(|config| config.credential.is_some())
    }

    /// Every known user id (broadcast enumeration).
    pub fn all_users(&self) -> Result<Vec<UserId>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut users = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            users.push(UserId(key.value()));
        }
        Ok(users)
    }

    fn scan<F>(&self, keep: F) -> Result<Vec<UserConfig>, StoreError>
    where
        F: Fn(&UserConfig) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut matches = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let config: UserConfig = serde_json::from_slice(value.value())?;
            if keep(&config) {
                matches.push(config);
            }
        }
        Ok(matches)
    }

    /// Aggregate counters over all documents.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let users = table.len()? as usize;
        let mut sources_set = 0;
        let mut users_with_private_sources = 0;
        let mut destinations = 0;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let config: UserConfig = serde_json::from_slice(value.value())?;
            if config.source_chat.is_some() {
                sources_set += 1;
            }
            if !config.private_sources.is_empty() {
                users_with_private_sources += 1;
            }
            destinations += config.destination_chats.len();
        }

        Ok(StoreStats {
            users,
            sources_set,
            users_with_private_sources,
            destinations,
        })
    }
}
