//! Error types for the application.

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Errors related to the user store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table access failed: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage failure: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

/// Errors surfaced by the secondary-session transport.
///
/// Rate-limit and transient-send conditions are not errors; they are
/// `SendOutcome` variants handled by the relay's retry loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid phone number")]
    InvalidPhone,

    #[error("Verification code rejected")]
    CodeRejected,

    #[error("Second-factor password rejected")]
    PasswordRejected,

    #[error("Credential revoked or expired")]
    CredentialRevoked,

    #[error("Secondary sessions are not available in this build")]
    Unsupported,

    #[error("Transport failure: {0}")]
    Rpc(String),
}
