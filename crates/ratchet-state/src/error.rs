//! Error types for ratchet-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Filesystem error while opening a file-backed store
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("version not found: {id}")]
    VersionNotFound { id: String },

    #[error("version already archived: {id}")]
    DuplicateVersion { id: String },

    #[error("parent version not found: {id}")]
    ParentNotFound { id: String },

    #[error("proposal not found: {id}")]
    ProposalNotFound { id: String },

    #[error("proposal already recorded: {id}")]
    DuplicateProposal { id: String },

    #[error("proposal {id} cannot be disposed: {reason}")]
    InvalidDisposition { id: String, reason: String },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
