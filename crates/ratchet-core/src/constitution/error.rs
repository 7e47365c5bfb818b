//! Constitution error types.

use std::path::PathBuf;

use ratchet_state::StorageError;
use thiserror::Error;

use crate::domain::RatchetError;

#[derive(Debug, Error)]
pub enum ConstitutionError {
    #[error("failed to read constitution {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse constitution: {0}")]
    Parse(String),

    #[error("constitution has no integrity digest; seal it first")]
    MissingIntegrity,

    #[error("constitution integrity mismatch: document says {expected}, content hashes to {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("constitution digest {actual} does not match pinned digest {expected}")]
    PinnedDigestMismatch { expected: String, actual: String },

    #[error("invalid constraint {id}: {reason}")]
    InvalidConstraint { id: String, reason: String },

    #[error("constraint {id} has invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        id: String,
        pattern: String,
        reason: String,
    },

    #[error("duplicate constraint id: {0}")]
    DuplicateConstraint(String),

    #[error("audit write failed: {0}")]
    Audit(#[from] StorageError),

    #[error("approval gateway failed: {0}")]
    Approval(String),

    #[error(transparent)]
    Domain(#[from] RatchetError),
}

pub type ConstitutionResult<T> = std::result::Result<T, ConstitutionError>;
