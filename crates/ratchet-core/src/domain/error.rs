//! Domain-level error taxonomy for Ratchet.

use ratchet_state::StorageError;

/// Ratchet domain errors.
#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("value cannot be canonicalized: {0}")]
    NonCanonical(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Ratchet domain operations.
pub type Result<T> = std::result::Result<T, RatchetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_mismatch_error() {
        let err = RatchetError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: RatchetError = StorageError::VersionNotFound {
            id: "v9".to_string(),
        }
        .into();
        assert!(err.to_string().contains("v9"));
    }
}
