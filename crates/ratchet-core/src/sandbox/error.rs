//! Error types for the sandbox module.

use std::path::PathBuf;

/// Errors produced by the sandbox layer. A task that runs and fails is not
/// an error; it is a result with `success = false`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid sandbox limits: {0}")]
    InvalidLimits(String),

    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),

    #[error("failed to provision sandbox context: {0}")]
    Provision(#[source] std::io::Error),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("isolation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("sandbox I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "isolation self-test failing: {consecutive_failures} consecutive failures (threshold {threshold})"
    )]
    SelfTestEscalation {
        consecutive_failures: u32,
        threshold: u32,
    },

    #[error("domain error: {0}")]
    Domain(#[from] crate::domain::RatchetError),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
