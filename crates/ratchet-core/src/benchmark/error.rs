use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("failed to read suite {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse suite: {0}")]
    Parse(String),

    #[error("suite has no probes")]
    Empty,

    #[error("probe weights sum to {sum}, expected 1.0")]
    InvalidWeights { sum: f64 },

    #[error("invalid probe {name}: {reason}")]
    InvalidProbe { name: String, reason: String },

    #[error("duplicate probe name: {0}")]
    DuplicateProbe(String),

    #[error("domain error: {0}")]
    Domain(#[from] crate::domain::RatchetError),
}

pub type BenchResult<T> = std::result::Result<T, BenchmarkError>;
