use crate::archive::ArchiveError;
use crate::benchmark::BenchmarkError;
use crate::constitution::ConstitutionError;
use crate::domain::RatchetError;
use crate::sandbox::SandboxError;

use super::state::CycleState;

/// Errors that end a controller call. Ordinary rejections of a candidate
/// are not errors; they come back as a discard outcome.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("illegal cycle transition {from} -> {to}")]
    IllegalTransition { from: CycleState, to: CycleState },

    #[error("emergency stop engaged")]
    EmergencyStop,

    #[error("invalid objective-hacking pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0} requires a human actor")]
    HumanRequired(&'static str),

    #[error("operation denied: {0}")]
    Denied(String),

    #[error("constitution error: {0}")]
    Constitution(#[from] ConstitutionError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("benchmark error: {0}")]
    Benchmark(#[from] BenchmarkError),

    #[error("storage error: {0}")]
    Storage(#[from] ratchet_state::StorageError),

    #[error("domain error: {0}")]
    Domain(#[from] RatchetError),
}

pub type EvolutionResult<T> = std::result::Result<T, EvolutionError>;
