//! Ratchet-State: persistence for the self-improvement loop
//!
//! Everything that must outlive the process lives behind the traits in
//! [`storage_traits`]:
//!
//! - `AuditSink`: append-only log of constitution decisions
//! - `VersionStore`: linear chain of accepted versions plus the head pointer
//! - `ProposalLedger`: terminal record of every proposal (archived,
//!   discarded, quarantined)
//!
//! Backends:
//!
//! - [`fakes`]: in-memory implementations for tests
//! - [`jsonl::JsonlAuditSink`]: append-only newline-delimited JSON file
//! - [`SurrealStore`]: SurrealDB (in-memory, SurrealKV on disk, or remote)

mod error;
pub mod fakes;
pub mod jsonl;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use jsonl::JsonlAuditSink;
pub use storage_traits::{
    ArchivedVersion, AuditRecord, AuditSink, ContentDigest, Disposition, DispositionVerdict,
    ProposalLedger, ProposalOutcome, ProposalRecord, StorageResult, VersionId, VersionStore,
};
pub use surreal_store::SurrealStore;

/// Result type for connection-level operations.
pub type Result<T> = std::result::Result<T, StateError>;
