//! Storage trait definitions for Ratchet
//!
//! These traits define the persistence seams of the improvement loop:
//! - `AuditSink`: append-only decision log, read by external consumers
//! - `VersionStore`: accepted versions and the single head pointer
//! - `ProposalLedger`: the one terminal record written per proposal
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex produced
/// by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an archived version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub String);

impl VersionId {
    /// Generate a new random VersionId
    pub fn new() -> Self {
        VersionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self {
        VersionId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// AuditSink: append-only decision log
// ---------------------------------------------------------------------------

/// One persisted audit entry.
///
/// `operation` and `decision` are stored as opaque JSON so the storage layer
/// does not depend on the constitution's types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number, assigned by the sink on append.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: serde_json::Value,
    pub decision: serde_json::Value,
    /// Actor identifier (e.g. "agent:evolver", "human:alice").
    pub actor: String,
    pub detail: String,
}

/// Append-only audit log.
///
/// Guarantees:
/// - `append` never rewrites an existing entry; `seq` strictly increases.
/// - `entries` returns entries in append order.
/// - `purge_before` is the only way entries leave the log (retention).
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an entry. The sink assigns and returns its `seq`.
    async fn append(&self, record: AuditRecord) -> StorageResult<u64>;

    /// All entries, optionally only those at or after `since`.
    async fn entries(&self, since: Option<DateTime<Utc>>) -> StorageResult<Vec<AuditRecord>>;

    /// Remove entries older than `cutoff`; returns how many were removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// VersionStore: archived versions and the head pointer
// ---------------------------------------------------------------------------

/// An accepted version of the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedVersion {
    pub id: VersionId,
    /// `None` only for the genesis version.
    pub parent_id: Option<VersionId>,
    /// Serialized patch turning the parent's content into this version's.
    pub diff_from_parent: serde_json::Value,
    /// Digest of the fully materialized content.
    pub content_digest: ContentDigest,
    pub accepted_score: f64,
    pub accepted_at: DateTime<Utc>,
    /// Proposal this version came from (`None` for genesis).
    pub proposal_id: Option<String>,
}

impl ArchivedVersion {
    pub fn is_genesis(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Version archive storage.
///
/// Semantics:
/// - `insert` refuses duplicate ids and unknown parents. Versions are never
///   deleted or rewritten.
/// - `list` returns versions in insertion order (oldest first).
/// - `set_head` moves the single head pointer to an existing version.
/// - `insert_head` is `insert` followed by `set_head` as one write: either
///   both happen or neither does.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn insert(&self, version: ArchivedVersion) -> StorageResult<()>;

    async fn insert_head(&self, version: ArchivedVersion) -> StorageResult<()>;

    async fn get(&self, id: &VersionId) -> StorageResult<ArchivedVersion>;

    async fn list(&self) -> StorageResult<Vec<ArchivedVersion>>;

    async fn head(&self) -> StorageResult<Option<VersionId>>;

    async fn set_head(&self, id: &VersionId) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ProposalLedger: terminal proposal records
// ---------------------------------------------------------------------------

/// Terminal state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOutcome {
    Archived,
    Discarded,
    /// Discarded with a suspected objective-hacking flag; awaits a human.
    Quarantined,
}

impl std::fmt::Display for ProposalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalOutcome::Archived => write!(f, "archived"),
            ProposalOutcome::Discarded => write!(f, "discarded"),
            ProposalOutcome::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Human verdict on a quarantined proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionVerdict {
    /// The reviewer confirmed the candidate gamed the benchmark.
    Confirmed,
    /// The flag was a false positive; the proposal may be resubmitted.
    FalsePositive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    pub verdict: DispositionVerdict,
    pub decided_by: String,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// The single record kept for a proposal once it leaves the pending state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal_id: String,
    pub outcome: ProposalOutcome,
    pub reason: Option<String>,
    /// Full serialized proposal.
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
    pub disposition: Option<Disposition>,
}

/// Proposal ledger.
///
/// Guarantees:
/// - A proposal id is recorded at most once (its single terminal transition).
/// - Only quarantined records accept a disposition, and only once.
#[async_trait]
pub trait ProposalLedger: Send + Sync {
    async fn record(&self, record: ProposalRecord) -> StorageResult<()>;

    async fn get(&self, proposal_id: &str) -> StorageResult<ProposalRecord>;

    async fn list(&self, outcome: Option<ProposalOutcome>) -> StorageResult<Vec<ProposalRecord>>;

    async fn set_disposition(
        &self,
        proposal_id: &str,
        disposition: Disposition,
    ) -> StorageResult<ProposalRecord>;
}

/// Shared disposition rule used by every ledger backend.
pub(crate) fn check_disposable(record: &ProposalRecord) -> StorageResult<()> {
    if record.outcome != ProposalOutcome::Quarantined {
        return Err(StorageError::InvalidDisposition {
            id: record.proposal_id.clone(),
            reason: format!("outcome is {}, not quarantined", record.outcome),
        });
    }
    if record.disposition.is_some() {
        return Err(StorageError::InvalidDisposition {
            id: record.proposal_id.clone(),
            reason: "already disposed".to_string(),
        });
    }
    Ok(())
}
