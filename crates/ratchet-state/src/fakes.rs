//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryAuditSink`, `MemoryVersionStore`, and
//! `MemoryProposalLedger` that satisfy the trait contracts without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryAuditSink
// ---------------------------------------------------------------------------

/// In-memory audit log backed by a `Vec<AuditRecord>`.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    inner: Mutex<AuditState>,
}

#[derive(Debug, Default)]
struct AuditState {
    next_seq: u64,
    entries: Vec<AuditRecord>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, mut record: AuditRecord) -> StorageResult<u64> {
        let mut state = lock(&self.inner)?;
        state.next_seq += 1;
        record.seq = state.next_seq;
        state.entries.push(record);
        Ok(state.next_seq)
    }

    async fn entries(&self, since: Option<DateTime<Utc>>) -> StorageResult<Vec<AuditRecord>> {
        let state = lock(&self.inner)?;
        Ok(state
            .entries
            .iter()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut state = lock(&self.inner)?;
        let before = state.entries.len();
        state.entries.retain(|e| e.timestamp >= cutoff);
        Ok((before - state.entries.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MemoryVersionStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VersionState {
    order: Vec<VersionId>,
    versions: HashMap<VersionId, ArchivedVersion>,
    head: Option<VersionId>,
}

/// In-memory version store; insertion order is kept in a side vector.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    inner: Mutex<VersionState>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionState {
    fn insert(&mut self, version: ArchivedVersion) -> StorageResult<()> {
        if self.versions.contains_key(&version.id) {
            return Err(StorageError::DuplicateVersion {
                id: version.id.0.clone(),
            });
        }
        if let Some(parent) = &version.parent_id {
            if !self.versions.contains_key(parent) {
                return Err(StorageError::ParentNotFound {
                    id: parent.0.clone(),
                });
            }
        }
        self.order.push(version.id.clone());
        self.versions.insert(version.id.clone(), version);
        Ok(())
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn insert(&self, version: ArchivedVersion) -> StorageResult<()> {
        lock(&self.inner)?.insert(version)
    }

    async fn insert_head(&self, version: ArchivedVersion) -> StorageResult<()> {
        let mut state = lock(&self.inner)?;
        let id = version.id.clone();
        state.insert(version)?;
        state.head = Some(id);
        Ok(())
    }

    async fn get(&self, id: &VersionId) -> StorageResult<ArchivedVersion> {
        let state = lock(&self.inner)?;
        state
            .versions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::VersionNotFound { id: id.0.clone() })
    }

    async fn list(&self) -> StorageResult<Vec<ArchivedVersion>> {
        let state = lock(&self.inner)?;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.versions.get(id).cloned())
            .collect())
    }

    async fn head(&self) -> StorageResult<Option<VersionId>> {
        Ok(lock(&self.inner)?.head.clone())
    }

    async fn set_head(&self, id: &VersionId) -> StorageResult<()> {
        let mut state = lock(&self.inner)?;
        if !state.versions.contains_key(id) {
            return Err(StorageError::VersionNotFound { id: id.0.clone() });
        }
        state.head = Some(id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryProposalLedger
// ---------------------------------------------------------------------------

/// In-memory proposal ledger.
#[derive(Debug, Default)]
pub struct MemoryProposalLedger {
    records: Mutex<Vec<ProposalRecord>>,
}

impl MemoryProposalLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProposalLedger for MemoryProposalLedger {
    async fn record(&self, record: ProposalRecord) -> StorageResult<()> {
        let mut records = lock(&self.records)?;
        if records.iter().any(|r| r.proposal_id == record.proposal_id) {
            return Err(StorageError::DuplicateProposal {
                id: record.proposal_id,
            });
        }
        records.push(record);
        Ok(())
    }

    async fn get(&self, proposal_id: &str) -> StorageResult<ProposalRecord> {
        let records = lock(&self.records)?;
        records
            .iter()
            .find(|r| r.proposal_id == proposal_id)
            .cloned()
            .ok_or_else(|| StorageError::ProposalNotFound {
                id: proposal_id.to_string(),
            })
    }

    async fn list(&self, outcome: Option<ProposalOutcome>) -> StorageResult<Vec<ProposalRecord>> {
        let records = lock(&self.records)?;
        Ok(records
            .iter()
            .filter(|r| outcome.map_or(true, |o| r.outcome == o))
            .cloned()
            .collect())
    }

    async fn set_disposition(
        &self,
        proposal_id: &str,
        disposition: Disposition,
    ) -> StorageResult<ProposalRecord> {
        let mut records = lock(&self.records)?;
        let record = records
            .iter_mut()
            .find(|r| r.proposal_id == proposal_id)
            .ok_or_else(|| StorageError::ProposalNotFound {
                id: proposal_id.to_string(),
            })?;
        check_disposable(record)?;
        record.disposition = Some(disposition);
        Ok(record.clone())
    }
}
