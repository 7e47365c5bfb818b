//! Improvement archive.
//!
//! Accepted versions form a parent-linked chain over a [`VersionStore`];
//! each version stores the patch from its parent, so any version can be
//! rebuilt by replaying patches from genesis. Versions are never deleted.
//! The head pointer only moves through [`ImprovementArchive::advance`] and
//! [`ImprovementArchive::rewind`], which require the controller's cycle lock.

use std::sync::Arc;

use chrono::Utc;
use ratchet_state::{ArchivedVersion, ContentDigest, StorageError, VersionId, VersionStore};
use tokio::sync::MutexGuard;
use tracing::info;

use crate::benchmark::RegressionPolicy;
use crate::domain::digest::verify_digest;
use crate::domain::{FileEdit, Patch, RatchetError, Snapshot};
use crate::evolution::CycleState;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive has no genesis version")]
    Empty,

    #[error("archive already has a genesis version")]
    AlreadyInitialized,

    #[error("stale base: proposal built on {base}, current is {current}")]
    StaleBase { base: String, current: String },

    #[error("candidate score {candidate} regresses parent score {parent} beyond tolerance")]
    Regression { parent: f64, candidate: f64 },

    #[error("{target} is not an ancestor of the current version {current}")]
    NotAncestor { target: String, current: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("domain error: {0}")]
    Domain(#[from] RatchetError),
}

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Proof that the caller holds the controller's cycle lock.
pub(crate) type CycleLock<'a> = MutexGuard<'a, CycleState>;

#[derive(Clone)]
pub struct ImprovementArchive {
    store: Arc<dyn VersionStore>,
    policy: RegressionPolicy,
}

impl ImprovementArchive {
    pub fn new(store: Arc<dyn VersionStore>, policy: RegressionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RegressionPolicy {
        &self.policy
    }

    pub async fn head(&self) -> ArchiveResult<Option<VersionId>> {
        Ok(self.store.head().await?)
    }

    /// The version the head pointer names.
    pub async fn current(&self) -> ArchiveResult<ArchivedVersion> {
        let head = self.store.head().await?.ok_or(ArchiveError::Empty)?;
        Ok(self.store.get(&head).await?)
    }

    pub async fn get(&self, id: &VersionId) -> ArchiveResult<ArchivedVersion> {
        Ok(self.store.get(id).await?)
    }

    /// Every version in insertion order.
    pub async fn list(&self) -> ArchiveResult<Vec<ArchivedVersion>> {
        Ok(self.store.list().await?)
    }

    /// Versions from genesis to `id`, inclusive.
    pub async fn lineage(&self, id: &VersionId) -> ArchiveResult<Vec<ArchivedVersion>> {
        let mut chain = Vec::new();
        let mut next = Some(id.clone());
        while let Some(vid) = next {
            let version = self.store.get(&vid).await?;
            next = version.parent_id.clone();
            chain.push(version);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Rebuild the content of `id` and check it against the recorded digest.
    pub async fn materialize(&self, id: &VersionId) -> ArchiveResult<Snapshot> {
        let mut snapshot = Snapshot::new();
        for version in self.lineage(id).await? {
            let patch = Patch::from_value(&version.diff_from_parent)?;
            snapshot = patch.apply(&snapshot)?;
            verify_digest(version.content_digest.as_str(), &snapshot.digest()?)?;
        }
        Ok(snapshot)
    }

    /// Seed an empty archive with `snapshot` as genesis and point head at it.
    pub async fn genesis(&self, snapshot: &Snapshot, score: f64) -> ArchiveResult<ArchivedVersion> {
        if self.store.head().await?.is_some() {
            return Err(ArchiveError::AlreadyInitialized);
        }
        let patch = Patch::new(
            snapshot
                .files()
                .map(|(path, content)| FileEdit::Write {
                    path: path.to_string(),
                    content: content.to_string(),
                })
                .collect(),
        );
        let version = ArchivedVersion {
            id: VersionId::new(),
            parent_id: None,
            diff_from_parent: patch.to_value()?,
            content_digest: digest(snapshot)?,
            accepted_score: score,
            accepted_at: Utc::now(),
            proposal_id: None,
        };
        self.store.insert_head(version.clone()).await?;
        info!(event = "archive.genesis", version = %version.id, score, "archive seeded");
        Ok(version)
    }

    /// Append the sole child of current and move head to it.
    pub(crate) async fn advance(
        &self,
        _cycle: &CycleLock<'_>,
        base: &VersionId,
        patch: &Patch,
        score: f64,
        proposal_id: &str,
    ) -> ArchiveResult<ArchivedVersion> {
        let parent = self.current().await?;
        if &parent.id != base {
            return Err(ArchiveError::StaleBase {
                base: base.to_string(),
                current: parent.id.to_string(),
            });
        }
        if self.policy.is_regression(score, parent.accepted_score) {
            return Err(ArchiveError::Regression {
                parent: parent.accepted_score,
                candidate: score,
            });
        }
        let content = patch.apply(&self.materialize(&parent.id).await?)?;
        let version = ArchivedVersion {
            id: VersionId::new(),
            parent_id: Some(parent.id.clone()),
            diff_from_parent: patch.to_value()?,
            content_digest: digest(&content)?,
            accepted_score: score,
            accepted_at: Utc::now(),
            proposal_id: Some(proposal_id.to_string()),
        };
        self.store.insert_head(version.clone()).await?;
        info!(
            event = "archive.advance",
            parent = %parent.id,
            version = %version.id,
            score,
            "version archived"
        );
        Ok(version)
    }

    /// Point head at `target`, an ancestor of current. Descendants are kept.
    /// Rewinding to current is a no-op. Returns the previous head.
    pub(crate) async fn rewind(
        &self,
        _cycle: &CycleLock<'_>,
        target: &VersionId,
    ) -> ArchiveResult<VersionId> {
        let current = self.current().await?;
        if &current.id == target {
            return Ok(current.id);
        }
        let lineage = self.lineage(&current.id).await?;
        if !lineage.iter().any(|v| &v.id == target) {
            return Err(ArchiveError::NotAncestor {
                target: target.to_string(),
                current: current.id.to_string(),
            });
        }
        self.store.set_head(target).await?;
        Ok(current.id)
    }
}

fn digest(snapshot: &Snapshot) -> ArchiveResult<ContentDigest> {
    Ok(ContentDigest::try_from(snapshot.digest()?)?)
}
