//! SurrealDB-backed implementation of all three storage traits.
//!
//! Rows keep JSON payloads as strings so the schema does not depend on the
//! shape of operations, decisions or patches. Conversions to and from the
//! `storage_traits` types happen at this boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::*;

const NAMESPACE: &str = "ratchet";
const DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".ratchet/db";

mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&SurrealDatetime::from(*date), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRow {
    seq: u64,
    #[serde(with = "surreal_datetime")]
    timestamp: DateTime<Utc>,
    operation_json: String,
    decision_json: String,
    actor: String,
    detail: String,
}

impl AuditRow {
    fn from_record(r: &AuditRecord) -> StorageResult<Self> {
        Ok(Self {
            seq: r.seq,
            timestamp: r.timestamp,
            operation_json: serde_json::to_string(&r.operation)?,
            decision_json: serde_json::to_string(&r.decision)?,
            actor: r.actor.clone(),
            detail: r.detail.clone(),
        })
    }

    fn into_record(self) -> StorageResult<AuditRecord> {
        Ok(AuditRecord {
            seq: self.seq,
            timestamp: self.timestamp,
            operation: serde_json::from_str(&self.operation_json)?,
            decision: serde_json::from_str(&self.decision_json)?,
            actor: self.actor,
            detail: self.detail,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRow {
    version_id: String,
    parent_id: Option<String>,
    diff_json: String,
    content_digest: String,
    accepted_score: f64,
    #[serde(with = "surreal_datetime")]
    accepted_at: DateTime<Utc>,
    proposal_id: Option<String>,
    ordinal: u64,
}

impl VersionRow {
    fn into_version(self) -> StorageResult<ArchivedVersion> {
        Ok(ArchivedVersion {
            id: VersionId(self.version_id),
            parent_id: self.parent_id.map(VersionId),
            diff_from_parent: serde_json::from_str(&self.diff_json)?,
            content_digest: ContentDigest::try_from(self.content_digest)?,
            accepted_score: self.accepted_score,
            accepted_at: self.accepted_at,
            proposal_id: self.proposal_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeadRow {
    version_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProposalRow {
    proposal_id: String,
    outcome: String,
    reason: Option<String>,
    payload_json: String,
    #[serde(with = "surreal_datetime")]
    recorded_at: DateTime<Utc>,
    disposition_json: Option<String>,
    ordinal: u64,
}

impl ProposalRow {
    fn into_record(self) -> StorageResult<ProposalRecord> {
        let outcome = match self.outcome.as_str() {
            "archived" => ProposalOutcome::Archived,
            "discarded" => ProposalOutcome::Discarded,
            "quarantined" => ProposalOutcome::Quarantined,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown proposal outcome: {other}"
                )))
            }
        };
        Ok(ProposalRecord {
            proposal_id: self.proposal_id,
            outcome,
            reason: self.reason,
            payload: serde_json::from_str(&self.payload_json)?,
            recorded_at: self.recorded_at,
            disposition: self
                .disposition_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed [`AuditSink`], [`VersionStore`] and [`ProposalLedger`].
pub struct SurrealStore {
    db: Surreal<Any>,
    // Serializes writers; caches the last audit seq once known.
    write_lock: Mutex<Option<u64>>,
}

impl SurrealStore {
    async fn setup(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self {
            db,
            write_lock: Mutex::new(None),
        })
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::setup("mem://").await?;
        info!("SurrealStore connected (in-memory)");
        Ok(store)
    }

    /// Open (or create) an on-disk SurrealKV database at `path`.
    pub async fn open_local(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let store = Self::setup(&url).await?;
        info!("SurrealStore connected ({})", url);
        Ok(store)
    }

    /// Connect to any endpoint understood by `surrealdb::engine::any`.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let store = Self::setup(url).await?;
        info!("SurrealStore connected ({})", url);
        Ok(store)
    }

    /// `SURREALDB_URL` if set, otherwise local persistence in `.ratchet/db`.
    pub async fn from_env() -> crate::Result<Self> {
        match std::env::var("SURREALDB_URL") {
            Ok(url) => Self::connect(&url).await,
            Err(_) => {
                info!(
                    "No SURREALDB_URL found, using local persistence: {}",
                    DEFAULT_LOCAL_PATH
                );
                Self::open_local(DEFAULT_LOCAL_PATH).await
            }
        }
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_version(&self, id: &str) -> StorageResult<Option<VersionRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM versions WHERE version_id = $vid")
            .bind(("vid", id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    /// Check `version` against the duplicate and parent rules and build its
    /// row. The caller holds the write lock.
    async fn new_version_row(&self, version: &ArchivedVersion) -> StorageResult<VersionRow> {
        if self.fetch_version(version.id.as_str()).await?.is_some() {
            return Err(StorageError::DuplicateVersion {
                id: version.id.0.clone(),
            });
        }
        if let Some(parent) = &version.parent_id {
            if self.fetch_version(parent.as_str()).await?.is_none() {
                return Err(StorageError::ParentNotFound {
                    id: parent.0.clone(),
                });
            }
        }
        Ok(VersionRow {
            version_id: version.id.0.clone(),
            parent_id: version.parent_id.as_ref().map(|p| p.0.clone()),
            diff_json: serde_json::to_string(&version.diff_from_parent)?,
            content_digest: version.content_digest.as_str().to_string(),
            accepted_score: version.accepted_score,
            accepted_at: version.accepted_at,
            proposal_id: version.proposal_id.clone(),
            ordinal: self.count("versions").await?,
        })
    }

    async fn fetch_proposal(&self, id: &str) -> StorageResult<Option<ProposalRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM proposals WHERE proposal_id = $pid")
            .bind(("pid", id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ProposalRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn count(&self, table: &'static str) -> StorageResult<u64> {
        #[derive(Deserialize)]
        struct Count {
            count: u64,
        }
        let mut res = self
            .db
            .query(format!("SELECT count() FROM {table} GROUP ALL"))
            .await
            .map_err(backend)?;
        let rows: Vec<Count> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|c| c.count).unwrap_or(0))
    }

    async fn max_seq(&self) -> StorageResult<u64> {
        #[derive(Deserialize)]
        struct Seq {
            seq: u64,
        }
        let mut res = self
            .db
            .query("SELECT seq FROM audit_entries ORDER BY seq DESC LIMIT 1")
            .await
            .map_err(backend)?;
        let rows: Vec<Seq> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|s| s.seq).unwrap_or(0))
    }
}

#[async_trait]
impl AuditSink for SurrealStore {
    #[instrument(skip(self, record), fields(actor = %record.actor))]
    async fn append(&self, mut record: AuditRecord) -> StorageResult<u64> {
        let mut last = self.write_lock.lock().await;
        let prev = match *last {
            Some(s) => s,
            None => self.max_seq().await?,
        };
        record.seq = prev + 1;

        let row = AuditRow::from_record(&record)?;
        let created: Option<AuditRow> = self
            .db
            .create("audit_entries")
            .content(row)
            .await
            .map_err(backend)?;
        if created.is_none() {
            return Err(StorageError::Backend(
                "failed to create audit entry".to_string(),
            ));
        }

        *last = Some(record.seq);
        debug!(seq = record.seq, "audit entry stored");
        Ok(record.seq)
    }

    async fn entries(&self, since: Option<DateTime<Utc>>) -> StorageResult<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = match since {
            Some(ts) => {
                let mut res = self
                    .db
                    .query("SELECT * FROM audit_entries WHERE timestamp >= $since ORDER BY seq ASC")
                    .bind(("since", SurrealDatetime::from(ts)))
                    .await
                    .map_err(backend)?;
                res.take(0).map_err(backend)?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM audit_entries ORDER BY seq ASC")
                    .await
                    .map_err(backend)?;
                res.take(0).map_err(backend)?
            }
        };
        rows.into_iter().map(AuditRow::into_record).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut res = self
            .db
            .query("DELETE audit_entries WHERE timestamp < $cutoff RETURN BEFORE")
            .bind(("cutoff", SurrealDatetime::from(cutoff)))
            .await
            .map_err(backend)?;
        let removed: Vec<AuditRow> = res.take(0).map_err(backend)?;
        Ok(removed.len() as u64)
    }
}

#[async_trait]
impl VersionStore for SurrealStore {
    #[instrument(skip(self, version), fields(id = %version.id))]
    async fn insert(&self, version: ArchivedVersion) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let row = self.new_version_row(&version).await?;
        let created: Option<VersionRow> = self
            .db
            .create("versions")
            .content(row)
            .await
            .map_err(backend)?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend("failed to create version".to_string()))
    }

    #[instrument(skip(self, version), fields(id = %version.id))]
    async fn insert_head(&self, version: ArchivedVersion) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let row = self.new_version_row(&version).await?;
        self.db
            .query(
                "BEGIN TRANSACTION;
                 CREATE versions CONTENT $row;
                 UPSERT archive_head:current SET version_id = $vid;
                 COMMIT TRANSACTION;",
            )
            .bind(("row", row))
            .bind(("vid", version.id.0.clone()))
            .await
            .and_then(|r| r.check())
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, id: &VersionId) -> StorageResult<ArchivedVersion> {
        self.fetch_version(id.as_str())
            .await?
            .ok_or_else(|| StorageError::VersionNotFound { id: id.0.clone() })?
            .into_version()
    }

    async fn list(&self) -> StorageResult<Vec<ArchivedVersion>> {
        let mut res = self
            .db
            .query("SELECT * FROM versions ORDER BY ordinal ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(VersionRow::into_version).collect()
    }

    async fn head(&self) -> StorageResult<Option<VersionId>> {
        let mut res = self
            .db
            .query("SELECT version_id FROM archive_head:current")
            .await
            .map_err(backend)?;
        let rows: Vec<HeadRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(|h| VersionId(h.version_id)))
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn set_head(&self, id: &VersionId) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_version(id.as_str()).await?.is_none() {
            return Err(StorageError::VersionNotFound { id: id.0.clone() });
        }
        self.db
            .query("UPSERT archive_head:current SET version_id = $vid")
            .bind(("vid", id.0.clone()))
            .await
            .and_then(|r| r.check())
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ProposalLedger for SurrealStore {
    #[instrument(skip(self, record), fields(proposal_id = %record.proposal_id))]
    async fn record(&self, record: ProposalRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_proposal(&record.proposal_id).await?.is_some() {
            return Err(StorageError::DuplicateProposal {
                id: record.proposal_id,
            });
        }
        let row = ProposalRow {
            proposal_id: record.proposal_id.clone(),
            outcome: record.outcome.to_string(),
            reason: record.reason.clone(),
            payload_json: serde_json::to_string(&record.payload)?,
            recorded_at: record.recorded_at,
            disposition_json: record
                .disposition
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            ordinal: self.count("proposals").await?,
        };
        let created: Option<ProposalRow> = self
            .db
            .create("proposals")
            .content(row)
            .await
            .map_err(backend)?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend("failed to record proposal".to_string()))
    }

    async fn get(&self, proposal_id: &str) -> StorageResult<ProposalRecord> {
        self.fetch_proposal(proposal_id)
            .await?
            .ok_or_else(|| StorageError::ProposalNotFound {
                id: proposal_id.to_string(),
            })?
            .into_record()
    }

    async fn list(&self, outcome: Option<ProposalOutcome>) -> StorageResult<Vec<ProposalRecord>> {
        let rows: Vec<ProposalRow> = match outcome {
            Some(o) => {
                let mut res = self
                    .db
                    .query("SELECT * FROM proposals WHERE outcome = $outcome ORDER BY ordinal ASC")
                    .bind(("outcome", o.to_string()))
                    .await
                    .map_err(backend)?;
                res.take(0).map_err(backend)?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM proposals ORDER BY ordinal ASC")
                    .await
                    .map_err(backend)?;
                res.take(0).map_err(backend)?
            }
        };
        rows.into_iter().map(ProposalRow::into_record).collect()
    }

    #[instrument(skip(self, disposition))]
    async fn set_disposition(
        &self,
        proposal_id: &str,
        disposition: Disposition,
    ) -> StorageResult<ProposalRecord> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .fetch_proposal(proposal_id)
            .await?
            .ok_or_else(|| StorageError::ProposalNotFound {
                id: proposal_id.to_string(),
            })?
            .into_record()?;
        check_disposable(&current)?;

        self.db
            .query("UPDATE proposals SET disposition_json = $d WHERE proposal_id = $pid")
            .bind(("d", serde_json::to_string(&disposition)?))
            .bind(("pid", proposal_id.to_string()))
            .await
            .and_then(|r| r.check())
            .map_err(backend)?;

        Ok(ProposalRecord {
            disposition: Some(disposition),
            ..current
        })
    }
}
