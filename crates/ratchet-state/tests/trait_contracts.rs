//! Trait contract tests for AuditSink, VersionStore, and ProposalLedger.
//!
//! Each contract is written once against the trait object and run against
//! every backend: the in-memory fakes, the JSONL sink, and SurrealDB
//! (`mem://`).

use chrono::{Duration, Utc};
use ratchet_state::fakes::{MemoryAuditSink, MemoryProposalLedger, MemoryVersionStore};
use ratchet_state::storage_traits::*;
use ratchet_state::{JsonlAuditSink, StorageError, SurrealStore};

fn audit(actor: &str, ts: chrono::DateTime<Utc>) -> AuditRecord {
    AuditRecord {
        seq: 0,
        timestamp: ts,
        operation: serde_json::json!({"kind": "apply_patch", "target": "agent/src"}),
        decision: serde_json::json!({"verdict": "allow"}),
        actor: actor.to_string(),
        detail: "ok".to_string(),
    }
}

fn version(id: &str, parent: Option<&str>, score: f64) -> ArchivedVersion {
    ArchivedVersion {
        id: VersionId::from(id),
        parent_id: parent.map(VersionId::from),
        diff_from_parent: serde_json::json!({"edits": []}),
        content_digest: ContentDigest::from_bytes(id.as_bytes()),
        accepted_score: score,
        accepted_at: Utc::now(),
        proposal_id: parent.map(|_| format!("proposal-{id}")),
    }
}

fn proposal(id: &str, outcome: ProposalOutcome) -> ProposalRecord {
    ProposalRecord {
        proposal_id: id.to_string(),
        outcome,
        reason: Some("test".to_string()),
        payload: serde_json::json!({"id": id}),
        recorded_at: Utc::now(),
        disposition: None,
    }
}

fn disposition() -> Disposition {
    Disposition {
        verdict: DispositionVerdict::Confirmed,
        decided_by: "human:alice".to_string(),
        note: None,
        decided_at: Utc::now(),
    }
}

// ===========================================================================
// AuditSink contracts
// ===========================================================================

async fn audit_contract(sink: &dyn AuditSink) {
    let now = Utc::now();
    let s1 = sink
        .append(audit("agent:evolver", now - Duration::days(400)))
        .await
        .unwrap();
    let s2 = sink.append(audit("human:alice", now)).await.unwrap();
    assert!(s2 > s1, "seq must strictly increase");

    let all = sink.entries(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].seq, s1);
    assert_eq!(all[1].actor, "human:alice");
    assert_eq!(all[0].operation["kind"], "apply_patch");

    let recent = sink
        .entries(Some(now - Duration::days(1)))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);

    let removed = sink.purge_before(now - Duration::days(365)).await.unwrap();
    assert_eq!(removed, 1);
    let left = sink.entries(None).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].seq, s2);

    let s3 = sink.append(audit("system", now)).await.unwrap();
    assert!(s3 > s2, "seq must keep increasing after purge");
}

#[tokio::test]
async fn audit_contract_memory() {
    audit_contract(&MemoryAuditSink::new()).await;
}

#[tokio::test]
async fn audit_contract_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let sink = JsonlAuditSink::open(dir.path().join("logs/audit.jsonl")).unwrap();
    audit_contract(&sink).await;
}

#[tokio::test]
async fn audit_contract_surreal() {
    let store = SurrealStore::in_memory().await.unwrap();
    audit_contract(&store).await;
}

// ===========================================================================
// VersionStore contracts
// ===========================================================================

async fn version_contract(store: &dyn VersionStore) {
    assert!(store.head().await.unwrap().is_none());

    store.insert(version("v0", None, 0.80)).await.unwrap();
    store.set_head(&VersionId::from("v0")).await.unwrap();
    store.insert(version("v1", Some("v0"), 0.83)).await.unwrap();
    store.insert(version("v2", Some("v1"), 0.85)).await.unwrap();
    store.set_head(&VersionId::from("v2")).await.unwrap();

    let ids: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.id.0)
        .collect();
    assert_eq!(ids, vec!["v0", "v1", "v2"]);

    let v1 = store.get(&VersionId::from("v1")).await.unwrap();
    assert_eq!(v1.parent_id, Some(VersionId::from("v0")));
    assert!((v1.accepted_score - 0.83).abs() < 1e-12);
    assert_eq!(v1.content_digest, ContentDigest::from_bytes(b"v1"));

    assert_eq!(store.head().await.unwrap(), Some(VersionId::from("v2")));

    // Rolling the head back keeps descendants.
    store.set_head(&VersionId::from("v0")).await.unwrap();
    assert_eq!(store.head().await.unwrap(), Some(VersionId::from("v0")));
    assert_eq!(store.list().await.unwrap().len(), 3);
}

async fn version_rejections(store: &dyn VersionStore) {
    store.insert(version("g", None, 0.5)).await.unwrap();

    let dup = store.insert(version("g", None, 0.5)).await.unwrap_err();
    assert!(matches!(dup, StorageError::DuplicateVersion { .. }));

    let orphan = store
        .insert(version("x", Some("missing"), 0.5))
        .await
        .unwrap_err();
    assert!(matches!(orphan, StorageError::ParentNotFound { .. }));

    let missing = store.get(&VersionId::from("nope")).await.unwrap_err();
    assert!(matches!(missing, StorageError::VersionNotFound { .. }));

    let bad_head = store.set_head(&VersionId::from("nope")).await.unwrap_err();
    assert!(matches!(bad_head, StorageError::VersionNotFound { .. }));
}

async fn version_insert_head(store: &dyn VersionStore) {
    store.insert_head(version("g", None, 0.5)).await.unwrap();
    assert_eq!(store.head().await.unwrap(), Some(VersionId::from("g")));
    store.insert_head(version("c", Some("g"), 0.6)).await.unwrap();
    assert_eq!(store.head().await.unwrap(), Some(VersionId::from("c")));

    // A rejected insert leaves neither a stray version nor a moved head.
    let orphan = store
        .insert_head(version("x", Some("missing"), 0.7))
        .await
        .unwrap_err();
    assert!(matches!(orphan, StorageError::ParentNotFound { .. }));
    let dup = store
        .insert_head(version("g", None, 0.7))
        .await
        .unwrap_err();
    assert!(matches!(dup, StorageError::DuplicateVersion { .. }));

    assert_eq!(store.head().await.unwrap(), Some(VersionId::from("c")));
    let ids: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.id.0)
        .collect();
    assert_eq!(ids, vec!["g", "c"]);
}

#[tokio::test]
async fn version_contract_memory() {
    version_contract(&MemoryVersionStore::new()).await;
    version_rejections(&MemoryVersionStore::new()).await;
    version_insert_head(&MemoryVersionStore::new()).await;
}

#[tokio::test]
async fn version_contract_surreal() {
    version_contract(&SurrealStore::in_memory().await.unwrap()).await;
    version_rejections(&SurrealStore::in_memory().await.unwrap()).await;
    version_insert_head(&SurrealStore::in_memory().await.unwrap()).await;
}

// ===========================================================================
// ProposalLedger contracts
// ===========================================================================

async fn ledger_contract(ledger: &dyn ProposalLedger) {
    ledger
        .record(proposal("p1", ProposalOutcome::Archived))
        .await
        .unwrap();
    ledger
        .record(proposal("p2", ProposalOutcome::Discarded))
        .await
        .unwrap();
    ledger
        .record(proposal("p3", ProposalOutcome::Quarantined))
        .await
        .unwrap();

    let dup = ledger
        .record(proposal("p1", ProposalOutcome::Discarded))
        .await
        .unwrap_err();
    assert!(matches!(dup, StorageError::DuplicateProposal { .. }));

    assert_eq!(ledger.list(None).await.unwrap().len(), 3);
    let quarantined = ledger
        .list(Some(ProposalOutcome::Quarantined))
        .await
        .unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].proposal_id, "p3");

    // Only quarantined proposals accept a disposition.
    let err = ledger.set_disposition("p2", disposition()).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidDisposition { .. }));

    let disposed = ledger.set_disposition("p3", disposition()).await.unwrap();
    assert_eq!(
        disposed.disposition.as_ref().map(|d| d.verdict),
        Some(DispositionVerdict::Confirmed)
    );
    let reread = ledger.get("p3").await.unwrap();
    assert!(reread.disposition.is_some());

    // And only once.
    let again = ledger.set_disposition("p3", disposition()).await.unwrap_err();
    assert!(matches!(again, StorageError::InvalidDisposition { .. }));

    let missing = ledger.get("nope").await.unwrap_err();
    assert!(matches!(missing, StorageError::ProposalNotFound { .. }));
}

#[tokio::test]
async fn ledger_contract_memory() {
    ledger_contract(&MemoryProposalLedger::new()).await;
}

#[tokio::test]
async fn ledger_contract_surreal() {
    ledger_contract(&SurrealStore::in_memory().await.unwrap()).await;
}
