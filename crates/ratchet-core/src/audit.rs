//! Audit log front-end.
//!
//! Wraps an [`AuditSink`] with the conversions from domain types and the
//! retention policy. The constitution engine writes one entry per decision;
//! external consumers read through [`AuditLog::entries`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ratchet_state::{AuditRecord, AuditSink, StorageResult};
use tracing::info;

use crate::domain::{Decision, Operation};

/// Default retention for audit entries.
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    retention_days: u32,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Append one entry for `decision` on `op`. Returns the assigned seq.
    pub async fn record(
        &self,
        op: &Operation,
        decision: &Decision,
        detail: impl Into<String>,
    ) -> StorageResult<u64> {
        let record = AuditRecord {
            seq: 0,
            timestamp: Utc::now(),
            operation: serde_json::to_value(op)?,
            decision: serde_json::to_value(decision)?,
            actor: op.actor().to_string(),
            detail: detail.into(),
        };
        self.sink.append(record).await
    }

    pub async fn entries(&self, since: Option<DateTime<Utc>>) -> StorageResult<Vec<AuditRecord>> {
        self.sink.entries(since).await
    }

    /// Drop entries older than the retention period as of `now`.
    pub async fn enforce_retention(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let removed = self.sink.purge_before(cutoff).await?;
        info!(
            event = "audit.retention",
            removed,
            retention_days = self.retention_days,
            "audit retention enforced"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, OperationKind};
    use ratchet_state::fakes::MemoryAuditSink;

    #[tokio::test]
    async fn record_captures_actor_and_decision() {
        let log = AuditLog::new(Arc::new(MemoryAuditSink::new()));
        let op = Operation::builder(OperationKind::Rollback, Actor::human("alice")).build();
        let decision = Decision::Deny {
            reason: "stop".to_string(),
            constraint_id: None,
        };
        let seq = log.record(&op, &decision, "emergency stop").await.unwrap();
        assert_eq!(seq, 1);

        let entries = log.entries(None).await.unwrap();
        assert_eq!(entries[0].actor, "human:alice");
        assert_eq!(entries[0].decision["verdict"], "deny");
        assert_eq!(entries[0].operation["kind"], "rollback");
    }

    #[tokio::test]
    async fn retention_uses_configured_days() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(sink.clone()).with_retention_days(30);
        let op = Operation::builder(OperationKind::Rollback, Actor::human("alice")).build();
        let decision = Decision::Allow {
            constraint_id: "x".to_string(),
        };
        log.record(&op, &decision, "").await.unwrap();

        // Nothing is older than 30 days yet.
        assert_eq!(log.enforce_retention(Utc::now()).await.unwrap(), 0);
        // Pretend 31 days have passed.
        let later = Utc::now() + Duration::days(31);
        assert_eq!(log.enforce_retention(later).await.unwrap(), 1);
    }
}
