//! Constitution engine.
//!
//! Evaluation order for [`ConstitutionEngine::check`]:
//!
//! 1. emergency stop (denies everything but a human `clear_emergency_stop`)
//! 2. immutable constraints: first match denies
//! 3. supervised constraints: first match requires approval
//! 4. autonomous constraints: first match with all prerequisites allows
//! 5. otherwise: require approval with the configured default
//!
//! Every call appends exactly one audit entry before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::domain::{Actor, ApprovalMethod, Decision, Operation, OperationKind};
use crate::metrics::METRICS;
use crate::obs;

use super::constraint::ConstraintAction;
use super::error::ConstitutionResult;
use super::store::ConstraintStore;

/// Constraint id recorded for decisions made by the emergency stop itself.
pub const EMERGENCY_STOP_ID: &str = "builtin:emergency_stop";

/// Fallback for operations no constraint classifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultApproval {
    #[serde(default)]
    pub method: ApprovalMethod,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for DefaultApproval {
    fn default() -> Self {
        Self {
            method: ApprovalMethod::HumanReview,
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct ConstitutionEngine {
    store: Arc<ConstraintStore>,
    audit: AuditLog,
    default_approval: DefaultApproval,
    emergency_stop: AtomicBool,
}

impl ConstitutionEngine {
    pub fn new(store: Arc<ConstraintStore>, audit: AuditLog) -> Self {
        Self {
            store,
            audit,
            default_approval: DefaultApproval::default(),
            emergency_stop: AtomicBool::new(false),
        }
    }

    pub fn with_default_approval(mut self, default_approval: DefaultApproval) -> Self {
        self.default_approval = default_approval;
        self
    }

    /// Shared handle to the rule set.
    pub fn store(&self) -> Arc<ConstraintStore> {
        Arc::clone(&self.store)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Evaluate `op` and audit the decision.
    ///
    /// An audit failure is returned as an error; the caller must treat the
    /// operation as not allowed.
    pub async fn check(&self, op: &Operation) -> ConstitutionResult<Decision> {
        let (decision, detail) = self.evaluate(op);
        self.audit.record(op, &decision, detail).await?;

        if decision.is_deny() {
            METRICS.inc_denials();
        }
        obs::emit_decision(
            &op.id().to_string(),
            op.kind().as_str(),
            decision.label(),
            decision.constraint_id(),
        );
        Ok(decision)
    }

    fn evaluate(&self, op: &Operation) -> (Decision, String) {
        if self.is_emergency_stopped() {
            if *op.kind() == OperationKind::ClearEmergencyStop && op.actor().is_human() {
                return (
                    Decision::Allow {
                        constraint_id: EMERGENCY_STOP_ID.to_string(),
                    },
                    "human clears emergency stop".to_string(),
                );
            }
            return (
                Decision::Deny {
                    reason: "emergency stop engaged".to_string(),
                    constraint_id: None,
                },
                "emergency stop".to_string(),
            );
        }

        if let Some(c) = self.store.immutable().iter().find(|c| c.matches(op)) {
            let reason = match c.action() {
                ConstraintAction::Deny { reason } => reason.clone(),
                _ => c.description().to_string(),
            };
            return (
                Decision::Deny {
                    reason,
                    constraint_id: Some(c.id().to_string()),
                },
                format!("immutable constraint {} matched", c.id()),
            );
        }

        if let Some(c) = self.store.supervised().iter().find(|c| c.matches(op)) {
            let (method, timeout_secs) = match c.action() {
                ConstraintAction::RequireApproval {
                    method,
                    timeout_secs,
                } => (method.clone(), *timeout_secs),
                _ => (
                    self.default_approval.method.clone(),
                    self.default_approval.timeout_secs,
                ),
            };
            return (
                Decision::RequireApproval {
                    method,
                    timeout_secs,
                    reason: c.description().to_string(),
                    constraint_id: Some(c.id().to_string()),
                },
                format!("supervised constraint {} matched", c.id()),
            );
        }

        let mut skipped = Vec::new();
        for c in self.store.autonomous().iter().filter(|c| c.matches(op)) {
            let unmet = c.unmet_prerequisites(op);
            if unmet.is_empty() {
                return (
                    Decision::Allow {
                        constraint_id: c.id().to_string(),
                    },
                    format!("autonomous constraint {} satisfied", c.id()),
                );
            }
            debug!(constraint = %c.id(), unmet = ?unmet, "autonomous prerequisites unmet");
            skipped.push(c.id().to_string());
        }

        let detail = if skipped.is_empty() {
            "unclassified operation".to_string()
        } else {
            format!("prerequisites unmet for {}", skipped.join(", "))
        };
        (
            Decision::RequireApproval {
                method: self.default_approval.method.clone(),
                timeout_secs: self.default_approval.timeout_secs,
                reason: detail.clone(),
                constraint_id: None,
            },
            detail,
        )
    }

    /// Engage the emergency stop. Always permitted; audited.
    pub async fn engage_emergency_stop(
        &self,
        actor: &Actor,
        reason: &str,
    ) -> ConstitutionResult<()> {
        self.emergency_stop.store(true, Ordering::SeqCst);
        let op = Operation::builder(OperationKind::SetEmergencyStop, actor.clone())
            .target("emergency_stop")
            .payload(serde_json::json!({ "reason": reason }))
            .build();
        let decision = Decision::Allow {
            constraint_id: EMERGENCY_STOP_ID.to_string(),
        };
        self.audit
            .record(&op, &decision, format!("emergency stop engaged: {reason}"))
            .await?;
        obs::emit_emergency_stop(true, &actor.to_string(), reason);
        Ok(())
    }

    /// Clear the emergency stop if `op` is allowed to. Returns the decision.
    pub async fn clear_emergency_stop(&self, op: &Operation) -> ConstitutionResult<Decision> {
        let decision = self.check(op).await?;
        if decision.is_allow() && *op.kind() == OperationKind::ClearEmergencyStop {
            self.emergency_stop.store(false, Ordering::SeqCst);
            obs::emit_emergency_stop(false, &op.actor().to_string(), "cleared");
        } else {
            warn!(decision = %decision, "emergency stop not cleared");
        }
        Ok(decision)
    }
}
