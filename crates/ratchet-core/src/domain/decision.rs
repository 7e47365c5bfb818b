//! Constitution decisions.

use serde::{Deserialize, Serialize};

/// How a `RequireApproval` decision must be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalMethod {
    /// A single human reviewer.
    HumanReview,
    /// At least `approvals` distinct human approvals.
    Quorum { approvals: u32 },
}

impl Default for ApprovalMethod {
    fn default() -> Self {
        ApprovalMethod::HumanReview
    }
}

impl std::fmt::Display for ApprovalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalMethod::HumanReview => f.write_str("human_review"),
            ApprovalMethod::Quorum { approvals } => write!(f, "quorum({approvals})"),
        }
    }
}

/// Outcome of evaluating one operation. Produced fresh for every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        /// Autonomous rule that allowed the operation.
        constraint_id: String,
    },
    Deny {
        reason: String,
        /// `None` when denied by the emergency stop.
        constraint_id: Option<String>,
    },
    RequireApproval {
        method: ApprovalMethod,
        timeout_secs: u64,
        reason: String,
        /// `None` for unclassified operations.
        constraint_id: Option<String>,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow { .. } => "allow",
            Decision::Deny { .. } => "deny",
            Decision::RequireApproval { .. } => "require_approval",
        }
    }

    pub fn constraint_id(&self) -> Option<&str> {
        match self {
            Decision::Allow { constraint_id } => Some(constraint_id),
            Decision::Deny { constraint_id, .. }
            | Decision::RequireApproval { constraint_id, .. } => constraint_id.as_deref(),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow { constraint_id } => write!(f, "ALLOW ({constraint_id})"),
            Decision::Deny { reason, .. } => write!(f, "DENY: {reason}"),
            Decision::RequireApproval {
                method,
                timeout_secs,
                reason,
                ..
            } => write!(
                f,
                "REQUIRE_APPROVAL via {method} within {timeout_secs}s: {reason}"
            ),
        }
    }
}
