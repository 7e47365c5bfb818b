//! Constitutional safety layer.
//!
//! - [`ConstraintStore`]: verified rule set, loaded once per process
//! - [`ConstitutionEngine`]: ALLOW / DENY / REQUIRE_APPROVAL per operation,
//!   one audit entry per decision, emergency stop
//! - [`approval`]: gateways that collect human votes

pub mod approval;
pub mod constraint;
pub mod engine;
pub mod error;
pub mod store;

pub use approval::{
    request_approval, resolve_votes, ApprovalGateway, ApprovalOutcome, ApprovalRequest,
    ApprovalVote, FileApprovalGateway, StaticGateway, VoteDecision,
};
pub use constraint::{
    Constraint, ConstraintAction, ConstraintCategory, ConstraintDef, Detector, DetectorDef,
    Prerequisite, TESTS_PASSED,
};
pub use engine::{ConstitutionEngine, DefaultApproval, EMERGENCY_STOP_ID};
pub use error::{ConstitutionError, ConstitutionResult};
pub use store::{seal, ConstitutionDocument, ConstraintStore, RuleSet};
