//! Evolution controller and the pieces a cycle is made of.
//!
//! - [`state`]: the cycle state machine
//! - [`proposer`]: proposal collaborators (external command, static)
//! - [`hacking`]: objective-hacking heuristics
//! - [`proposal`]: proposals and their decision trace
//! - [`controller`]: the cycle driver, rollback, quarantine and emergency stop

pub mod controller;
pub mod error;
pub mod hacking;
pub mod proposal;
pub mod proposer;
pub mod state;

pub use controller::{
    ControllerParts, CycleOutcome, CycleReport, DiscardReason, EvolutionController,
    EvolutionSettings, RecheckReport, RollbackReport, VersionListing, CONTROLLER_ACTOR,
};
pub use error::{EvolutionError, EvolutionResult};
pub use hacking::{CandidateEvidence, HackingConfig, HackingDetector, HackingFlag};
pub use proposal::{ImprovementProposal, ProposalStatus, TraceEntry};
pub use proposer::{
    CommandProposer, FailedProbe, FailureAnalysis, ProposalCollaborator, ProposalContext,
    ProposedChange, ProposerError, StaticProposer,
};
pub use state::CycleState;
