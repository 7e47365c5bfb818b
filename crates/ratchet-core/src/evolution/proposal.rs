//! Improvement proposals.
//!
//! A cycle assembles its proposal in a [`ProposalDraft`] and freezes it
//! exactly once with a terminal status. The frozen
//! [`ImprovementProposal`] has no setters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Decision, Patch};
use crate::sandbox::SandboxExecutionResult;

use super::hacking::HackingFlag;
use super::state::CycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Archived,
    Discarded,
    Quarantined,
}

/// One step of the cycle's reasoning, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stage: CycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    pub note: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementProposal {
    id: String,
    cycle_id: String,
    base_version_id: Option<String>,
    diff: Patch,
    rationale: String,
    baseline_score: Option<f64>,
    candidate_score: Option<f64>,
    sandbox_result: Option<SandboxExecutionResult>,
    decision_trace: Vec<TraceEntry>,
    hacking_flags: Vec<HackingFlag>,
    status: ProposalStatus,
    reason: Option<String>,
}

impl ImprovementProposal {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    pub fn base_version_id(&self) -> Option<&str> {
        self.base_version_id.as_deref()
    }

    pub fn diff(&self) -> &Patch {
        &self.diff
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn baseline_score(&self) -> Option<f64> {
        self.baseline_score
    }

    pub fn candidate_score(&self) -> Option<f64> {
        self.candidate_score
    }

    pub fn sandbox_result(&self) -> Option<&SandboxExecutionResult> {
        self.sandbox_result.as_ref()
    }

    pub fn decision_trace(&self) -> &[TraceEntry] {
        &self.decision_trace
    }

    pub fn hacking_flags(&self) -> &[HackingFlag] {
        &self.hacking_flags
    }

    pub fn status(&self) -> ProposalStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Mutable while the cycle runs; consumed by [`ProposalDraft::freeze`].
#[derive(Debug, Clone)]
pub(crate) struct ProposalDraft {
    pub id: String,
    pub cycle_id: String,
    pub base_version_id: Option<String>,
    pub diff: Patch,
    pub rationale: String,
    pub baseline_score: Option<f64>,
    pub candidate_score: Option<f64>,
    pub sandbox_result: Option<SandboxExecutionResult>,
    pub hacking_flags: Vec<HackingFlag>,
    trace: Vec<TraceEntry>,
}

impl ProposalDraft {
    pub fn new(cycle_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cycle_id: cycle_id.to_string(),
            base_version_id: None,
            diff: Patch::default(),
            rationale: String::new(),
            baseline_score: None,
            candidate_score: None,
            sandbox_result: None,
            hacking_flags: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn note(&mut self, stage: CycleState, note: impl Into<String>) {
        self.trace.push(TraceEntry {
            stage,
            operation_id: None,
            decision: None,
            note: note.into(),
            at: Utc::now(),
        });
    }

    pub fn decision(
        &mut self,
        stage: CycleState,
        operation_id: String,
        decision: &Decision,
        note: impl Into<String>,
    ) {
        self.trace.push(TraceEntry {
            stage,
            operation_id: Some(operation_id),
            decision: Some(decision.clone()),
            note: note.into(),
            at: Utc::now(),
        });
    }

    pub fn freeze(self, status: ProposalStatus, reason: Option<String>) -> ImprovementProposal {
        ImprovementProposal {
            id: self.id,
            cycle_id: self.cycle_id,
            base_version_id: self.base_version_id,
            diff: self.diff,
            rationale: self.rationale,
            baseline_score: self.baseline_score,
            candidate_score: self.candidate_score,
            sandbox_result: self.sandbox_result,
            decision_trace: self.trace,
            hacking_flags: self.hacking_flags,
            status,
            reason,
        }
    }
}
