//! Evolution controller.
//!
//! Drives one improvement cycle at a time:
//!
//! ```text
//! IDLE → BASELINE → PROPOSE → CONSTITUTION_CHECK → SANDBOX_TEST
//!      → CANDIDATE_BENCHMARK → DECIDE → ARCHIVE | DISCARD → IDLE
//! ```
//!
//! The cycle state sits behind a FIFO-fair `tokio::sync::Mutex`: a second
//! `start_cycle` queues until the first is back in IDLE, and rollback,
//! quarantine disposition and clearing the emergency stop take the same
//! lock. The emergency stop is checked before every forward transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ratchet_state::{
    ArchivedVersion, Disposition, DispositionVerdict, ProposalLedger, ProposalOutcome,
    ProposalRecord, VersionId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{info, warn, Instrument};

use crate::archive::{ArchiveError, ImprovementArchive};
use crate::benchmark::{BenchmarkSuite, BenchmarkTarget, SuiteReport};
use crate::constitution::{
    request_approval, ApprovalGateway, ApprovalOutcome, ApprovalRequest, ConstitutionEngine,
    TESTS_PASSED,
};
use crate::domain::{Actor, Decision, Operation, OperationKind, RatchetError, Snapshot};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{Sandbox, SandboxLimits, SandboxRequest, SandboxTask};

use super::error::{EvolutionError, EvolutionResult};
use super::hacking::{CandidateEvidence, HackingDetector, HackingFlag};
use super::proposal::{ImprovementProposal, ProposalDraft, ProposalStatus};
use super::proposer::{FailureAnalysis, ProposalCollaborator, ProposalContext};
use super::state::CycleState;

/// Actor id the controller uses for its own operations.
pub const CONTROLLER_ACTOR: &str = "ratchet-controller";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Task run against the candidate in SANDBOX_TEST.
    pub test_task: SandboxTask,
    pub test_limits: SandboxLimits,
    /// Upper bound on waiting for a human approval inside a cycle.
    pub approval_wait_secs: u64,
    /// Actor id recorded for proposer-originated operations.
    pub proposer_id: String,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            test_task: SandboxTask::command(["sh", "run_tests.sh"]),
            test_limits: SandboxLimits::default(),
            approval_wait_secs: 300,
            proposer_id: "proposer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscardReason {
    ProposerFailed { detail: String },
    ConstitutionDenied {
        reason: String,
        constraint_id: Option<String>,
    },
    ApprovalNotGranted { detail: String },
    InvalidPatch { detail: String },
    SandboxFailed { detail: String },
    Regression { baseline: f64, candidate: f64 },
    InsufficientImprovement { baseline: f64, candidate: f64 },
    ArchiveRejected { detail: String },
    Cancelled,
    EmergencyStop,
    Error { detail: String },
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::ProposerFailed { detail } => write!(f, "proposer failed: {detail}"),
            DiscardReason::ConstitutionDenied { reason, .. } => write!(f, "denied: {reason}"),
            DiscardReason::ApprovalNotGranted { detail } => {
                write!(f, "approval not granted: {detail}")
            }
            DiscardReason::InvalidPatch { detail } => write!(f, "invalid patch: {detail}"),
            DiscardReason::SandboxFailed { detail } => write!(f, "sandbox test failed: {detail}"),
            DiscardReason::Regression {
                baseline,
                candidate,
            } => write!(f, "regression {baseline:.4} -> {candidate:.4}"),
            DiscardReason::InsufficientImprovement {
                baseline,
                candidate,
            } => write!(f, "insufficient improvement {baseline:.4} -> {candidate:.4}"),
            DiscardReason::ArchiveRejected { detail } => write!(f, "archive rejected: {detail}"),
            DiscardReason::Cancelled => f.write_str("cancelled"),
            DiscardReason::EmergencyStop => f.write_str("emergency stop"),
            DiscardReason::Error { detail } => write!(f, "error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Archived { version_id: String },
    Discarded { reason: DiscardReason },
    Quarantined { flags: Vec<HackingFlag> },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Archived { .. } => "archived",
            CycleOutcome::Discarded { .. } => "discarded",
            CycleOutcome::Quarantined { .. } => "quarantined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub outcome: CycleOutcome,
    pub proposal: ImprovementProposal,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub from: String,
    pub to: String,
}

/// Archived versions, oldest first, and the current head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionListing {
    pub current: Option<VersionId>,
    pub versions: Vec<ArchivedVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecheckReport {
    Healthy { version_id: String, score: f64 },
    RolledBack {
        score: f64,
        rollback: RollbackReport,
    },
    RollbackRefused {
        score: f64,
        target: String,
        reason: String,
    },
    NoHealthyAncestor { version_id: String, score: f64 },
}

/// Where a cycle ended up before the terminal bookkeeping.
enum Conclusion {
    Archive(ArchivedVersion),
    Discard(DiscardReason),
    Quarantine(Vec<HackingFlag>),
}

/// Result of putting an operation through the engine (and, if asked, the
/// approval gateway).
enum Authorization {
    Granted,
    Refused(DiscardReason),
}

/// Everything the controller drives.
pub struct ControllerParts {
    pub engine: Arc<ConstitutionEngine>,
    pub sandbox: Arc<dyn Sandbox>,
    pub suite: Arc<BenchmarkSuite>,
    pub archive: ImprovementArchive,
    pub ledger: Arc<dyn ProposalLedger>,
    pub proposer: Arc<dyn ProposalCollaborator>,
    pub gateway: Arc<dyn ApprovalGateway>,
    pub hacking: HackingDetector,
    pub settings: EvolutionSettings,
}

pub struct EvolutionController {
    engine: Arc<ConstitutionEngine>,
    sandbox: Arc<dyn Sandbox>,
    suite: Arc<BenchmarkSuite>,
    archive: ImprovementArchive,
    ledger: Arc<dyn ProposalLedger>,
    proposer: Arc<dyn ProposalCollaborator>,
    gateway: Arc<dyn ApprovalGateway>,
    hacking: HackingDetector,
    settings: EvolutionSettings,
    actor: Actor,
    state: Mutex<CycleState>,
    state_tx: watch::Sender<CycleState>,
    cancel: AtomicBool,
}

impl EvolutionController {
    pub fn new(parts: ControllerParts) -> Self {
        let (state_tx, _) = watch::channel(CycleState::Idle);
        Self {
            engine: parts.engine,
            sandbox: parts.sandbox,
            suite: parts.suite,
            archive: parts.archive,
            ledger: parts.ledger,
            proposer: parts.proposer,
            gateway: parts.gateway,
            hacking: parts.hacking,
            settings: parts.settings,
            actor: Actor::system(CONTROLLER_ACTOR),
            state: Mutex::new(CycleState::Idle),
            state_tx,
            cancel: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<ConstitutionEngine> {
        &self.engine
    }

    pub fn archive(&self) -> &ImprovementArchive {
        &self.archive
    }

    pub fn suite(&self) -> &Arc<BenchmarkSuite> {
        &self.suite
    }

    pub fn ledger(&self) -> &Arc<dyn ProposalLedger> {
        &self.ledger
    }

    /// Last published cycle state.
    pub fn state(&self) -> CycleState {
        *self.state_tx.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state_tx.subscribe()
    }

    /// Ask the running cycle to stop at its next PROPOSE or SANDBOX_TEST
    /// boundary. Work already in the sandbox is bounded by its timeout.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    // -- transitions --------------------------------------------------------

    fn set_state(
        &self,
        guard: &mut MutexGuard<'_, CycleState>,
        cycle_id: &str,
        to: CycleState,
    ) -> EvolutionResult<()> {
        let from = **guard;
        if !from.can_transition_to(to) {
            return Err(EvolutionError::IllegalTransition { from, to });
        }
        **guard = to;
        self.state_tx.send_replace(to);
        obs::emit_transition(cycle_id, from.as_str(), to.as_str());
        Ok(())
    }

    /// Forward transition; refused while the emergency stop is engaged.
    fn step(
        &self,
        guard: &mut MutexGuard<'_, CycleState>,
        cycle_id: &str,
        to: CycleState,
    ) -> EvolutionResult<()> {
        if self.engine.is_emergency_stopped() {
            return Err(EvolutionError::EmergencyStop);
        }
        self.set_state(guard, cycle_id, to)
    }

    fn cancelled(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    // -- authorization ------------------------------------------------------

    async fn authorize(
        &self,
        op: &Operation,
        stage: CycleState,
        draft: Option<&mut ProposalDraft>,
    ) -> EvolutionResult<Authorization> {
        let decision = self.engine.check(op).await?;
        let (auth, note) = match &decision {
            Decision::Allow { .. } => (Authorization::Granted, format!("{} allowed", op.kind().as_str())),
            Decision::Deny {
                reason,
                constraint_id,
            } => (
                Authorization::Refused(DiscardReason::ConstitutionDenied {
                    reason: reason.clone(),
                    constraint_id: constraint_id.clone(),
                }),
                format!("{} denied: {reason}", op.kind().as_str()),
            ),
            Decision::RequireApproval { .. } => {
                let outcome = match ApprovalRequest::from_decision(op, &decision) {
                    Some(request) => {
                        let wait = Duration::from_secs(self.settings.approval_wait_secs);
                        request_approval(self.gateway.as_ref(), &request, wait).await?
                    }
                    None => ApprovalOutcome::TimedOut,
                };
                let detail = describe_approval(&outcome);
                if outcome.is_approved() {
                    (Authorization::Granted, format!("{} approved: {detail}", op.kind().as_str()))
                } else {
                    (
                        Authorization::Refused(DiscardReason::ApprovalNotGranted {
                            detail: detail.clone(),
                        }),
                        format!("{} not approved: {detail}", op.kind().as_str()),
                    )
                }
            }
        };
        if let Some(draft) = draft {
            draft.decision(stage, op.id().to_string(), &decision, note);
        }
        Ok(auth)
    }

    // -- cycle --------------------------------------------------------------

    /// Run one improvement cycle. Waits for any running cycle, rollback or
    /// disposition to finish first.
    pub async fn start_cycle(&self) -> EvolutionResult<CycleReport> {
        let mut guard = self.state.lock().await;
        if self.engine.is_emergency_stopped() {
            return Err(EvolutionError::EmergencyStop);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut draft = ProposalDraft::new(&cycle_id);
        METRICS.inc_cycles_started();

        let span = obs::cycle_span(&cycle_id);
        let driven = self
            .drive(&mut guard, &cycle_id, &mut draft)
            .instrument(span)
            .await;

        let (conclusion, failure) = match driven {
            Ok(c) => (c, None),
            Err(EvolutionError::EmergencyStop) => (Conclusion::Discard(DiscardReason::EmergencyStop), None),
            Err(e) => {
                warn!(cycle_id = %cycle_id, error = %e, "cycle aborted");
                (
                    Conclusion::Discard(DiscardReason::Error {
                        detail: e.to_string(),
                    }),
                    Some(e),
                )
            }
        };

        let report = self
            .finish(&mut guard, &cycle_id, draft, conclusion, started)
            .await;
        match (failure, report) {
            (Some(e), _) => Err(e),
            (None, report) => report,
        }
    }

    async fn drive(
        &self,
        guard: &mut MutexGuard<'_, CycleState>,
        cycle_id: &str,
        draft: &mut ProposalDraft,
    ) -> EvolutionResult<Conclusion> {
        // BASELINE
        self.step(guard, cycle_id, CycleState::Baseline)?;
        let current = self.archive.current().await?;
        obs::emit_cycle_started(cycle_id, current.id.as_str());
        draft.base_version_id = Some(current.id.to_string());
        let base = self.archive.materialize(&current.id).await?;
        let baseline = self.suite.run(&BenchmarkTarget::new(&base));
        draft.baseline_score = Some(baseline.aggregate);
        draft.note(
            CycleState::Baseline,
            format!("baseline {:.4} on {}", baseline.aggregate, current.id),
        );

        // PROPOSE
        self.step(guard, cycle_id, CycleState::Propose)?;
        if self.cancelled() {
            return Ok(Conclusion::Discard(DiscardReason::Cancelled));
        }
        let context = ProposalContext {
            base_version_id: current.id.to_string(),
            failure_analysis: FailureAnalysis::from_report(&baseline),
            baseline: baseline.clone(),
            files: base.clone(),
        };
        let change = match self.proposer.propose(&context).await {
            Ok(change) => change,
            Err(e) => {
                return Ok(Conclusion::Discard(DiscardReason::ProposerFailed {
                    detail: e.to_string(),
                }))
            }
        };
        if change.diff.is_empty() {
            return Ok(Conclusion::Discard(DiscardReason::ProposerFailed {
                detail: "empty diff".to_string(),
            }));
        }
        draft.diff = change.diff;
        draft.rationale = change.rationale;
        draft.note(
            CycleState::Propose,
            format!("{} edit(s) proposed", draft.diff.edits.len()),
        );

        // CONSTITUTION_CHECK
        self.step(guard, cycle_id, CycleState::ConstitutionCheck)?;
        let patch_op = Operation::builder(
            OperationKind::ApplyPatch,
            Actor::agent(self.settings.proposer_id.clone()),
        )
        .target(current.id.to_string())
        .payload(serde_json::json!({
            "proposal_id": draft.id,
            "diff": draft.diff,
            "rationale": draft.rationale,
        }))
        .build();
        if let Authorization::Refused(reason) = self
            .authorize(&patch_op, CycleState::ConstitutionCheck, Some(&mut *draft))
            .await?
        {
            return Ok(Conclusion::Discard(reason));
        }

        // SANDBOX_TEST
        self.step(guard, cycle_id, CycleState::SandboxTest)?;
        if self.cancelled() {
            return Ok(Conclusion::Discard(DiscardReason::Cancelled));
        }
        let candidate = match draft.diff.apply(&base) {
            Ok(c) => c,
            Err(e) => {
                return Ok(Conclusion::Discard(DiscardReason::InvalidPatch {
                    detail: e.to_string(),
                }))
            }
        };
        let request =
            SandboxRequest::new(self.settings.test_task.clone()).with_files(candidate.clone());
        let result = match self
            .sandbox
            .execute(&request, &self.settings.test_limits)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(Conclusion::Discard(DiscardReason::SandboxFailed {
                    detail: e.to_string(),
                }))
            }
        };
        let passed = result.success && result.violations.is_empty();
        let summary = sandbox_summary(result.exit.code, result.timed_out(), result.violations.len());
        draft.note(CycleState::SandboxTest, summary.clone());
        let stdout = result.stdout.clone();
        draft.sandbox_result = Some(result);
        if !passed {
            return Ok(Conclusion::Discard(DiscardReason::SandboxFailed { detail: summary }));
        }

        // CANDIDATE_BENCHMARK
        self.step(guard, cycle_id, CycleState::CandidateBenchmark)?;
        let candidate_report = self
            .suite
            .run(&BenchmarkTarget::new(&candidate).with_sandbox_stdout(&stdout));
        draft.candidate_score = Some(candidate_report.aggregate);
        draft.note(
            CycleState::CandidateBenchmark,
            format!("candidate {:.4}", candidate_report.aggregate),
        );

        // DECIDE
        self.step(guard, cycle_id, CycleState::Decide)?;
        let conclusion = self.decide(
            &base,
            &candidate,
            &baseline,
            &candidate_report,
            &stdout,
            draft,
        );
        if let Some(conclusion) = conclusion {
            return Ok(conclusion);
        }

        let archive_op = Operation::builder(OperationKind::ArchiveVersion, self.actor.clone())
            .target(current.id.to_string())
            .payload(serde_json::json!({
                "proposal_id": draft.id,
                "baseline_score": baseline.aggregate,
                "candidate_score": candidate_report.aggregate,
            }))
            .attest(TESTS_PASSED)
            .build();
        if let Authorization::Refused(reason) = self
            .authorize(&archive_op, CycleState::Decide, Some(&mut *draft))
            .await?
        {
            return Ok(Conclusion::Discard(reason));
        }

        // ARCHIVE
        self.step(guard, cycle_id, CycleState::Archive)?;
        match self
            .archive
            .advance(
                guard,
                &current.id,
                &draft.diff,
                candidate_report.aggregate,
                &draft.id,
            )
            .await
        {
            Ok(version) => Ok(Conclusion::Archive(version)),
            Err(e @ (ArchiveError::StaleBase { .. } | ArchiveError::Regression { .. })) => {
                Ok(Conclusion::Discard(DiscardReason::ArchiveRejected {
                    detail: e.to_string(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Score gate and objective-hacking heuristics. `None` means the
    /// candidate may proceed to the archive check.
    fn decide(
        &self,
        base: &Snapshot,
        candidate: &Snapshot,
        baseline: &SuiteReport,
        candidate_report: &SuiteReport,
        sandbox_stdout: &str,
        draft: &mut ProposalDraft,
    ) -> Option<Conclusion> {
        let safety_probes = self.suite.tagged(&self.hacking.config().safety_tag);
        let flags = self.hacking.inspect(&CandidateEvidence {
            base,
            candidate,
            patch: &draft.diff,
            baseline,
            candidate_report,
            safety_probes: &safety_probes,
            sandbox_stdout,
        });
        if !flags.is_empty() {
            let listed: Vec<String> = flags.iter().map(ToString::to_string).collect();
            draft.note(CycleState::Decide, format!("flagged: {}", listed.join("; ")));
            draft.hacking_flags = flags.clone();
            return Some(Conclusion::Quarantine(flags));
        }

        let verdict = self
            .archive
            .policy()
            .evaluate(baseline.aggregate, candidate_report.aggregate);
        if !verdict.passed() {
            let reasons: Vec<&str> = verdict.violations.iter().map(|v| v.reason.as_str()).collect();
            draft.note(CycleState::Decide, reasons.join("; "));
            let (b, c) = (baseline.aggregate, candidate_report.aggregate);
            return Some(Conclusion::Discard(if verdict.is_regression() {
                DiscardReason::Regression {
                    baseline: b,
                    candidate: c,
                }
            } else {
                DiscardReason::InsufficientImprovement {
                    baseline: b,
                    candidate: c,
                }
            }));
        }
        draft.note(CycleState::Decide, "improvement accepted");
        None
    }

    async fn finish(
        &self,
        guard: &mut MutexGuard<'_, CycleState>,
        cycle_id: &str,
        draft: ProposalDraft,
        conclusion: Conclusion,
        started: Instant,
    ) -> EvolutionResult<CycleReport> {
        let (outcome, status, reason) = match conclusion {
            Conclusion::Archive(version) => {
                METRICS.inc_archived();
                (
                    CycleOutcome::Archived {
                        version_id: version.id.to_string(),
                    },
                    ProposalStatus::Archived,
                    None,
                )
            }
            Conclusion::Discard(reason) => {
                METRICS.inc_discarded();
                let text = reason.to_string();
                (
                    CycleOutcome::Discarded { reason },
                    ProposalStatus::Discarded,
                    Some(text),
                )
            }
            Conclusion::Quarantine(flags) => {
                METRICS.inc_quarantined();
                let text = flags
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                (
                    CycleOutcome::Quarantined { flags },
                    ProposalStatus::Quarantined,
                    Some(text),
                )
            }
        };

        if !matches!(**guard, CycleState::Idle | CycleState::Discard)
            && status != ProposalStatus::Archived
        {
            self.set_state(guard, cycle_id, CycleState::Discard)?;
        }

        let proposal = draft.freeze(status, reason.clone());
        let recorded: EvolutionResult<()> = match serde_json::to_value(&proposal) {
            Ok(payload) => self
                .ledger
                .record(ProposalRecord {
                    proposal_id: proposal.id().to_string(),
                    outcome: match status {
                        ProposalStatus::Archived => ProposalOutcome::Archived,
                        ProposalStatus::Discarded => ProposalOutcome::Discarded,
                        ProposalStatus::Quarantined => ProposalOutcome::Quarantined,
                    },
                    reason,
                    payload,
                    recorded_at: Utc::now(),
                    disposition: None,
                })
                .await
                .map_err(Into::into),
            Err(e) => Err(RatchetError::from(e).into()),
        };

        if **guard != CycleState::Idle {
            self.set_state(guard, cycle_id, CycleState::Idle)?;
        }
        recorded?;

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_cycle_finished(cycle_id, outcome.label(), duration_ms);
        Ok(CycleReport {
            cycle_id: cycle_id.to_string(),
            outcome,
            proposal,
            duration_ms,
        })
    }

    // -- rollback -----------------------------------------------------------

    /// Move the current pointer back to `to`, an ancestor of current.
    /// Passes through the engine; the approval gateway is consulted when the
    /// engine requires approval. Rolling back to current is a no-op.
    pub async fn rollback(&self, to: &VersionId, actor: Actor) -> EvolutionResult<RollbackReport> {
        let guard = self.state.lock().await;
        self.rollback_locked(&guard, to, actor).await
    }

    async fn rollback_locked(
        &self,
        guard: &MutexGuard<'_, CycleState>,
        to: &VersionId,
        actor: Actor,
    ) -> EvolutionResult<RollbackReport> {
        let current = self.archive.current().await?;
        // Validate the target before asking anyone to approve it.
        self.archive.get(to).await?;
        let op = Operation::builder(OperationKind::Rollback, actor.clone())
            .target(to.to_string())
            .payload(serde_json::json!({ "from": current.id, "to": to }))
            .build();
        if let Authorization::Refused(reason) = self.authorize(&op, CycleState::Idle, None).await? {
            return Err(EvolutionError::Denied(reason.to_string()));
        }
        let from = self.archive.rewind(guard, to).await?;
        obs::emit_rollback(from.as_str(), to.as_str(), &actor.to_string());
        Ok(RollbackReport {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// List the archive for `actor`. Reading is an operation like any other:
    /// it passes through the engine and, when approval is required, the
    /// gateway. Does not wait for a running cycle.
    pub async fn list_versions(&self, actor: Actor) -> EvolutionResult<VersionListing> {
        let op = Operation::builder(OperationKind::ListVersions, actor)
            .target("archive")
            .build();
        if let Authorization::Refused(reason) = self.authorize(&op, CycleState::Idle, None).await? {
            return Err(EvolutionError::Denied(reason.to_string()));
        }
        Ok(VersionListing {
            current: self.archive.head().await?,
            versions: self.archive.list().await?,
        })
    }

    /// Re-benchmark the current version. On regression against its accepted
    /// score, propose a rollback to the newest ancestor that still scores
    /// within tolerance of its own accepted score.
    pub async fn recheck_current(&self) -> EvolutionResult<RecheckReport> {
        let guard = self.state.lock().await;
        let current = self.archive.current().await?;
        let score = self.score(&current.id).await?;
        let policy = *self.archive.policy();
        if !policy.is_regression(score, current.accepted_score) {
            return Ok(RecheckReport::Healthy {
                version_id: current.id.to_string(),
                score,
            });
        }
        warn!(
            version = %current.id,
            accepted = current.accepted_score,
            score,
            "current version regressed"
        );

        let lineage = self.archive.lineage(&current.id).await?;
        for ancestor in lineage.iter().rev().skip(1) {
            let s = self.score(&ancestor.id).await?;
            if policy.is_regression(s, ancestor.accepted_score) {
                continue;
            }
            return match self
                .rollback_locked(&guard, &ancestor.id, self.actor.clone())
                .await
            {
                Ok(rollback) => Ok(RecheckReport::RolledBack { score, rollback }),
                Err(EvolutionError::Denied(reason)) => Ok(RecheckReport::RollbackRefused {
                    score,
                    target: ancestor.id.to_string(),
                    reason,
                }),
                Err(e) => Err(e),
            };
        }
        Ok(RecheckReport::NoHealthyAncestor {
            version_id: current.id.to_string(),
            score,
        })
    }

    async fn score(&self, id: &VersionId) -> EvolutionResult<f64> {
        let snapshot = self.archive.materialize(id).await?;
        Ok(self.suite.run(&BenchmarkTarget::new(&snapshot)).aggregate)
    }

    // -- quarantine ---------------------------------------------------------

    pub async fn quarantined(&self) -> EvolutionResult<Vec<ProposalRecord>> {
        Ok(self.ledger.list(Some(ProposalOutcome::Quarantined)).await?)
    }

    /// Record a human's verdict on a quarantined proposal.
    pub async fn dispose_quarantined(
        &self,
        proposal_id: &str,
        actor: Actor,
        verdict: DispositionVerdict,
        note: Option<String>,
    ) -> EvolutionResult<ProposalRecord> {
        if !actor.is_human() {
            return Err(EvolutionError::HumanRequired("quarantine disposition"));
        }
        let _guard = self.state.lock().await;
        let op = Operation::builder(OperationKind::DisposeQuarantine, actor.clone())
            .target(proposal_id)
            .payload(serde_json::json!({ "verdict": verdict, "note": note }))
            .build();
        if let Authorization::Refused(reason) = self.authorize(&op, CycleState::Idle, None).await? {
            return Err(EvolutionError::Denied(reason.to_string()));
        }
        let record = self
            .ledger
            .set_disposition(
                proposal_id,
                Disposition {
                    verdict,
                    decided_by: actor.to_string(),
                    note,
                    decided_at: Utc::now(),
                },
            )
            .await?;
        info!(proposal_id, verdict = ?verdict, actor = %actor, "quarantine disposed");
        Ok(record)
    }

    // -- emergency stop -----------------------------------------------------

    /// Engage immediately; a running cycle halts at its next transition.
    pub async fn engage_emergency_stop(&self, actor: &Actor, reason: &str) -> EvolutionResult<()> {
        Ok(self.engine.engage_emergency_stop(actor, reason).await?)
    }

    /// Clear under the cycle lock. Only a human actor can be allowed.
    pub async fn clear_emergency_stop(&self, actor: Actor) -> EvolutionResult<Decision> {
        let _guard = self.state.lock().await;
        let op = Operation::builder(OperationKind::ClearEmergencyStop, actor)
            .target("emergency_stop")
            .build();
        Ok(self.engine.clear_emergency_stop(&op).await?)
    }
}

fn describe_approval(outcome: &ApprovalOutcome) -> String {
    match outcome {
        ApprovalOutcome::Approved { approvers } => format!("approved by {}", approvers.join(", ")),
        ApprovalOutcome::Rejected { by, reason } => format!("rejected by {by}: {reason}"),
        ApprovalOutcome::Insufficient { approvals, required } => {
            format!("{approvals} of {required} approvals")
        }
        ApprovalOutcome::TimedOut => "timed out".to_string(),
    }
}

fn sandbox_summary(code: Option<i32>, timed_out: bool, violations: usize) -> String {
    if timed_out {
        return format!("timed out ({violations} violation(s))");
    }
    match code {
        Some(c) => format!("exit {c}, {violations} violation(s)"),
        None => format!("killed by signal, {violations} violation(s)"),
    }
}
