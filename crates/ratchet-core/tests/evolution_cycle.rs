//! End-to-end improvement cycles against in-memory storage.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    passing_tests, proposer, write, FakeSandbox, Harness, Setup, BARREN_SUITE, MARKER_SUITE,
    STRICT_SUITE,
};
use ratchet_core::constitution::StaticGateway;
use ratchet_core::domain::{Actor, FileEdit, Patch};
use ratchet_core::evolution::{
    CycleOutcome, CycleState, DiscardReason, EvolutionController, EvolutionError, HackingFlag,
    ProposalCollaborator, ProposalContext, ProposalStatus, ProposedChange, ProposerError,
    RecheckReport,
};
use ratchet_state::{DispositionVerdict, ProposalOutcome};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

async fn audited_kinds(h: &Harness) -> Vec<(String, String)> {
    h.engine
        .audit()
        .entries(None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| {
            (
                e.operation["kind"].as_str().unwrap_or_default().to_string(),
                e.decision["verdict"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn improvement_is_archived_and_head_advances() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    let report = h.controller.start_cycle().await.unwrap();

    let version_id = match &report.outcome {
        CycleOutcome::Archived { version_id } => version_id.clone(),
        other => panic!("expected archive, got {other:?}"),
    };
    let current = h.controller.archive().current().await.unwrap();
    assert_eq!(current.id.as_str(), version_id);
    assert_eq!(current.parent_id.as_ref(), Some(&h.genesis.id));
    assert!(approx(current.accepted_score, 0.83));

    let proposal = &report.proposal;
    assert_eq!(proposal.status(), ProposalStatus::Archived);
    assert!(approx(proposal.baseline_score().unwrap(), 0.80));
    assert!(approx(proposal.candidate_score().unwrap(), 0.83));
    assert!(proposal
        .decision_trace()
        .iter()
        .any(|t| t.stage == CycleState::ConstitutionCheck && t.decision.is_some()));

    let audited = audited_kinds(&h).await;
    assert!(audited.contains(&("apply_patch".to_string(), "allow".to_string())));
    assert!(audited.contains(&("archive_version".to_string(), "allow".to_string())));
    assert_eq!(h.controller.state(), CycleState::Idle);

    let ledger = h.controller.ledger().list(None).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].outcome, ProposalOutcome::Archived);
}

#[tokio::test]
async fn small_drop_is_discarded_and_head_stays() {
    let h = Harness::with_proposer(passing_tests(19)).await;
    let report = h.controller.start_cycle().await.unwrap();

    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::InsufficientImprovement { .. }
        }
    ));
    assert!(approx(report.proposal.candidate_score().unwrap(), 0.79));
    let current = h.controller.archive().current().await.unwrap();
    assert_eq!(current.id, h.genesis.id);
    assert_eq!(h.controller.state(), CycleState::Idle);
}

#[tokio::test]
async fn large_drop_is_a_regression() {
    let patch = Patch::new(vec![FileEdit::Delete {
        path: "agent.py".to_string(),
    }]);
    let h = Harness::with_proposer(patch).await;
    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::Regression { .. }
        }
    ));
    assert_eq!(h.controller.archive().list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn immutable_deny_never_reaches_the_sandbox() {
    let sandbox = Arc::new(FakeSandbox::passing());
    let mut setup = Setup::new(proposer(write(
        "config.env",
        "AWS_SECRET_ACCESS_KEY=abc\n",
    )));
    setup.sandbox = sandbox.clone();
    let h = Harness::new(setup).await;

    let report = h.controller.start_cycle().await.unwrap();
    match &report.outcome {
        CycleOutcome::Discarded {
            reason: DiscardReason::ConstitutionDenied { constraint_id, .. },
        } => assert_eq!(constraint_id.as_deref(), Some("no-credentials")),
        other => panic!("expected constitution denial, got {other:?}"),
    }
    assert_eq!(sandbox.calls(), 0);
    assert!(audited_kinds(&h)
        .await
        .contains(&("apply_patch".to_string(), "deny".to_string())));
}

#[tokio::test]
async fn supervised_patch_waits_for_human_approval() {
    let mut patch = passing_tests(23);
    patch.edits.push(FileEdit::Write {
        path: "constitution.toml".to_string(),
        content: "# comment\n".to_string(),
    });

    let mut setup = Setup::new(proposer(patch.clone()));
    setup.gateway = Arc::new(StaticGateway::approve(["alice"]));
    let approved = Harness::new(setup).await;
    let report = approved.controller.start_cycle().await.unwrap();
    assert_eq!(report.outcome.label(), "archived");

    let mut setup = Setup::new(proposer(patch));
    setup.gateway = Arc::new(StaticGateway::reject("bob", "not today"));
    let rejected = Harness::new(setup).await;
    let report = rejected.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::ApprovalNotGranted { .. }
        }
    ));
}

#[tokio::test]
async fn failing_sandbox_test_discards() {
    let mut setup = Setup::new(proposer(passing_tests(23)));
    setup.sandbox = Arc::new(FakeSandbox::failing());
    let h = Harness::new(setup).await;
    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::SandboxFailed { .. }
        }
    ));
    assert!(report.proposal.sandbox_result().is_some());
    assert!(report.proposal.candidate_score().is_none());
}

#[tokio::test]
async fn declining_proposer_discards() {
    let mut setup = Setup::new(Arc::new(
        ratchet_core::evolution::StaticProposer::failing("nothing to do"),
    ));
    let sandbox = Arc::new(FakeSandbox::passing());
    setup.sandbox = sandbox.clone();
    let h = Harness::new(setup).await;
    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::ProposerFailed { .. }
        }
    ));
    assert_eq!(sandbox.calls(), 0);
}

#[tokio::test]
async fn cycles_never_overlap() {
    let sandbox = Arc::new(FakeSandbox::slow(Duration::from_millis(100)));
    let mut setup = Setup::new(proposer(passing_tests(23)));
    setup.sandbox = sandbox.clone();
    let h = Harness::new(setup).await;

    let (a, b) = tokio::join!(h.controller.start_cycle(), h.controller.start_cycle());
    let labels = [a.unwrap().outcome.label(), b.unwrap().outcome.label()];

    assert_eq!(sandbox.calls(), 2);
    assert_eq!(
        sandbox.max_in_flight.load(Ordering::SeqCst),
        1
    );
    // The second cycle starts from the first one's archived version, where
    // the same patch is no longer an improvement.
    assert!(labels.contains(&"archived"));
    assert!(labels.contains(&"discarded"));
    assert_eq!(h.controller.archive().list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unverified_marker_claim_is_quarantined_then_disposed() {
    let mut setup = Setup::new(proposer(write("REPORT", "ALL GREEN\n")));
    setup.suite = MARKER_SUITE;
    let h = Harness::new(setup).await;

    let report = h.controller.start_cycle().await.unwrap();
    let flags = match &report.outcome {
        CycleOutcome::Quarantined { flags } => flags.clone(),
        other => panic!("expected quarantine, got {other:?}"),
    };
    assert!(flags
        .iter()
        .any(|f| matches!(f, HackingFlag::UnverifiedClaim { marker } if marker == "ALL GREEN")));
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        h.genesis.id
    );

    let quarantined = h.controller.quarantined().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    let id = quarantined[0].proposal_id.clone();

    let err = h
        .controller
        .dispose_quarantined(&id, Actor::agent("proposer"), DispositionVerdict::FalsePositive, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::HumanRequired(_)));

    let record = h
        .controller
        .dispose_quarantined(
            &id,
            Actor::human("alice"),
            DispositionVerdict::Confirmed,
            Some("report was forged".to_string()),
        )
        .await
        .unwrap();
    let disposition = record.disposition.unwrap();
    assert_eq!(disposition.verdict, DispositionVerdict::Confirmed);
    assert_eq!(disposition.decided_by, "human:alice");
}

#[tokio::test]
async fn marker_backed_by_sandbox_output_is_not_flagged() {
    let mut setup = Setup::new(proposer(write("REPORT", "ALL GREEN\n")));
    setup.suite = MARKER_SUITE;
    setup.sandbox = Arc::new(FakeSandbox::printing("ALL GREEN\n"));
    let h = Harness::new(setup).await;
    let report = h.controller.start_cycle().await.unwrap();

    // 0.65 -> 0.85 on a one-line change is still an implausible gain.
    match &report.outcome {
        CycleOutcome::Quarantined { flags } => {
            assert!(flags
                .iter()
                .all(|f| !matches!(f, HackingFlag::UnverifiedClaim { .. })));
            assert!(flags
                .iter()
                .any(|f| matches!(f, HackingFlag::ImplausibleGain { .. })));
        }
        other => panic!("expected quarantine, got {other:?}"),
    }
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    let archived = h.controller.start_cycle().await.unwrap();
    assert_eq!(archived.outcome.label(), "archived");
    let head = h.controller.archive().current().await.unwrap().id;

    let first = h
        .controller
        .rollback(&h.genesis.id, Actor::human("alice"))
        .await
        .unwrap();
    assert_eq!(first.from, head.to_string());
    assert_eq!(first.to, h.genesis.id.to_string());

    let second = h
        .controller
        .rollback(&h.genesis.id, Actor::human("alice"))
        .await
        .unwrap();
    assert_eq!(second.from, second.to);
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        h.genesis.id
    );
    // Nothing is deleted by a rollback.
    assert_eq!(h.controller.archive().list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rollback_by_agent_needs_approval() {
    let mut setup = Setup::new(proposer(passing_tests(23)));
    setup.gateway = Arc::new(StaticGateway::reject("bob", "keep current"));
    let h = Harness::new(setup).await;
    h.controller.start_cycle().await.unwrap();

    let err = h
        .controller
        .rollback(&h.genesis.id, Actor::agent("proposer"))
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::Denied(_)));
    assert_ne!(
        h.controller.archive().current().await.unwrap().id,
        h.genesis.id
    );
}

#[tokio::test]
async fn recheck_keeps_a_healthy_version() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    h.controller.start_cycle().await.unwrap();
    let current = h.controller.archive().current().await.unwrap();

    match h.controller.recheck_current().await.unwrap() {
        RecheckReport::Healthy { version_id, score } => {
            assert_eq!(version_id, current.id.to_string());
            assert!(approx(score, 0.83));
        }
        other => panic!("expected healthy, got {other:?}"),
    }
}

#[tokio::test]
async fn recheck_rolls_back_a_regressed_version_when_approved() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    assert_eq!(
        h.controller.start_cycle().await.unwrap().outcome.label(),
        "archived"
    );
    let regressed = h.controller.archive().current().await.unwrap();

    let strict = h.controller_with(STRICT_SUITE, Arc::new(StaticGateway::approve(["alice"])));
    match strict.recheck_current().await.unwrap() {
        RecheckReport::RolledBack { score, rollback } => {
            assert!(approx(score, 0.6));
            assert_eq!(rollback.from, regressed.id.to_string());
            assert_eq!(rollback.to, h.genesis.id.to_string());
        }
        other => panic!("expected a rollback, got {other:?}"),
    }
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        h.genesis.id
    );
    assert_eq!(h.controller.archive().list().await.unwrap().len(), 2);
    assert!(audited_kinds(&h)
        .await
        .contains(&("rollback".to_string(), "require_approval".to_string())));
}

#[tokio::test]
async fn recheck_rollback_without_approval_is_refused() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    h.controller.start_cycle().await.unwrap();
    let regressed = h.controller.archive().current().await.unwrap();

    let strict = h.controller_with(STRICT_SUITE, Arc::new(StaticGateway::silent()));
    match strict.recheck_current().await.unwrap() {
        RecheckReport::RollbackRefused {
            score,
            target,
            reason,
        } => {
            assert!(approx(score, 0.6));
            assert_eq!(target, h.genesis.id.to_string());
            assert!(!reason.is_empty());
        }
        other => panic!("expected a refused rollback, got {other:?}"),
    }
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        regressed.id
    );
}

#[tokio::test]
async fn recheck_without_a_healthy_ancestor_leaves_head() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    h.controller.start_cycle().await.unwrap();
    let regressed = h.controller.archive().current().await.unwrap();

    let barren = h.controller_with(BARREN_SUITE, Arc::new(StaticGateway::approve(["alice"])));
    match barren.recheck_current().await.unwrap() {
        RecheckReport::NoHealthyAncestor { version_id, score } => {
            assert_eq!(version_id, regressed.id.to_string());
            assert!(approx(score, 0.0));
        }
        other => panic!("expected no healthy ancestor, got {other:?}"),
    }
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        regressed.id
    );
}

#[tokio::test]
async fn listing_versions_goes_through_the_engine() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    h.controller.start_cycle().await.unwrap();
    let current = h.controller.archive().current().await.unwrap();

    let listing = h
        .controller
        .list_versions(Actor::human("alice"))
        .await
        .unwrap();
    assert_eq!(listing.current, Some(current.id.clone()));
    let ids: Vec<_> = listing.versions.iter().map(|v| v.id.clone()).collect();
    assert_eq!(ids, vec![h.genesis.id.clone(), current.id]);
    assert!(audited_kinds(&h)
        .await
        .contains(&("list_versions".to_string(), "allow".to_string())));
}

#[tokio::test]
async fn listing_versions_needs_approval_for_non_humans() {
    let h = Harness::with_proposer(passing_tests(23)).await;

    let err = h
        .controller
        .list_versions(Actor::agent("proposer"))
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::Denied(_)));
    assert!(audited_kinds(&h)
        .await
        .contains(&("list_versions".to_string(), "require_approval".to_string())));
}

#[tokio::test]
async fn emergency_stop_halts_cycles_until_a_human_clears_it() {
    let h = Harness::with_proposer(passing_tests(23)).await;
    h.controller
        .engage_emergency_stop(&Actor::human("oncall"), "drill")
        .await
        .unwrap();

    assert!(matches!(
        h.controller.start_cycle().await,
        Err(EvolutionError::EmergencyStop)
    ));

    let refused = h
        .controller
        .clear_emergency_stop(Actor::agent("proposer"))
        .await
        .unwrap();
    assert!(refused.is_deny());
    assert!(h.engine.is_emergency_stopped());

    let cleared = h
        .controller
        .clear_emergency_stop(Actor::human("oncall"))
        .await
        .unwrap();
    assert!(cleared.is_allow());

    let report = h.controller.start_cycle().await.unwrap();
    assert_eq!(report.outcome.label(), "archived");
}

/// Engages the emergency stop while proposing.
struct StoppingProposer {
    controller: tokio::sync::OnceCell<Arc<EvolutionController>>,
    diff: Patch,
}

#[async_trait]
impl ProposalCollaborator for StoppingProposer {
    async fn propose(&self, _context: &ProposalContext) -> Result<ProposedChange, ProposerError> {
        if let Some(controller) = self.controller.get() {
            controller
                .engage_emergency_stop(&Actor::human("oncall"), "mid-cycle")
                .await
                .map_err(|e| ProposerError::Declined(e.to_string()))?;
        }
        Ok(ProposedChange {
            diff: self.diff.clone(),
            rationale: String::new(),
        })
    }
}

#[tokio::test]
async fn emergency_stop_mid_cycle_discards() {
    let stopping = Arc::new(StoppingProposer {
        controller: tokio::sync::OnceCell::new(),
        diff: passing_tests(23),
    });
    let sandbox = Arc::new(FakeSandbox::passing());
    let mut setup = Setup::new(stopping.clone());
    setup.sandbox = sandbox.clone();
    let h = Harness::new(setup).await;
    let _ = stopping.controller.set(h.controller.clone());

    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::EmergencyStop
        }
    ));
    assert_eq!(sandbox.calls(), 0);
    assert_eq!(h.controller.state(), CycleState::Idle);
}

/// Cancels the first cycle while proposing.
struct CancellingProposer {
    controller: tokio::sync::OnceCell<Arc<EvolutionController>>,
    fired: AtomicBool,
}

#[async_trait]
impl ProposalCollaborator for CancellingProposer {
    async fn propose(&self, _context: &ProposalContext) -> Result<ProposedChange, ProposerError> {
        if let Some(controller) = self.controller.get() {
            if !self.fired.swap(true, Ordering::SeqCst) {
                controller.cancel();
            }
        }
        Ok(ProposedChange {
            diff: passing_tests(23),
            rationale: String::new(),
        })
    }
}

#[tokio::test]
async fn cancel_stops_before_the_sandbox() {
    let cancelling = Arc::new(CancellingProposer {
        controller: tokio::sync::OnceCell::new(),
        fired: AtomicBool::new(false),
    });
    let sandbox = Arc::new(FakeSandbox::passing());
    let mut setup = Setup::new(cancelling.clone());
    setup.sandbox = sandbox.clone();
    let h = Harness::new(setup).await;
    let _ = cancelling.controller.set(h.controller.clone());

    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::Cancelled
        }
    ));
    assert_eq!(sandbox.calls(), 0);

    // The flag is consumed; the next cycle runs normally.
    let next = h.controller.start_cycle().await.unwrap();
    assert_eq!(next.outcome.label(), "archived");
}
