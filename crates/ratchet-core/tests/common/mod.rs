//! Shared fixtures for the controller tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ratchet_core::archive::ImprovementArchive;
use ratchet_core::audit::AuditLog;
use ratchet_core::benchmark::{BenchmarkSuite, BenchmarkTarget, RegressionPolicy};
use ratchet_core::constitution::{
    ApprovalGateway, ConstitutionDocument, ConstitutionEngine, ConstraintStore, StaticGateway,
};
use ratchet_core::domain::{FileEdit, Patch, Snapshot};
use ratchet_core::evolution::{
    ControllerParts, EvolutionController, EvolutionSettings, HackingConfig, HackingDetector,
    ProposalCollaborator, ProposedChange, StaticProposer,
};
use ratchet_core::sandbox::{
    ExitInfo, ResourceUsage, Sandbox, SandboxExecutionResult, SandboxLimits, SandboxRequest,
    SandboxResult,
};
use ratchet_state::fakes::{MemoryAuditSink, MemoryProposalLedger, MemoryVersionStore};
use ratchet_state::ArchivedVersion;

pub const RULES: &str = r#"
[[rules.immutable]]
id = "no-delete"
description = "archived versions are never deleted"
detector = { type = "operation_kind", kinds = ["delete_resource"] }
action = { type = "deny", reason = "archive is append-only" }

[[rules.immutable]]
id = "no-credentials"
description = "patches never carry credentials"
action = { type = "deny", reason = "credential material in patch" }

[rules.immutable.detector]
type = "all"
detectors = [
    { type = "operation_kind", kinds = ["apply_patch"] },
    { type = "payload_pattern", pattern = '(?i)aws_secret_access_key' },
]

[[rules.supervised]]
id = "constitution-edit"
description = "patches touching the constitution need review"
action = { type = "require_approval", method = { type = "human_review" }, timeout_secs = 60 }

[rules.supervised.detector]
type = "all"
detectors = [
    { type = "operation_kind", kinds = ["apply_patch"] },
    { type = "payload_pattern", pattern = 'constitution\.toml' },
]

[[rules.autonomous]]
id = "patch-ok"
description = "agents may propose patches"
detector = { type = "operation_kind", kinds = ["apply_patch"] }
action = { type = "allow" }

[[rules.autonomous]]
id = "archive-tested"
description = "tested candidates may be archived"
detector = { type = "operation_kind", kinds = ["archive_version"] }
action = { type = "allow", prerequisites = [{ type = "tests_pass" }] }

[[rules.autonomous]]
id = "human-maintenance"
description = "humans may list and roll back versions and dispose of quarantined proposals"
detector = { type = "operation_kind", kinds = ["list_versions", "rollback", "dispose_quarantine"] }
action = { type = "allow", prerequisites = [{ type = "human_originated" }] }
"#;

/// Baseline scores 0.6 + 0.4 * 20/40 = 0.80; every extra `ok` line is 0.01.
pub const SUITE: &str = r#"
name = "fixture"

[[probe]]
name = "agent-present"
weight = 0.6
kind = "file_exists"
path = "agent.py"

[[probe]]
name = "tests-passing"
weight = 0.4
kind = "pattern_count"
path = "tests.txt"
pattern = '(?m)^ok$'
target = 40
"#;

/// Baseline 0.5 + 0.3 * 20/40 = 0.65; the report probe is worth 0.2.
pub const MARKER_SUITE: &str = r#"
name = "fixture-with-report"

[[probe]]
name = "agent-present"
weight = 0.5
kind = "file_exists"
path = "agent.py"

[[probe]]
name = "tests-passing"
weight = 0.3
kind = "pattern_count"
path = "tests.txt"
pattern = '(?m)^ok$'
target = 40

[[probe]]
name = "report"
weight = 0.2
kind = "reported_marker"
path = "REPORT"
marker = "ALL GREEN"
"#;

/// Genesis (20 lines) scores 1.0. Any version with more than 20 `ok` lines
/// drops to 0.6, a regression against what it was accepted with under
/// [`SUITE`].
pub const STRICT_SUITE: &str = r#"
name = "fixture-strict"

[[probe]]
name = "agent-present"
weight = 0.6
kind = "file_exists"
path = "agent.py"

[[probe]]
name = "no-more-than-twenty"
weight = 0.4
kind = "pattern_absent"
path = "tests.txt"
pattern = '\A(?:ok\n){21}'
"#;

/// Every version scores 0.
pub const BARREN_SUITE: &str = r#"
name = "fixture-barren"

[[probe]]
name = "manifest-present"
weight = 1.0
kind = "file_exists"
path = "MANIFEST"
"#;

pub fn genesis_files() -> Snapshot {
    Snapshot::from_files([
        ("agent.py", "def run():\n    return 1\n".to_string()),
        ("tests.txt", "ok\n".repeat(20)),
    ])
    .unwrap()
}

/// Rewrite `tests.txt` with `n` passing lines.
pub fn passing_tests(n: usize) -> Patch {
    Patch::new(vec![FileEdit::Write {
        path: "tests.txt".to_string(),
        content: "ok\n".repeat(n),
    }])
}

pub fn write(path: &str, content: &str) -> Patch {
    Patch::new(vec![FileEdit::Write {
        path: path.to_string(),
        content: content.to_string(),
    }])
}

pub fn proposer(diff: Patch) -> Arc<dyn ProposalCollaborator> {
    Arc::new(StaticProposer::new(ProposedChange {
        diff,
        rationale: "test change".to_string(),
    }))
}

pub fn engine(rules: &str) -> Arc<ConstitutionEngine> {
    let mut doc = ConstitutionDocument::from_toml_str(rules).unwrap();
    doc.integrity = Some(doc.rules.digest().unwrap());
    let store = ConstraintStore::from_document(doc, None).unwrap();
    let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()));
    Arc::new(ConstitutionEngine::new(Arc::new(store), audit))
}

/// Sandbox stand-in that records how it was used.
#[derive(Debug, Default)]
pub struct FakeSandbox {
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub stdout: String,
    pub fail: bool,
    pub delay: Duration,
}

impl FakeSandbox {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn printing(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn execute(
        &self,
        _request: &SandboxRequest,
        _limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SandboxExecutionResult {
            success: !self.fail,
            stdout: self.stdout.clone(),
            stderr: String::new(),
            exit: ExitInfo {
                code: Some(if self.fail { 1 } else { 0 }),
                signal: None,
                timed_out: false,
            },
            duration_ms: self.delay.as_millis() as u64,
            resource_usage: ResourceUsage::default(),
            violations: Vec::new(),
        })
    }

    fn live_contexts(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn is_isolating(&self) -> bool {
        true
    }
}

pub struct Setup {
    pub rules: &'static str,
    pub suite: &'static str,
    pub proposer: Arc<dyn ProposalCollaborator>,
    pub gateway: Arc<dyn ApprovalGateway>,
    pub sandbox: Arc<dyn Sandbox>,
    pub settings: EvolutionSettings,
}

impl Setup {
    pub fn new(proposer: Arc<dyn ProposalCollaborator>) -> Self {
        Self {
            rules: RULES,
            suite: SUITE,
            proposer,
            gateway: Arc::new(StaticGateway::silent()),
            sandbox: Arc::new(FakeSandbox::passing()),
            settings: EvolutionSettings {
                approval_wait_secs: 1,
                ..EvolutionSettings::default()
            },
        }
    }
}

pub struct Harness {
    pub controller: Arc<EvolutionController>,
    pub engine: Arc<ConstitutionEngine>,
    pub genesis: ArchivedVersion,
}

impl Harness {
    pub async fn new(setup: Setup) -> Self {
        let engine = engine(setup.rules);
        let suite = Arc::new(BenchmarkSuite::from_toml_str(setup.suite).unwrap());
        let archive = ImprovementArchive::new(
            Arc::new(MemoryVersionStore::new()),
            RegressionPolicy::default(),
        );
        let files = genesis_files();
        let score = suite.run(&BenchmarkTarget::new(&files)).aggregate;
        let genesis = archive.genesis(&files, score).await.unwrap();

        let controller = EvolutionController::new(ControllerParts {
            engine: engine.clone(),
            sandbox: setup.sandbox,
            suite,
            archive,
            ledger: Arc::new(MemoryProposalLedger::new()),
            proposer: setup.proposer,
            gateway: setup.gateway,
            hacking: HackingDetector::new(HackingConfig::default()).unwrap(),
            settings: setup.settings,
        });
        Self {
            controller: Arc::new(controller),
            engine,
            genesis,
        }
    }

    /// A second controller over the same archive and engine, scoring with
    /// `suite` and asking `gateway` for approvals.
    pub fn controller_with(
        &self,
        suite: &str,
        gateway: Arc<dyn ApprovalGateway>,
    ) -> EvolutionController {
        EvolutionController::new(ControllerParts {
            engine: self.engine.clone(),
            sandbox: Arc::new(FakeSandbox::passing()),
            suite: Arc::new(BenchmarkSuite::from_toml_str(suite).unwrap()),
            archive: self.controller.archive().clone(),
            ledger: Arc::new(MemoryProposalLedger::new()),
            proposer: proposer(Patch::new(Vec::new())),
            gateway,
            hacking: HackingDetector::new(HackingConfig::default()).unwrap(),
            settings: EvolutionSettings {
                approval_wait_secs: 1,
                ..EvolutionSettings::default()
            },
        })
    }

    pub async fn with_proposer(diff: Patch) -> Self {
        Self::new(Setup::new(proposer(diff))).await
    }
}
