//! Process bootstrap shared by `ratchet` and `ratchetd`.
//!
//! Order matters: storage, audit sink, verified constitution (fatal on any
//! integrity failure), engine, `load_constitution` record, sandbox backend,
//! isolation self-test (fatal when required), then the controller.
//!
//! [`Runtime::serve`] is the daemon's scheduling loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ratchet_state::{AuditSink, JsonlAuditSink, StateError, SurrealStore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::archive::ImprovementArchive;
use crate::audit::AuditLog;
use crate::benchmark::{BenchmarkError, BenchmarkSuite};
use crate::config::{AuditBackend, ConfigError, RatchetConfig};
use crate::constitution::{
    ConstitutionEngine, ConstitutionError, ConstraintStore, FileApprovalGateway,
};
use crate::domain::{Actor, Operation, OperationKind};
use crate::evolution::{
    CommandProposer, ControllerParts, EvolutionController, EvolutionError, HackingDetector,
    ProposalCollaborator,
};
use crate::metrics::METRICS;
use crate::sandbox::{
    run_self_test, BackendKind, BubblewrapBackend, IsolationBackend, SandboxError,
    SandboxExecutor, SelfTestMonitor, SelfTestReport, UnconfinedBackend,
};

/// Actor id for operations the runtime records on its own behalf.
pub const RUNTIME_ACTOR: &str = "ratchet-runtime";

const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a halted cycle may take to reach its next transition before it
/// is aborted on the way out.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Constitution(#[from] ConstitutionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Benchmark(#[from] BenchmarkError),

    #[error(transparent)]
    Evolution(#[from] EvolutionError),

    #[error("constitution load denied: {0}")]
    LoadDenied(String),

    #[error("isolation self-test failed: {}", failed.join(", "))]
    SelfTestFailed { failed: Vec<String> },
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[derive(Default)]
pub struct BootstrapOptions {
    /// Run the isolation self-test and fail if it does not pass.
    pub require_selftest: bool,
    /// Use this collaborator instead of the configured command.
    pub proposer: Option<Arc<dyn ProposalCollaborator>>,
}

/// Open the SurrealDB store: `storage.url`, then `SURREALDB_URL`, then the
/// local SurrealKV directory.
pub async fn open_store(config: &RatchetConfig) -> RuntimeResult<Arc<SurrealStore>> {
    let store = match &config.storage.url {
        Some(url) => SurrealStore::connect(url).await?,
        None if std::env::var("SURREALDB_URL").is_ok() => SurrealStore::from_env().await?,
        None => SurrealStore::open_local(&config.storage.path).await?,
    };
    Ok(Arc::new(store))
}

pub fn audit_sink(
    config: &RatchetConfig,
    store: &Arc<SurrealStore>,
) -> RuntimeResult<Arc<dyn AuditSink>> {
    let sink: Arc<dyn AuditSink> = match config.audit.backend {
        AuditBackend::Jsonl => Arc::new(JsonlAuditSink::open(&config.audit.path)?),
        AuditBackend::Surreal => store.clone(),
    };
    Ok(sink)
}

pub fn audit_log(config: &RatchetConfig, store: &Arc<SurrealStore>) -> RuntimeResult<AuditLog> {
    Ok(AuditLog::new(audit_sink(config, store)?).with_retention_days(config.audit.retention_days))
}

/// Load and verify the constitution. Any integrity failure is fatal.
pub fn load_constraints(config: &RatchetConfig) -> RuntimeResult<Arc<ConstraintStore>> {
    let store = ConstraintStore::load(
        &config.constitution.path,
        config.constitution.expected_digest.as_deref(),
    )?;
    Ok(Arc::new(store))
}

/// Engine over the verified constitution, with the load recorded.
pub async fn engine(
    config: &RatchetConfig,
    store: &Arc<SurrealStore>,
) -> RuntimeResult<Arc<ConstitutionEngine>> {
    let constraints = load_constraints(config)?;
    let digest = constraints.digest().to_string();
    let engine = ConstitutionEngine::new(constraints, audit_log(config, store)?)
        .with_default_approval(config.constitution.default_approval.clone());

    let op = Operation::builder(OperationKind::LoadConstitution, Actor::system(RUNTIME_ACTOR))
        .target(config.constitution.path.display().to_string())
        .payload(serde_json::json!({ "digest": digest }))
        .build();
    let decision = engine.check(&op).await?;
    if decision.is_deny() {
        return Err(RuntimeError::LoadDenied(decision.to_string()));
    }
    Ok(Arc::new(engine))
}

pub fn isolation_backend(config: &RatchetConfig) -> RuntimeResult<Arc<dyn IsolationBackend>> {
    let backend: Arc<dyn IsolationBackend> = match config.sandbox.backend {
        BackendKind::Bubblewrap => match &config.sandbox.bwrap_path {
            Some(path) => Arc::new(BubblewrapBackend::new(path)),
            None => Arc::new(BubblewrapBackend::detect()?),
        },
        BackendKind::Unconfined => {
            warn!("sandbox backend is unconfined; tasks are not isolated");
            Arc::new(UnconfinedBackend)
        }
    };
    Ok(backend)
}

pub fn executor(config: &RatchetConfig) -> RuntimeResult<SandboxExecutor> {
    let mut executor = SandboxExecutor::new(isolation_backend(config)?)
        .with_max_concurrent_diagnostics(config.sandbox.max_concurrent_diagnostics);
    if let Some(root) = &config.sandbox.scratch_root {
        executor = executor.with_scratch_root(root);
    }
    Ok(executor)
}

pub fn approval_gateway(config: &RatchetConfig) -> FileApprovalGateway {
    FileApprovalGateway::new(&config.approval.dir)
        .with_poll_interval(Duration::from_millis(config.approval.poll_interval_ms))
}

/// A fully assembled process.
pub struct Runtime {
    pub config: RatchetConfig,
    pub store: Arc<SurrealStore>,
    pub engine: Arc<ConstitutionEngine>,
    pub executor: SandboxExecutor,
    pub controller: Arc<EvolutionController>,
    pub startup_selftest: Option<SelfTestReport>,
}

impl Runtime {
    pub async fn bootstrap(config: RatchetConfig, options: BootstrapOptions) -> RuntimeResult<Self> {
        let store = open_store(&config).await?;
        let engine = engine(&config, &store).await?;
        let executor = executor(&config)?;

        let startup_selftest = if options.require_selftest {
            let report = run_self_test(&executor).await;
            if !report.passed() {
                return Err(RuntimeError::SelfTestFailed {
                    failed: report.failed_probes(),
                });
            }
            Some(report)
        } else {
            None
        };

        let suite = Arc::new(BenchmarkSuite::load(&config.benchmark.suite)?);
        let proposer = options.proposer.unwrap_or_else(|| {
            Arc::new(CommandProposer::new(
                config.proposer.command.clone(),
                Duration::from_secs(config.proposer.timeout_secs),
            ))
        });

        let controller = EvolutionController::new(ControllerParts {
            engine: engine.clone(),
            sandbox: Arc::new(executor.clone()),
            suite,
            archive: ImprovementArchive::new(store.clone(), config.evolution.policy),
            ledger: store.clone(),
            proposer,
            gateway: Arc::new(approval_gateway(&config)),
            hacking: HackingDetector::new(config.hacking.clone())?,
            settings: config.evolution.settings.clone(),
        });

        info!(
            backend = executor.backend_name(),
            selftest = startup_selftest.is_some(),
            "ratchet runtime ready"
        );
        Ok(Self {
            config,
            store,
            engine,
            executor,
            controller: Arc::new(controller),
            startup_selftest,
        })
    }

    /// Run one cycle and log how it ended.
    pub async fn run_cycle(&self) {
        run_cycle(&self.controller).await
    }

    /// Schedule cycles, self-tests and audit retention until `shutdown`
    /// resolves or the self-test escalates. Each cycle runs as its own task,
    /// so both events engage the emergency stop while a cycle is in flight;
    /// the cycle then halts at its next transition.
    pub async fn serve<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let system = Actor::system(RUNTIME_ACTOR);
        let monitor = SelfTestMonitor::new(
            self.executor.clone(),
            self.config.sandbox.max_consecutive_failures,
        );

        let cycle_every = Duration::from_secs(self.config.evolution.cycle_interval_secs);
        let selftest_every = Duration::from_secs(self.config.sandbox.selftest_interval_secs);
        let mut cycles = tokio::time::interval(cycle_every);
        cycles.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut selftests = interval_at(Instant::now() + selftest_every, selftest_every);
        selftests.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention = tokio::time::interval(RETENTION_PERIOD);

        tokio::pin!(shutdown);
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(
            cycle_interval_secs = cycle_every.as_secs(),
            selftest_interval_secs = selftest_every.as_secs(),
            "scheduler started"
        );

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                joined = async {
                    match in_flight.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    in_flight = None;
                    if let Err(e) = joined {
                        error!(error = %e, "cycle task failed");
                    }
                }
                _ = cycles.tick() => {
                    if in_flight.is_some() {
                        debug!("previous cycle still running; tick skipped");
                    } else {
                        let controller = Arc::clone(&self.controller);
                        in_flight = Some(tokio::spawn(async move { run_cycle(&controller).await }));
                    }
                }
                _ = selftests.tick() => {
                    if let Err(e) = monitor.check().await {
                        error!(error = %e, "isolation self-test escalated");
                        break Err(RuntimeError::from(e));
                    }
                }
                _ = retention.tick() => {
                    match self.engine.audit().enforce_retention(Utc::now()).await {
                        Ok(removed) => info!(removed, "audit retention applied"),
                        Err(e) => warn!(error = %e, "audit retention failed"),
                    }
                }
            }
        };

        let reason = match &result {
            Ok(()) => "daemon interrupted".to_string(),
            Err(e) => e.to_string(),
        };
        self.controller.engage_emergency_stop(&system, &reason).await?;
        if let Some(mut handle) = in_flight {
            match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
                Ok(_) => info!("in-flight cycle halted"),
                Err(_) => {
                    warn!("in-flight cycle did not halt in time; aborting it");
                    handle.abort();
                }
            }
        }
        METRICS.flush();
        result
    }
}

async fn run_cycle(controller: &EvolutionController) {
    match controller.start_cycle().await {
        Ok(report) => info!(
            cycle_id = %report.cycle_id,
            outcome = report.outcome.label(),
            duration_ms = report.duration_ms,
            "cycle finished"
        ),
        Err(e) => warn!(error = %e, "cycle did not run"),
    }
    METRICS.flush();
}
