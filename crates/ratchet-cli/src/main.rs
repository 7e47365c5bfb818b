//! Ratchet - constitutionally gated self-improvement
//!
//! The `ratchet` command drives and inspects a Ratchet installation.
//!
//! ## Commands
//!
//! - `constitution`: verify or seal the rule set
//! - `check`: ask the engine about an operation without performing it
//! - `sandbox`: run a diagnostic task or the isolation self-test
//! - `bench`: score a directory or an archived version
//! - `genesis`, `cycle`, `versions`, `rollback`, `recheck`: the archive
//! - `audit`, `quarantine`, `approval`: review and oversight

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};

use ratchet_core::benchmark::{BenchmarkSuite, BenchmarkTarget, SuiteReport};
use ratchet_core::constitution::{seal, ApprovalVote, VoteDecision};
use ratchet_core::domain::{Actor, Operation, OperationKind, Snapshot};
use ratchet_core::evolution::{
    CycleOutcome, CycleReport, ProposalCollaborator, ProposedChange, StaticProposer,
    VersionListing,
};
use ratchet_core::runtime::{self, BootstrapOptions, Runtime};
use ratchet_core::sandbox::{run_self_test, SandboxRequest, SandboxTask};
use ratchet_core::{init_tracing, ImprovementArchive, RatchetConfig};
use ratchet_state::{DispositionVerdict, ProposalLedger, ProposalOutcome, VersionId};

#[derive(Parser)]
#[command(name = "ratchet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Constitutionally gated self-improvement loop", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "RATCHET_CONFIG",
        default_value = "ratchet.toml"
    )]
    config: PathBuf,

    /// Human operator recorded for gated operations and votes
    #[arg(long, global = true, env = "RATCHET_OPERATOR", default_value = "operator")]
    operator: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify or seal the constitution
    Constitution {
        #[command(subcommand)]
        action: ConstitutionAction,
    },

    /// Evaluate an operation against the constitution (recorded, not performed)
    Check {
        /// Operation kind, e.g. apply_patch or delete_resource
        kind: String,

        #[arg(long, default_value = "")]
        target: String,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Acting identity as <human|agent|system>:<id> (default: the operator)
        #[arg(long)]
        actor: Option<String>,

        /// Attestations carried by the operation
        #[arg(long)]
        attest: Vec<String>,
    },

    /// Sandbox diagnostics
    Sandbox {
        #[command(subcommand)]
        action: SandboxAction,
    },

    /// Score a directory or an archived version (default: current)
    Bench {
        #[arg(long, conflicts_with = "version")]
        dir: Option<PathBuf>,

        #[arg(long)]
        version: Option<String>,
    },

    /// Seed an empty archive from a directory
    Genesis {
        dir: PathBuf,
    },

    /// Run one improvement cycle
    Cycle {
        /// JSON file holding a fixed proposal: {"diff": {...}, "rationale": "..."}
        #[arg(long)]
        proposal: Option<PathBuf>,
    },

    /// List archived versions
    Versions,

    /// Move the current pointer back to an ancestor
    Rollback {
        version: String,
    },

    /// Re-benchmark the current version and roll back on regression
    Recheck,

    /// Show or purge the audit log
    Audit {
        /// Only entries at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,

        /// Remove entries older than the retention period
        #[arg(long)]
        purge: bool,
    },

    /// Quarantined proposals
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Pending approvals and votes
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },
}

#[derive(Subcommand)]
enum ConstitutionAction {
    /// Load the constitution and check its integrity
    Verify,
    /// Compute the integrity digest of the rule set
    Seal {
        /// Write the digest into the document's `integrity` field
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum SandboxAction {
    /// Run a task in a fresh context
    Exec {
        /// Directory staged into the scratch area
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Shell script source instead of a command
        #[arg(long)]
        shell: Option<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Command and arguments
        #[arg(trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Run the isolation escape probes
    SelfTest,
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined proposals
    List,
    /// Record a verdict on a quarantined proposal
    Dispose {
        proposal_id: String,

        #[arg(long, value_enum)]
        verdict: VerdictArg,

        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// Requests waiting for votes
    Pending,
    /// Vote on a pending request
    Vote {
        operation_id: String,

        /// Vote to reject instead of approve
        #[arg(long)]
        reject: bool,

        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Confirmed,
    FalsePositive,
}

impl From<VerdictArg> for DispositionVerdict {
    fn from(v: VerdictArg) -> Self {
        match v {
            VerdictArg::Confirmed => DispositionVerdict::Confirmed,
            VerdictArg::FalsePositive => DispositionVerdict::FalsePositive,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = RatchetConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.logging.level()
    };
    init_tracing(config.logging.format, level);

    let operator = Actor::human(cli.operator.clone());
    let json = cli.json;

    match cli.command {
        Commands::Constitution { action } => match action {
            ConstitutionAction::Verify => cmd_constitution_verify(&config, json),
            ConstitutionAction::Seal { write } => cmd_constitution_seal(&config, write, json),
        },
        Commands::Check {
            kind,
            target,
            payload,
            actor,
            attest,
        } => {
            let actor = match actor {
                Some(a) => parse_actor(&a)?,
                None => operator,
            };
            cmd_check(&config, &kind, &target, payload.as_deref(), actor, attest, json).await
        }
        Commands::Sandbox { action } => match action {
            SandboxAction::Exec {
                dir,
                shell,
                timeout_ms,
                argv,
            } => {
                cmd_sandbox_exec(
                    &config,
                    operator,
                    dir.as_deref(),
                    shell,
                    timeout_ms,
                    argv,
                    json,
                )
                .await
            }
            SandboxAction::SelfTest => cmd_sandbox_selftest(&config, json).await,
        },
        Commands::Bench { dir, version } => {
            cmd_bench(&config, dir.as_deref(), version.as_deref(), json).await
        }
        Commands::Genesis { dir } => cmd_genesis(&config, &dir, json).await,
        Commands::Cycle { proposal } => cmd_cycle(&config, proposal.as_deref(), json).await,
        Commands::Versions => cmd_versions(&config, operator, json).await,
        Commands::Rollback { version } => cmd_rollback(&config, &version, operator, json).await,
        Commands::Recheck => cmd_recheck(&config, json).await,
        Commands::Audit { since, purge } => cmd_audit(&config, since.as_deref(), purge, json).await,
        Commands::Quarantine { action } => match action {
            QuarantineAction::List => cmd_quarantine_list(&config, json).await,
            QuarantineAction::Dispose {
                proposal_id,
                verdict,
                note,
            } => {
                cmd_quarantine_dispose(&config, &proposal_id, operator, verdict.into(), note, json)
                    .await
            }
        },
        Commands::Approval { action } => match action {
            ApprovalAction::Pending => cmd_approval_pending(&config, json),
            ApprovalAction::Vote {
                operation_id,
                reject,
                comment,
            } => cmd_approval_vote(&config, &operation_id, &cli.operator, reject, comment, json),
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_actor(s: &str) -> Result<Actor> {
    match s.split_once(':') {
        Some(("human", id)) if !id.is_empty() => Ok(Actor::human(id)),
        Some(("agent", id)) if !id.is_empty() => Ok(Actor::agent(id)),
        Some(("system", id)) if !id.is_empty() => Ok(Actor::system(id)),
        _ => bail!("actor must look like human:<id>, agent:<id> or system:<id>, got {s:?}"),
    }
}

/// Load the constitution and check its integrity
fn cmd_constitution_verify(config: &RatchetConfig, json: bool) -> Result<()> {
    let store = runtime::load_constraints(config)?;
    if json {
        return print_json(&serde_json::json!({
            "path": config.constitution.path,
            "digest": store.digest(),
            "immutable": store.immutable().len(),
            "supervised": store.supervised().len(),
            "autonomous": store.autonomous().len(),
        }));
    }
    println!("Constitution OK: {}", config.constitution.path.display());
    println!("  digest:     {}", store.digest());
    println!("  immutable:  {}", store.immutable().len());
    println!("  supervised: {}", store.supervised().len());
    println!("  autonomous: {}", store.autonomous().len());
    Ok(())
}

/// Compute (and optionally write) the integrity digest
fn cmd_constitution_seal(config: &RatchetConfig, write: bool, json: bool) -> Result<()> {
    let path = &config.constitution.path;
    let digest = seal(path)?;
    if write {
        write_integrity(path, &digest)?;
        info!(path = %path.display(), digest = %digest, "constitution sealed");
    }
    if json {
        return print_json(&serde_json::json!({ "digest": digest, "written": write }));
    }
    println!("{digest}");
    Ok(())
}

/// Replace or insert the top-level `integrity` line of a TOML constitution.
fn write_integrity(path: &Path, digest: &str) -> Result<()> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        bail!("--write supports TOML constitutions only; set \"integrity\" by hand");
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let line = format!("integrity = \"{digest}\"");
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    let mut in_tables = false;
    for l in text.lines() {
        let trimmed = l.trim_start();
        in_tables |= trimmed.starts_with('[');
        if !in_tables && !replaced && trimmed.starts_with("integrity") {
            lines.push(line.clone());
            replaced = true;
        } else {
            lines.push(l.to_string());
        }
    }
    if !replaced {
        lines.insert(0, line);
    }
    std::fs::write(path, lines.join("\n") + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Evaluate one operation
async fn cmd_check(
    config: &RatchetConfig,
    kind: &str,
    target: &str,
    payload: Option<&str>,
    actor: Actor,
    attest: Vec<String>,
    json: bool,
) -> Result<()> {
    let store = runtime::open_store(config).await?;
    let engine = runtime::engine(config, &store).await?;

    let payload: serde_json::Value = match payload {
        Some(p) => serde_json::from_str(p).context("Failed to parse --payload as JSON")?,
        None => serde_json::Value::Null,
    };
    let mut builder = Operation::builder(OperationKind::from(kind), actor)
        .target(target)
        .payload(payload);
    for a in attest {
        builder = builder.attest(a);
    }
    let op = builder.build();
    let decision = engine.check(&op).await?;

    if json {
        return print_json(&serde_json::json!({
            "operation_id": op.id(),
            "decision": decision,
        }));
    }
    println!("{} {} -> {}", op.kind(), op.id(), decision);
    Ok(())
}

/// Run a diagnostic task
async fn cmd_sandbox_exec(
    config: &RatchetConfig,
    operator: Actor,
    dir: Option<&Path>,
    shell: Option<String>,
    timeout_ms: Option<u64>,
    argv: Vec<String>,
    json: bool,
) -> Result<()> {
    let task = match (shell, argv.is_empty()) {
        (Some(source), true) => SandboxTask::shell(source),
        (None, false) => SandboxTask::command(argv),
        _ => bail!("give either --shell <script> or a command, not both"),
    };
    let files = match dir {
        Some(d) => Snapshot::from_dir(d)
            .with_context(|| format!("Failed to read {}", d.display()))?,
        None => Snapshot::new(),
    };

    let store = runtime::open_store(config).await?;
    let engine = runtime::engine(config, &store).await?;
    let op = Operation::builder(OperationKind::ExecuteSandbox, operator)
        .target("diagnostic")
        .payload(serde_json::json!({ "task": task }))
        .build();
    let decision = engine.check(&op).await?;
    if !decision.is_allow() {
        bail!("sandbox execution not allowed: {decision}");
    }

    let mut limits = config.sandbox.limits.clone();
    if let Some(ms) = timeout_ms {
        limits = limits.with_timeout_ms(ms);
    }
    let executor = runtime::executor(config)?;
    let result = executor
        .execute_diagnostic(&SandboxRequest::new(task).with_files(files), &limits)
        .await?;

    if json {
        print_json(&result)?;
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        println!(
            "-- exit {:?}, {} ms, {} violation(s)",
            result.exit.code,
            result.duration_ms,
            result.violations.len()
        );
        for v in &result.violations {
            println!("   {v:?}");
        }
    }
    if !result.success {
        bail!("sandbox task failed");
    }
    Ok(())
}

/// Run the escape probes
async fn cmd_sandbox_selftest(config: &RatchetConfig, json: bool) -> Result<()> {
    let executor = runtime::executor(config)?;
    let report = run_self_test(&executor).await;
    if json {
        print_json(&report)?;
    } else {
        println!("Backend: {} (isolating: {})", report.backend, report.backend_isolating);
        for p in &report.probes {
            let mark = if p.blocked { "blocked" } else { "ESCAPED" };
            println!("  {:<24} {:<8} {}", p.name, mark, p.detail);
        }
    }
    if !report.passed() {
        bail!("isolation self-test failed: {}", report.failed_probes().join(", "));
    }
    Ok(())
}

fn print_report(report: &SuiteReport) {
    let suite: String = report.suite_digest.chars().take(12).collect();
    println!("Aggregate: {:.4}  (suite {suite})", report.aggregate);
    for r in &report.results {
        let mark = if r.passed { "pass" } else { "FAIL" };
        println!("  {:<24} {} {:.3}  {}", r.probe_name, mark, r.score, r.detail);
    }
}

/// Score a directory or version
async fn cmd_bench(
    config: &RatchetConfig,
    dir: Option<&Path>,
    version: Option<&str>,
    json: bool,
) -> Result<()> {
    let suite = BenchmarkSuite::load(&config.benchmark.suite)?;
    let snapshot = match dir {
        Some(d) => Snapshot::from_dir(d).with_context(|| format!("Failed to read {}", d.display()))?,
        None => {
            let store = runtime::open_store(config).await?;
            let archive = ImprovementArchive::new(store, config.evolution.policy);
            let id = match version {
                Some(v) => VersionId::from(v),
                None => archive.current().await?.id,
            };
            archive.materialize(&id).await?
        }
    };
    let report = suite.run(&BenchmarkTarget::new(&snapshot));
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

/// Seed the archive
async fn cmd_genesis(config: &RatchetConfig, dir: &Path, json: bool) -> Result<()> {
    let snapshot =
        Snapshot::from_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    let suite = BenchmarkSuite::load(&config.benchmark.suite)?;
    let report = suite.run(&BenchmarkTarget::new(&snapshot));

    let store = runtime::open_store(config).await?;
    let archive = ImprovementArchive::new(store, config.evolution.policy);
    let version = archive.genesis(&snapshot, report.aggregate).await?;

    if json {
        return print_json(&version);
    }
    println!("Genesis version: {}", version.id);
    println!("  files:  {}", snapshot.len());
    println!("  score:  {:.4}", version.accepted_score);
    println!("  digest: {}", version.content_digest.short());
    Ok(())
}

/// Run one cycle
async fn cmd_cycle(config: &RatchetConfig, proposal: Option<&Path>, json: bool) -> Result<()> {
    let proposer: Option<Arc<dyn ProposalCollaborator>> = match proposal {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let change: ProposedChange =
                serde_json::from_str(&text).context("Failed to parse proposal JSON")?;
            Some(Arc::new(StaticProposer::new(change)))
        }
        None => None,
    };
    let rt = Runtime::bootstrap(
        config.clone(),
        BootstrapOptions {
            require_selftest: true,
            proposer,
        },
    )
    .await?;

    let report = rt.controller.start_cycle().await?;
    if json {
        return print_json(&report);
    }
    print_cycle(&report);
    Ok(())
}

fn print_cycle(report: &CycleReport) {
    let p = &report.proposal;
    println!("Cycle {} ({} ms)", report.cycle_id, report.duration_ms);
    println!("  proposal:  {}", p.id());
    if let Some(b) = p.baseline_score() {
        println!("  baseline:  {b:.4}");
    }
    if let Some(c) = p.candidate_score() {
        println!("  candidate: {c:.4}");
    }
    match &report.outcome {
        CycleOutcome::Archived { version_id } => println!("  ARCHIVED as {version_id}"),
        CycleOutcome::Discarded { reason } => println!("  DISCARDED: {reason}"),
        CycleOutcome::Quarantined { flags } => {
            println!("  QUARANTINED:");
            for f in flags {
                println!("    - {f}");
            }
        }
    }
}

/// List versions
async fn cmd_versions(config: &RatchetConfig, operator: Actor, json: bool) -> Result<()> {
    let rt = Runtime::bootstrap(config.clone(), BootstrapOptions::default()).await?;
    let VersionListing {
        current: head,
        versions,
    } = rt
        .controller
        .list_versions(operator)
        .await
        .context("Version listing was refused")?;

    if json {
        return print_json(&serde_json::json!({ "current": head, "versions": versions }));
    }
    if versions.is_empty() {
        println!("Archive is empty; seed it with `ratchet genesis <dir>`");
        return Ok(());
    }
    for v in &versions {
        let mark = if head.as_ref() == Some(&v.id) { "*" } else { " " };
        let parent = v
            .parent_id
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{mark} {}  parent {:<36}  score {:.4}  {}",
            v.id,
            parent,
            v.accepted_score,
            v.accepted_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Roll back
async fn cmd_rollback(
    config: &RatchetConfig,
    version: &str,
    operator: Actor,
    json: bool,
) -> Result<()> {
    let rt = Runtime::bootstrap(config.clone(), BootstrapOptions::default()).await?;
    let report = rt
        .controller
        .rollback(&VersionId::from(version), operator)
        .await?;
    if json {
        return print_json(&report);
    }
    if report.from == report.to {
        println!("Already at {}", report.to);
    } else {
        println!("Rolled back {} -> {}", report.from, report.to);
    }
    Ok(())
}

/// Re-benchmark current
async fn cmd_recheck(config: &RatchetConfig, json: bool) -> Result<()> {
    let rt = Runtime::bootstrap(config.clone(), BootstrapOptions::default()).await?;
    let report = rt.controller.recheck_current().await?;
    if json {
        return print_json(&report);
    }
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

/// Show or purge the audit log
async fn cmd_audit(
    config: &RatchetConfig,
    since: Option<&str>,
    purge: bool,
    json: bool,
) -> Result<()> {
    let store = runtime::open_store(config).await?;
    let log = runtime::audit_log(config, &store)?;

    if purge {
        let removed = log.enforce_retention(Utc::now()).await?;
        println!(
            "Removed {removed} entries older than {} days",
            log.retention_days()
        );
        return Ok(());
    }

    let since = match since {
        Some(s) => Some(
            DateTime::parse_from_rfc3339(s)
                .context("--since must be an RFC 3339 timestamp")?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let entries = log.entries(since).await?;
    if json {
        return print_json(&entries);
    }
    for e in &entries {
        println!(
            "{:>6} {} {:<20} {:<22} {:<16} {}",
            e.seq,
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.actor,
            e.operation["kind"].as_str().unwrap_or("?"),
            e.decision["verdict"].as_str().unwrap_or("?"),
            e.detail
        );
    }
    Ok(())
}

/// List quarantined proposals
async fn cmd_quarantine_list(config: &RatchetConfig, json: bool) -> Result<()> {
    let store = runtime::open_store(config).await?;
    let records = ProposalLedger::list(store.as_ref(), Some(ProposalOutcome::Quarantined)).await?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No quarantined proposals");
    }
    for r in &records {
        let status = match &r.disposition {
            Some(d) => format!("{:?} by {}", d.verdict, d.decided_by),
            None => "awaiting review".to_string(),
        };
        println!(
            "{}  {}  [{}]",
            r.proposal_id,
            r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            status
        );
        if let Some(reason) = &r.reason {
            println!("    {reason}");
        }
    }
    Ok(())
}

/// Dispose of a quarantined proposal
async fn cmd_quarantine_dispose(
    config: &RatchetConfig,
    proposal_id: &str,
    operator: Actor,
    verdict: DispositionVerdict,
    note: Option<String>,
    json: bool,
) -> Result<()> {
    let rt = Runtime::bootstrap(config.clone(), BootstrapOptions::default()).await?;
    let record = rt
        .controller
        .dispose_quarantined(proposal_id, operator, verdict, note)
        .await?;
    if json {
        return print_json(&record);
    }
    println!("Recorded {verdict:?} for {proposal_id}");
    Ok(())
}

/// List pending approvals
fn cmd_approval_pending(config: &RatchetConfig, json: bool) -> Result<()> {
    let pending = runtime::approval_gateway(config).pending()?;
    if json {
        return print_json(&pending);
    }
    if pending.is_empty() {
        println!("No pending approvals");
    }
    for r in &pending {
        println!(
            "{}  {} by {}  ({}, {}s)",
            r.operation.id(),
            r.operation.kind(),
            r.operation.actor(),
            r.method,
            r.timeout_secs
        );
        println!("    {}", r.reason);
    }
    Ok(())
}

/// Cast a vote
fn cmd_approval_vote(
    config: &RatchetConfig,
    operation_id: &str,
    voter: &str,
    reject: bool,
    comment: Option<String>,
    json: bool,
) -> Result<()> {
    let decision = if reject {
        VoteDecision::Reject
    } else {
        VoteDecision::Approve
    };
    let vote = ApprovalVote::new(voter, decision, comment);
    let path = runtime::approval_gateway(config).cast_vote(operation_id, &vote)?;
    if json {
        return print_json(&vote);
    }
    println!("Vote recorded at {}", path.display());
    Ok(())
}
