//! Ratchet Core Library
//!
//! A constitutionally gated self-improvement loop. Every state-changing
//! operation is checked against a verified constitution, candidates run in
//! an isolated sandbox, and only benchmarked, non-regressing versions enter
//! the append-only archive.

pub mod archive;
pub mod audit;
pub mod benchmark;
pub mod config;
pub mod constitution;
pub mod domain;
pub mod evolution;
pub mod metrics;
pub mod obs;
pub mod runtime;
pub mod sandbox;
pub mod telemetry;

pub use archive::{ArchiveError, ArchiveResult, ImprovementArchive};
pub use audit::AuditLog;
pub use benchmark::{
    BenchmarkSuite, BenchmarkTarget, ImprovementVerdict, RegressionPolicy, SuiteReport,
};
pub use config::{ConfigError, RatchetConfig};
pub use constitution::{
    ApprovalGateway, ConstitutionEngine, ConstitutionError, ConstraintStore,
    FileApprovalGateway, StaticGateway,
};
pub use domain::{
    Actor, Decision, FileEdit, Operation, OperationKind, Patch, RatchetError, Result, Snapshot,
};
pub use evolution::{
    CycleOutcome, CycleReport, CycleState, EvolutionController, EvolutionError,
    ImprovementProposal, ProposalCollaborator,
};
pub use runtime::{BootstrapOptions, Runtime, RuntimeError};
pub use sandbox::{
    Sandbox, SandboxExecutionResult, SandboxExecutor, SandboxLimits, SandboxRequest, SandboxTask,
    SelfTestMonitor, SelfTestReport,
};
pub use telemetry::{init_tracing, LogFormat};

pub use ratchet_state::{
    ArchivedVersion, AuditRecord, ProposalRecord, StateError, StorageError, SurrealStore,
};
