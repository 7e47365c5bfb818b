//! Sandbox executor.
//!
//! - [`request`]: limits, requests, results and violations
//! - [`backend`]: isolation backends (bubblewrap, unconfined)
//! - [`executor`]: per-execution context lifecycle
//! - [`selftest`]: escape probes and the escalating monitor

pub mod backend;
pub mod error;
pub mod executor;
pub mod request;
pub mod selftest;

pub use backend::{BackendKind, BubblewrapBackend, IsolationBackend, UnconfinedBackend};
pub use error::{SandboxError, SandboxResult};
pub use executor::{Sandbox, SandboxExecutor};
pub use request::{
    ExitInfo, OutputStream, ResourceUsage, SandboxExecutionResult, SandboxLimits, SandboxRequest,
    SandboxTask, Violation, MAX_TIMEOUT_MS,
};
pub use selftest::{
    run_self_test, CircuitBreaker, ProbeOutcome, SelfTestMonitor, SelfTestReport,
};
