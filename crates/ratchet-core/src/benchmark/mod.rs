//! Benchmark suite: weighted, deterministic capability probes.

pub mod error;
pub mod gate;
pub mod probe;
pub mod suite;

pub use error::{BenchResult, BenchmarkError};
pub use gate::{GateRule, GateViolation, ImprovementVerdict, RegressionPolicy};
pub use probe::{BenchmarkResult, BenchmarkTarget, CompiledProbe, Probe, ProbeKind, ProbeSpec};
pub use suite::{BenchmarkSuite, SuiteDefinition, SuiteReport, WEIGHT_TOLERANCE};
