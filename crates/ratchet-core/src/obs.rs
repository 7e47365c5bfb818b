//! Structured observability hooks for the improvement loop.
//!
//! - `CycleSpan`: RAII guard entering a `ratchet.cycle` span
//! - `emit_*`: one `info!` (or `warn!`) event per lifecycle step
//!
//! Filter with `RUST_LOG`; switch to JSON through the logging config.

use tracing::{info, warn};

/// RAII guard that enters a cycle-scoped tracing span.
///
/// Only for synchronous scopes; async code instruments its futures with
/// [`cycle_span`] instead.
pub struct CycleSpan {
    _span: tracing::span::EnteredSpan,
}

impl CycleSpan {
    pub fn enter(cycle_id: &str) -> Self {
        Self {
            _span: cycle_span(cycle_id).entered(),
        }
    }
}

pub fn cycle_span(cycle_id: &str) -> tracing::Span {
    tracing::info_span!("ratchet.cycle", cycle_id = %cycle_id)
}

pub fn emit_cycle_started(cycle_id: &str, base_version: &str) {
    info!(event = "cycle.started", cycle_id = %cycle_id, base_version = %base_version);
}

pub fn emit_cycle_finished(cycle_id: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "cycle.finished",
        cycle_id = %cycle_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

pub fn emit_transition(cycle_id: &str, from: &str, to: &str) {
    info!(event = "cycle.transition", cycle_id = %cycle_id, from = %from, to = %to);
}

pub fn emit_decision(operation_id: &str, kind: &str, verdict: &str, constraint_id: Option<&str>) {
    info!(
        event = "constitution.decision",
        operation_id = %operation_id,
        kind = %kind,
        verdict = %verdict,
        constraint_id = constraint_id.unwrap_or("-"),
    );
}

pub fn emit_sandbox_run(success: bool, timed_out: bool, duration_ms: u64, violations: usize) {
    info!(
        event = "sandbox.run",
        success = success,
        timed_out = timed_out,
        duration_ms = duration_ms,
        violations = violations,
    );
}

pub fn emit_selftest(passed: bool, failed_probes: &[String]) {
    if passed {
        info!(event = "sandbox.selftest", passed = true);
    } else {
        warn!(event = "sandbox.selftest", passed = false, failed = ?failed_probes);
    }
}

pub fn emit_rollback(from: &str, to: &str, actor: &str) {
    info!(event = "archive.rollback", from = %from, to = %to, actor = %actor);
}

pub fn emit_emergency_stop(engaged: bool, actor: &str, reason: &str) {
    warn!(event = "emergency_stop", engaged = engaged, actor = %actor, reason = %reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_span_enters() {
        let _span = CycleSpan::enter("cycle-1");
        emit_transition("cycle-1", "idle", "baseline");
    }
}
