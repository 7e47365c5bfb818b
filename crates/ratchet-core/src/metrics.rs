//! Global atomic counters for the improvement loop.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event; the daemon calls it after
//! every cycle.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cycles_started: AtomicU64,
    cycles_archived: AtomicU64,
    cycles_discarded: AtomicU64,
    cycles_quarantined: AtomicU64,
    denials: AtomicU64,
    sandbox_runs: AtomicU64,
    sandbox_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub cycles_started: u64,
    pub cycles_archived: u64,
    pub cycles_discarded: u64,
    pub cycles_quarantined: u64,
    pub denials: u64,
    pub sandbox_runs: u64,
    pub sandbox_timeouts: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_started: AtomicU64::new(0),
            cycles_archived: AtomicU64::new(0),
            cycles_discarded: AtomicU64::new(0),
            cycles_quarantined: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            sandbox_runs: AtomicU64::new(0),
            sandbox_timeouts: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_archived(&self) {
        self.cycles_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_discarded(&self) {
        self.cycles_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_quarantined(&self) {
        self.cycles_quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_denials(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sandbox_runs(&self) {
        self.sandbox_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sandbox_timeouts(&self) {
        self.sandbox_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_archived: self.cycles_archived.load(Ordering::Relaxed),
            cycles_discarded: self.cycles_discarded.load(Ordering::Relaxed),
            cycles_quarantined: self.cycles_quarantined.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            sandbox_runs: self.sandbox_runs.load(Ordering::Relaxed),
            sandbox_timeouts: self.sandbox_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            cycles_started = s.cycles_started,
            cycles_archived = s.cycles_archived,
            cycles_discarded = s.cycles_discarded,
            cycles_quarantined = s.cycles_quarantined,
            denials = s.denials,
            sandbox_runs = s.sandbox_runs,
            sandbox_timeouts = s.sandbox_timeouts,
        );
    }

    /// Reset all counters to zero (tests).
    pub fn reset(&self) {
        for c in [
            &self.cycles_started,
            &self.cycles_archived,
            &self.cycles_discarded,
            &self.cycles_quarantined,
            &self.denials,
            &self.sandbox_runs,
            &self.sandbox_timeouts,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
