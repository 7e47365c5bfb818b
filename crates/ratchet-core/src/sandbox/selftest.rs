//! Isolation self-test.
//!
//! Runs a fixed set of escape probes through the executor. A probe prints
//! [`BREACH_MARKER`] when the escape worked and [`DONE_MARKER`] when it ran to
//! completion; a probe that neither completes nor times out as expected is a
//! failure, never a pass.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;

use crate::obs;

use super::error::{SandboxError, SandboxResult};
use super::executor::{Sandbox, SandboxExecutor};
use super::request::{SandboxLimits, SandboxRequest, SandboxTask};

pub const BREACH_MARKER: &str = "RATCHET_BREACH";
pub const DONE_MARKER: &str = "RATCHET_PROBE_DONE";

/// Port of a host-side loopback listener the network probe tries to reach.
pub const EGRESS_PORT_ENV: &str = "RATCHET_EGRESS_PORT";

const NETWORK_PROBE: &str = r#"
dial() {
  if command -v bash >/dev/null 2>&1; then
    timeout 3 bash -c 'exec 3<>"/dev/tcp/$0/$1"' "$1" "$2" 2>/dev/null
  elif command -v nc >/dev/null 2>&1; then
    nc -z -w 2 "$1" "$2" 2>/dev/null
  else
    return 2
  fi
}
if [ -n "$RATCHET_EGRESS_PORT" ] && dial 127.0.0.1 "$RATCHET_EGRESS_PORT"; then
  echo "RATCHET_BREACH connected to host listener on port $RATCHET_EGRESS_PORT"
fi
dial 1.1.1.1 53 && echo "RATCHET_BREACH connected to 1.1.1.1:53"
tail -n +3 /proc/net/dev 2>/dev/null | grep -v '^ *lo:' | grep -q . && echo "RATCHET_BREACH network interface visible"
echo RATCHET_PROBE_DONE
"#;

const WRITE_PROBE: &str = r#"
for d in / /etc /usr /var/tmp; do
  f="$d/.ratchet-probe-$$"
  if (echo x > "$f") 2>/dev/null; then
    rm -f "$f"
    echo "RATCHET_BREACH wrote to $d"
  fi
done
echo RATCHET_PROBE_DONE
"#;

const PRIVILEGE_PROBE: &str = r#"
[ "$(id -u)" = "0" ] && echo "RATCHET_BREACH running as uid 0"
cap=$(sed -n 's/^CapEff:[[:space:]]*//p' /proc/self/status 2>/dev/null)
case "$cap" in
  ""|0000000000000000) ;;
  *) echo "RATCHET_BREACH effective capabilities $cap" ;;
esac
echo RATCHET_PROBE_DONE
"#;

const RESOURCE_PROBE: &str = r#"
dd if=/dev/zero of=big.bin bs=1024 count=4096 2>/dev/null
size=$(wc -c < big.bin 2>/dev/null || echo 0)
[ "$size" -gt 1048576 ] && echo "RATCHET_BREACH wrote $size bytes past the file size ceiling"
rm -f big.bin
echo RATCHET_PROBE_DONE
"#;

const WALL_CLOCK_PROBE: &str = "exec sleep 30\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub name: String,
    pub blocked: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfTestReport {
    pub backend: String,
    pub backend_isolating: bool,
    pub probes: Vec<ProbeOutcome>,
}

impl SelfTestReport {
    /// Every probe blocked, on a backend that actually isolates.
    pub fn passed(&self) -> bool {
        self.backend_isolating && self.probes.iter().all(|p| p.blocked)
    }

    pub fn failed_probes(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .probes
            .iter()
            .filter(|p| !p.blocked)
            .map(|p| p.name.clone())
            .collect();
        if !self.backend_isolating {
            failed.push(format!("backend:{}", self.backend));
        }
        failed
    }
}

enum Expect {
    /// Runs to completion without printing the breach marker.
    Contained,
    /// Gets killed by the wall-clock timeout.
    TimedOut,
}

struct ProbeDef {
    name: &'static str,
    script: &'static str,
    limits: SandboxLimits,
    expect: Expect,
}

fn probes() -> Vec<ProbeDef> {
    let base = SandboxLimits {
        timeout_ms: 10_000,
        ..SandboxLimits::default()
    };
    vec![
        ProbeDef {
            name: "network",
            script: NETWORK_PROBE,
            limits: base.clone(),
            expect: Expect::Contained,
        },
        ProbeDef {
            name: "write_outside_scratch",
            script: WRITE_PROBE,
            limits: base.clone(),
            expect: Expect::Contained,
        },
        ProbeDef {
            name: "privilege",
            script: PRIVILEGE_PROBE,
            limits: base.clone(),
            expect: Expect::Contained,
        },
        ProbeDef {
            name: "file_size_ceiling",
            script: RESOURCE_PROBE,
            limits: SandboxLimits {
                max_file_size_mb: Some(1),
                ..base
            },
            expect: Expect::Contained,
        },
        ProbeDef {
            name: "wall_clock",
            script: WALL_CLOCK_PROBE,
            limits: SandboxLimits::default().with_timeout_ms(500),
            expect: Expect::TimedOut,
        },
    ]
}

/// Run every probe once.
pub async fn run_self_test(executor: &SandboxExecutor) -> SelfTestReport {
    // Held open for the whole run. A task inside its own network namespace
    // has a separate loopback and cannot reach it.
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => Some(l),
        Err(e) => {
            warn!(error = %e, "no host listener for the network probe");
            None
        }
    };
    let egress_port = listener
        .as_ref()
        .and_then(|l| l.local_addr().ok())
        .map(|addr| addr.port().to_string());

    let mut outcomes = Vec::new();
    for probe in probes() {
        let mut request = SandboxRequest::new(SandboxTask::shell(probe.script));
        if let Some(port) = &egress_port {
            request = request.with_env(EGRESS_PORT_ENV, port.clone());
        }
        let outcome = match executor.execute(&request, &probe.limits).await {
            Err(e) => ProbeOutcome {
                name: probe.name.to_string(),
                blocked: false,
                detail: format!("probe could not run: {e}"),
            },
            Ok(res) => {
                let (blocked, detail) = match probe.expect {
                    Expect::TimedOut if res.timed_out() => (true, "killed at timeout".to_string()),
                    Expect::TimedOut => (false, "task outlived its timeout".to_string()),
                    Expect::Contained => {
                        if let Some(line) = res.stdout.lines().find(|l| l.contains(BREACH_MARKER)) {
                            (false, line.trim().to_string())
                        } else if res.timed_out() || !res.stdout.contains(DONE_MARKER) {
                            (false, "probe did not complete".to_string())
                        } else {
                            (true, "contained".to_string())
                        }
                    }
                };
                ProbeOutcome {
                    name: probe.name.to_string(),
                    blocked,
                    detail,
                }
            }
        };
        outcomes.push(outcome);
    }

    let report = SelfTestReport {
        backend: executor.backend_name().to_string(),
        backend_isolating: executor.is_isolating(),
        probes: outcomes,
    };
    obs::emit_selftest(report.passed(), &report.failed_probes());
    report
}

/// Opens after `threshold` consecutive failures; resets on success.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    /// Returns the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Periodic self-test with escalation.
pub struct SelfTestMonitor {
    executor: SandboxExecutor,
    breaker: CircuitBreaker,
}

impl SelfTestMonitor {
    pub fn new(executor: SandboxExecutor, max_consecutive_failures: u32) -> Self {
        Self {
            executor,
            breaker: CircuitBreaker::new(max_consecutive_failures),
        }
    }

    /// Run the self-test. Returns the report while the failure streak is
    /// below the threshold and `SelfTestEscalation` once it is reached.
    pub async fn check(&self) -> SandboxResult<SelfTestReport> {
        let report = run_self_test(&self.executor).await;
        if report.passed() {
            self.breaker.record_success();
            return Ok(report);
        }
        let failures = self.breaker.record_failure();
        warn!(
            consecutive_failures = failures,
            threshold = self.breaker.threshold(),
            failed = ?report.failed_probes(),
            "isolation self-test failed"
        );
        if self.breaker.is_open() {
            return Err(SandboxError::SelfTestEscalation {
                consecutive_failures: failures,
                threshold: self.breaker.threshold(),
            });
        }
        Ok(report)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.failure_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backend::UnconfinedBackend;
    use std::sync::Arc;

    #[test]
    fn breaker_opens_at_threshold_and_resets() {
        let cb = CircuitBreaker::new(2);
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn report_requires_isolating_backend() {
        let report = SelfTestReport {
            backend: "unconfined".to_string(),
            backend_isolating: false,
            probes: vec![ProbeOutcome {
                name: "network".to_string(),
                blocked: true,
                detail: String::new(),
            }],
        };
        assert!(!report.passed());
        assert_eq!(report.failed_probes(), vec!["backend:unconfined".to_string()]);
    }

    #[tokio::test]
    async fn unconfined_backend_fails_self_test() {
        let exec = SandboxExecutor::new(Arc::new(UnconfinedBackend));
        let report = run_self_test(&exec).await;
        assert_eq!(report.probes.len(), 5);
        let wall = report
            .probes
            .iter()
            .find(|p| p.name == "wall_clock")
            .unwrap();
        assert!(wall.blocked, "{}", wall.detail);
        let network = report.probes.iter().find(|p| p.name == "network").unwrap();
        assert!(!network.blocked);
        assert!(
            network.detail.contains("connected to host listener"),
            "{}",
            network.detail
        );
        assert!(!report.passed());
        assert_eq!(exec.live_contexts(), 0);
    }

    #[tokio::test]
    async fn monitor_escalates_after_threshold() {
        let exec = SandboxExecutor::new(Arc::new(UnconfinedBackend));
        let monitor = SelfTestMonitor::new(exec, 2);
        assert!(monitor.check().await.is_ok());
        assert_eq!(monitor.consecutive_failures(), 1);
        assert!(matches!(
            monitor.check().await,
            Err(SandboxError::SelfTestEscalation {
                consecutive_failures: 2,
                threshold: 2
            })
        ));
    }
}
