//! Execution-context lifecycle with the real executor (unconfined backend).

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{passing_tests, proposer, Harness, Setup};
use ratchet_core::evolution::{CycleOutcome, DiscardReason, EvolutionSettings};
use ratchet_core::sandbox::{
    Sandbox, SandboxExecutor, SandboxLimits, SandboxRequest, SandboxTask, UnconfinedBackend,
    Violation,
};

fn executor() -> SandboxExecutor {
    SandboxExecutor::new(Arc::new(UnconfinedBackend))
}

/// Pids of live processes whose command line is exactly `argv`.
#[cfg(target_os = "linux")]
fn running(argv: &[&str]) -> Vec<u32> {
    let wanted: Vec<u8> = argv.iter().flat_map(|a| a.bytes().chain([0])).collect();
    std::fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let cmdline = std::fs::read(entry.path().join("cmdline")).ok()?;
            (cmdline == wanted).then_some(pid)
        })
        .collect()
}

/// Wait briefly for killed processes to disappear.
#[cfg(target_os = "linux")]
async fn leftovers(argv: &[&str]) -> Vec<u32> {
    for _ in 0..20 {
        let pids = running(argv);
        if pids.is_empty() {
            return pids;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    running(argv)
}

#[tokio::test]
async fn timeout_kills_the_task_and_destroys_the_context() {
    let sandbox = executor();
    let limits = SandboxLimits::default().with_timeout_ms(300);
    let started = Instant::now();

    let result = sandbox
        .execute(
            &SandboxRequest::new(SandboxTask::command(["sleep", "30"])),
            &limits,
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out());
    assert!(!result.success);
    assert!(result
        .violations
        .iter()
        .any(|v| matches!(v, Violation::Timeout { limit_ms: 300 })));
    assert_eq!(sandbox.live_contexts(), 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timeout_kills_background_children_and_keeps_output() {
    let sandbox = executor();
    let limits = SandboxLimits::default().with_timeout_ms(300);
    let started = Instant::now();

    let result = sandbox
        .execute(
            &SandboxRequest::new(SandboxTask::shell(
                "echo started; sleep 47.5 & sleep 47.5",
            )),
            &limits,
        )
        .await
        .unwrap();

    assert!(result.timed_out());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.stdout.contains("started"));
    assert_eq!(leftovers(&["sleep", "47.5"]).await, Vec::<u32>::new());
    assert_eq!(sandbox.live_contexts(), 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn background_children_do_not_outlive_a_finished_task() {
    let sandbox = executor();

    let result = sandbox
        .execute(
            &SandboxRequest::new(SandboxTask::shell("sleep 46.5 & echo done")),
            &SandboxLimits::default(),
        )
        .await
        .unwrap();

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "done");
    assert_eq!(leftovers(&["sleep", "46.5"]).await, Vec::<u32>::new());
}

#[tokio::test]
async fn concurrent_diagnostics_get_separate_contexts() {
    let sandbox = executor().with_max_concurrent_diagnostics(2);
    let limits = SandboxLimits::default();
    let request = SandboxRequest::new(SandboxTask::shell("pwd"));

    let runs = futures::future::join_all(
        (0..4).map(|_| sandbox.execute_diagnostic(&request, &limits)),
    )
    .await;

    let dirs: HashSet<String> = runs
        .into_iter()
        .map(|r| r.unwrap().stdout.trim().to_string())
        .collect();
    assert_eq!(dirs.len(), 4);
    assert_eq!(sandbox.live_contexts(), 0);
}

#[tokio::test]
async fn cycle_with_hanging_tests_is_discarded_cleanly() {
    let sandbox = Arc::new(executor());
    let mut setup = Setup::new(proposer(passing_tests(23)));
    setup.sandbox = sandbox.clone();
    setup.settings = EvolutionSettings {
        test_task: SandboxTask::command(["sleep", "30"]),
        test_limits: SandboxLimits::default().with_timeout_ms(300),
        approval_wait_secs: 1,
        ..EvolutionSettings::default()
    };
    let h = Harness::new(setup).await;

    let report = h.controller.start_cycle().await.unwrap();
    assert!(matches!(
        report.outcome,
        CycleOutcome::Discarded {
            reason: DiscardReason::SandboxFailed { .. }
        }
    ));
    assert!(report.proposal.sandbox_result().unwrap().timed_out());
    assert_eq!(sandbox.live_contexts(), 0);
    assert_eq!(
        h.controller.archive().current().await.unwrap().id,
        h.genesis.id
    );
}

#[tokio::test]
async fn candidate_files_are_staged_for_the_test_run() {
    let sandbox = Arc::new(executor());
    let mut setup = Setup::new(proposer(passing_tests(23)));
    setup.sandbox = sandbox.clone();
    setup.settings = EvolutionSettings {
        test_task: SandboxTask::shell("test \"$(grep -c '^ok$' tests.txt)\" = 23"),
        approval_wait_secs: 1,
        ..EvolutionSettings::default()
    };
    let h = Harness::new(setup).await;

    let report = h.controller.start_cycle().await.unwrap();
    assert_eq!(report.outcome.label(), "archived");
    assert_eq!(sandbox.live_contexts(), 0);
}
