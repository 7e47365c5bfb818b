//! Sandbox limits, requests and results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::snapshot::validate_relative;
use crate::domain::Snapshot;

use super::error::{SandboxError, SandboxResult};

/// Upper bound on any sandbox wall-clock timeout.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Resource ceilings for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxLimits {
    /// Hard wall-clock timeout (milliseconds), `1..=600_000`.
    pub timeout_ms: u64,
    /// CPU seconds (`ulimit -t`).
    pub cpu_secs: Option<u64>,
    /// Address space in MiB (`ulimit -v`).
    pub memory_mb: Option<u64>,
    /// Largest file the task may write, in MiB (`ulimit -f`).
    pub max_file_size_mb: Option<u64>,
    /// Captured bytes per stream; the rest is drained and dropped.
    pub max_output_bytes: usize,
    /// Total size of the scratch directory after the run, in MiB.
    pub scratch_quota_mb: u64,
    pub network: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            cpu_secs: Some(60),
            memory_mb: Some(2048),
            max_file_size_mb: Some(64),
            max_output_bytes: 1024 * 1024,
            scratch_quota_mb: 256,
            network: false,
        }
    }
}

impl SandboxLimits {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if !(1..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(SandboxError::InvalidLimits(format!(
                "timeout_ms must be in 1..={MAX_TIMEOUT_MS}, got {}",
                self.timeout_ms
            )));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidLimits(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        if self.scratch_quota_mb == 0 {
            return Err(SandboxError::InvalidLimits(
                "scratch_quota_mb must be positive".to_string(),
            ));
        }
        for (name, v) in [
            ("cpu_secs", self.cpu_secs),
            ("memory_mb", self.memory_mb),
            ("max_file_size_mb", self.max_file_size_mb),
        ] {
            if v == Some(0) {
                return Err(SandboxError::InvalidLimits(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// What to run inside the context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxTask {
    /// Run `argv` with the scratch directory as working directory.
    Command { argv: Vec<String> },
    /// Write `source` to `file_name` in scratch and run `interpreter file_name`.
    Script {
        interpreter: String,
        file_name: String,
        source: String,
    },
}

impl SandboxTask {
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SandboxTask::Command {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(source: impl Into<String>) -> Self {
        SandboxTask::Script {
            interpreter: "/bin/sh".to_string(),
            file_name: "task.sh".to_string(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRequest {
    pub task: SandboxTask,
    /// Files staged into scratch before launch.
    #[serde(default)]
    pub files: Snapshot,
    /// Extra environment; the inherited environment is always cleared.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SandboxRequest {
    pub fn new(task: SandboxTask) -> Self {
        Self {
            task,
            files: Snapshot::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_files(mut self, files: Snapshot) -> Self {
        self.files = files;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> SandboxResult<()> {
        match &self.task {
            SandboxTask::Command { argv } if argv.is_empty() => Err(
                SandboxError::InvalidRequest("command argv is empty".to_string()),
            ),
            SandboxTask::Script {
                interpreter,
                file_name,
                ..
            } => {
                if interpreter.is_empty() {
                    return Err(SandboxError::InvalidRequest(
                        "script interpreter is empty".to_string(),
                    ));
                }
                validate_relative(file_name)
                    .map_err(|e| SandboxError::InvalidRequest(e.to_string()))
            }
            SandboxTask::Command { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A limit the task ran into. The executor reports these; it never decides
/// what they mean for the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    Timeout { limit_ms: u64 },
    OutputTruncated { stream: OutputStream, limit_bytes: usize },
    ScratchQuotaExceeded { used_bytes: u64, quota_bytes: u64 },
    /// Killed by the kernel for exceeding a `ulimit` ceiling.
    ResourceLimit { resource: String, signal: i32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub scratch_bytes: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitInfo,
    pub duration_ms: u64,
    pub resource_usage: ResourceUsage,
    pub violations: Vec<Violation>,
}

impl SandboxExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.exit.timed_out
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.timeout_ms, 30_000);
        assert!(!limits.network);
        limits.validate().unwrap();
    }

    #[test]
    fn timeout_is_bounded() {
        assert!(SandboxLimits::default().with_timeout_ms(0).validate().is_err());
        assert!(SandboxLimits::default()
            .with_timeout_ms(MAX_TIMEOUT_MS + 1)
            .validate()
            .is_err());
        assert!(SandboxLimits::default()
            .with_timeout_ms(MAX_TIMEOUT_MS)
            .validate()
            .is_ok());
    }

    #[test]
    fn limits_parse_from_partial_toml() {
        let limits: SandboxLimits = toml::from_str("timeout_ms = 5000\nnetwork = true").unwrap();
        assert_eq!(limits.timeout_ms, 5000);
        assert!(limits.network);
        assert_eq!(limits.scratch_quota_mb, 256);
    }

    #[test]
    fn script_name_must_stay_in_scratch() {
        let req = SandboxRequest::new(SandboxTask::Script {
            interpreter: "/bin/sh".to_string(),
            file_name: "../escape.sh".to_string(),
            source: String::new(),
        });
        assert!(req.validate().is_err());
        assert!(SandboxRequest::new(SandboxTask::command(Vec::<String>::new()))
            .validate()
            .is_err());
    }

    #[test]
    fn task_parses_tagged() {
        let task: SandboxTask =
            toml::from_str("type = \"command\"\nargv = [\"sh\", \"run_tests.sh\"]").unwrap();
        assert_eq!(task, SandboxTask::command(["sh", "run_tests.sh"]));
    }
}
