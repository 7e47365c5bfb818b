//! Isolation backends.
//!
//! A backend turns a prepared launch (scratch dir, argv, limits, env) into a
//! `tokio::process::Command`. Both backends run the task through a `/bin/sh`
//! prelude that applies the `ulimit` ceilings and then `exec`s the task, so
//! the ceilings hold for the task process itself. The executor puts the
//! command in its own process group and kills that group when the task ends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::{SandboxError, SandboxResult};
use super::request::SandboxLimits;

/// `PATH` given to every task.
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything a backend needs to build the command.
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    pub scratch: &'a Path,
    pub argv: &'a [String],
    pub limits: &'a SandboxLimits,
    pub env: &'a BTreeMap<String, String>,
}

impl LaunchSpec<'_> {
    /// Environment every task sees, before request overrides.
    fn base_env(&self) -> BTreeMap<String, String> {
        let scratch = self.scratch.display().to_string();
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
        env.insert("HOME".to_string(), scratch.clone());
        env.insert("TMPDIR".to_string(), scratch);
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        for (k, v) in self.env {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// `sh -c` script applying the ceilings, then exec'ing `"$@"`.
pub fn ulimit_prelude(limits: &SandboxLimits) -> String {
    let mut script = String::new();
    if let Some(cpu) = limits.cpu_secs {
        script.push_str(&format!("ulimit -t {cpu} || exit 125; "));
    }
    if let Some(mb) = limits.memory_mb {
        script.push_str(&format!("ulimit -v {} || exit 125; ", mb * 1024));
    }
    if let Some(mb) = limits.max_file_size_mb {
        // 512-byte blocks under POSIX sh; bash's 1 KiB unit only loosens it 2x.
        script.push_str(&format!("ulimit -f {} || exit 125; ", mb * 2048));
    }
    script.push_str("exec \"$@\"");
    script
}

pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend confines filesystem, network and privileges.
    fn is_isolating(&self) -> bool;

    fn command(&self, spec: &LaunchSpec<'_>) -> SandboxResult<Command>;
}

/// Which backend to build from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Bubblewrap,
    Unconfined,
}

/// Linux namespaces via `bwrap`.
#[derive(Debug, Clone)]
pub struct BubblewrapBackend {
    bwrap: PathBuf,
}

impl BubblewrapBackend {
    pub fn new(bwrap: impl Into<PathBuf>) -> Self {
        Self {
            bwrap: bwrap.into(),
        }
    }

    /// Use `bwrap` from the usual system locations.
    pub fn detect() -> SandboxResult<Self> {
        ["/usr/bin/bwrap", "/usr/local/bin/bwrap", "/bin/bwrap"]
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Self::new)
            .ok_or_else(|| SandboxError::BackendUnavailable("bwrap not found".to_string()))
    }

    /// The bwrap argument list, up to and including `--`.
    pub fn bwrap_args(&self, spec: &LaunchSpec<'_>) -> Vec<String> {
        let scratch = spec.scratch.display().to_string();
        let mut args: Vec<String> = [
            "--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(["--bind".to_string(), scratch.clone(), scratch.clone()]);
        args.push("--unshare-all".to_string());
        if spec.limits.network {
            args.push("--share-net".to_string());
        }
        args.extend(
            [
                "--die-with-parent",
                "--new-session",
                "--cap-drop",
                "ALL",
                "--clearenv",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        for (k, v) in spec.base_env() {
            args.extend(["--setenv".to_string(), k, v]);
        }
        args.extend(["--chdir".to_string(), scratch, "--".to_string()]);
        args
    }
}

impl IsolationBackend for BubblewrapBackend {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    fn is_isolating(&self) -> bool {
        true
    }

    fn command(&self, spec: &LaunchSpec<'_>) -> SandboxResult<Command> {
        if !self.bwrap.is_file() {
            return Err(SandboxError::BackendUnavailable(format!(
                "bwrap not found at {}",
                self.bwrap.display()
            )));
        }
        let mut cmd = Command::new(&self.bwrap);
        cmd.env_clear()
            .args(self.bwrap_args(spec))
            .arg("/bin/sh")
            .arg("-c")
            .arg(ulimit_prelude(spec.limits))
            .arg("ratchet-sandbox")
            .args(spec.argv);
        Ok(cmd)
    }
}

/// Development backend: clears the environment, confines the working
/// directory and applies the ceilings. No namespaces; it fails the
/// isolation self-test.
#[derive(Debug, Clone, Default)]
pub struct UnconfinedBackend;

impl IsolationBackend for UnconfinedBackend {
    fn name(&self) -> &'static str {
        "unconfined"
    }

    fn is_isolating(&self) -> bool {
        false
    }

    fn command(&self, spec: &LaunchSpec<'_>) -> SandboxResult<Command> {
        let mut cmd = Command::new("/bin/sh");
        cmd.env_clear()
            .envs(spec.base_env())
            .current_dir(spec.scratch)
            .arg("-c")
            .arg(ulimit_prelude(spec.limits))
            .arg("ratchet-sandbox")
            .args(spec.argv);
        Ok(cmd)
    }
}
