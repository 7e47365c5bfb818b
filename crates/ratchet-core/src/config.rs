//! Operator configuration (`ratchet.toml`).
//!
//! Every section is optional. Relative paths are resolved against the
//! directory holding the config file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::benchmark::RegressionPolicy;
use crate::constitution::DefaultApproval;
use crate::evolution::{EvolutionSettings, HackingConfig};
use crate::sandbox::{BackendKind, SandboxLimits};
use crate::telemetry::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("invalid config {file}: {reason}")]
    Validation { file: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstitutionConfig {
    pub path: PathBuf,
    /// Pinned rule-set digest; startup fails if the document differs.
    pub expected_digest: Option<String>,
    pub default_approval: DefaultApproval,
}

impl Default for ConstitutionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("constitution.toml"),
            expected_digest: None,
            default_approval: DefaultApproval::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Jsonl,
    Surreal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    /// JSONL file for the `jsonl` backend.
    pub path: PathBuf,
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Jsonl,
            path: PathBuf::from(".ratchet/audit.jsonl"),
            retention_days: crate::audit::DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Remote or explicit SurrealDB endpoint (`ws://…`, `mem://`). Wins over
    /// `path` when set; `SURREALDB_URL` wins over both.
    pub url: Option<String>,
    /// On-disk SurrealKV directory.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            path: PathBuf::from(".ratchet/db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// `bwrap` binary; detected on `PATH` locations when unset.
    pub bwrap_path: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub limits: SandboxLimits,
    pub max_concurrent_diagnostics: usize,
    pub selftest_interval_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Bubblewrap,
            bwrap_path: None,
            scratch_root: None,
            limits: SandboxLimits::default(),
            max_concurrent_diagnostics: 4,
            selftest_interval_secs: 3600,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub suite: PathBuf,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("suite.toml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    #[serde(flatten)]
    pub policy: RegressionPolicy,
    #[serde(flatten)]
    pub settings: EvolutionSettings,
    /// Daemon cycle period.
    pub cycle_interval_secs: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            policy: RegressionPolicy::default(),
            settings: EvolutionSettings::default(),
            cycle_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposerConfig {
    /// argv of the external proposer. Empty disables cycles.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub dir: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".ratchet/approvals"),
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    pub constitution: ConstitutionConfig,
    pub audit: AuditConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub benchmark: BenchmarkConfig,
    pub evolution: EvolutionConfig,
    pub hacking: HackingConfig,
    pub proposer: ProposerConfig,
    pub approval: ApprovalConfig,
    pub logging: LoggingConfig,
}

impl RatchetConfig {
    /// Read, resolve relative paths against the file's directory, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = path.display().to_string();
        let mut config = Self::parse(&text, &file)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate(&file)?;
        Ok(config)
    }

    /// Parse and validate without touching paths.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(text, "<inline>")?;
        config.validate("<inline>")?;
        Ok(config)
    }

    fn parse(text: &str, file: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            file: file.to_string(),
            reason: e.to_string(),
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.constitution.path);
        resolve(&mut self.audit.path);
        resolve(&mut self.storage.path);
        resolve(&mut self.benchmark.suite);
        resolve(&mut self.approval.dir);
        if let Some(p) = self.sandbox.scratch_root.as_mut() {
            resolve(p);
        }
    }

    pub fn validate(&self, file: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Validation {
            file: file.to_string(),
            reason,
        };

        if let Some(d) = &self.constitution.expected_digest {
            if d.len() != 64 || !d.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid(format!(
                    "constitution.expected_digest must be 64 hex characters, got {d:?}"
                )));
            }
        }
        if self.audit.retention_days == 0 {
            return Err(invalid("audit.retention_days must be positive".to_string()));
        }
        self.sandbox
            .limits
            .validate()
            .map_err(|e| invalid(format!("sandbox.limits: {e}")))?;
        self.evolution
            .settings
            .test_limits
            .validate()
            .map_err(|e| invalid(format!("evolution.test_limits: {e}")))?;
        if self.sandbox.max_concurrent_diagnostics == 0 {
            return Err(invalid(
                "sandbox.max_concurrent_diagnostics must be positive".to_string(),
            ));
        }
        if self.sandbox.max_consecutive_failures == 0 {
            return Err(invalid(
                "sandbox.max_consecutive_failures must be positive".to_string(),
            ));
        }
        if self.sandbox.selftest_interval_secs == 0 || self.evolution.cycle_interval_secs == 0 {
            return Err(invalid("intervals must be positive".to_string()));
        }
        self.evolution
            .policy
            .validate()
            .map_err(|e| invalid(format!("evolution: {e}")))?;
        if self.proposer.timeout_secs == 0 {
            return Err(invalid("proposer.timeout_secs must be positive".to_string()));
        }
        if self.logging.level.parse::<Level>().is_err() {
            return Err(invalid(format!("unknown logging.level {:?}", self.logging.level)));
        }
        Ok(())
    }
}
