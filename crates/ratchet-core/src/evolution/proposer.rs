//! Proposal collaborators.
//!
//! The collaborator sees a read-only copy of the baseline and returns a
//! patch plus rationale. Its output is untrusted; everything it returns goes
//! through the constitution and the sandbox before it can matter.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::benchmark::SuiteReport;
use crate::domain::{Patch, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    #[error("failed to run proposer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proposer timed out after {0} ms")]
    Timeout(u64),

    #[error("proposer exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("proposer returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("proposer declined: {0}")]
    Declined(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedProbe {
    pub name: String,
    pub score: f64,
    pub detail: String,
}

/// What went wrong in the baseline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureAnalysis {
    pub aggregate: f64,
    pub failed: Vec<FailedProbe>,
}

impl FailureAnalysis {
    pub fn from_report(report: &SuiteReport) -> Self {
        let mut failed: Vec<FailedProbe> = report
            .failed()
            .map(|r| FailedProbe {
                name: r.probe_name.clone(),
                score: r.score,
                detail: r.detail.clone(),
            })
            .collect();
        failed.sort_by(|a, b| a.score.total_cmp(&b.score));
        Self {
            aggregate: report.aggregate,
            failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalContext {
    pub base_version_id: String,
    pub baseline: SuiteReport,
    pub failure_analysis: FailureAnalysis,
    pub files: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedChange {
    pub diff: Patch,
    pub rationale: String,
}

#[async_trait]
pub trait ProposalCollaborator: Send + Sync {
    async fn propose(&self, context: &ProposalContext) -> Result<ProposedChange, ProposerError>;
}

/// External process: context as JSON on stdin, `{diff, rationale}` as JSON
/// on stdout.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandProposer {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl ProposalCollaborator for CommandProposer {
    async fn propose(&self, context: &ProposalContext) -> Result<ProposedChange, ProposerError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ProposerError::Declined("no proposer command configured".to_string()));
        };
        let input = serde_json::to_vec(context)
            .map_err(|e| ProposerError::InvalidOutput(e.to_string()))?;

        let spawn_err = |source| ProposerError::Spawn {
            program: program.clone(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A proposer that exits without reading is judged by its exit status.
                let _ = stdin.write_all(&input).await;
                drop(stdin);
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(out) => out.map_err(spawn_err)?,
            Err(_) => return Err(ProposerError::Timeout(self.timeout.as_millis() as u64)),
        };

        if !output.status.success() {
            return Err(ProposerError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let change: ProposedChange = serde_json::from_slice(&output.stdout)
            .map_err(|e| ProposerError::InvalidOutput(e.to_string()))?;
        change
            .diff
            .validate()
            .map_err(|e| ProposerError::InvalidOutput(e.to_string()))?;
        debug!(edits = change.diff.edits.len(), "proposal received");
        Ok(change)
    }
}

/// Returns the same answer every time.
#[derive(Debug, Clone)]
pub struct StaticProposer {
    answer: Result<ProposedChange, String>,
}

impl StaticProposer {
    pub fn new(change: ProposedChange) -> Self {
        Self { answer: Ok(change) }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            answer: Err(message.into()),
        }
    }
}

#[async_trait]
impl ProposalCollaborator for StaticProposer {
    async fn propose(&self, _context: &ProposalContext) -> Result<ProposedChange, ProposerError> {
        self.answer.clone().map_err(ProposerError::Declined)
    }
}
