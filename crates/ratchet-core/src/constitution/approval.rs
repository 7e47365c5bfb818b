//! Approval gateways for `RequireApproval` decisions.
//!
//! A gateway collects human votes on an operation. [`request_approval`]
//! bounds the wait and resolves the votes against the approval method: any
//! rejection blocks, otherwise enough distinct approvers approve.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{ApprovalMethod, Decision, Operation};

use super::error::{ConstitutionError, ConstitutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub voter: String,
    pub decision: VoteDecision,
    pub comment: Option<String>,
    pub voted_at: DateTime<Utc>,
}

impl ApprovalVote {
    pub fn new(voter: impl Into<String>, decision: VoteDecision, comment: Option<String>) -> Self {
        Self {
            voter: voter.into(),
            decision,
            comment,
            voted_at: Utc::now(),
        }
    }
}

/// What the gateway is asked to approve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub operation: Operation,
    pub method: ApprovalMethod,
    pub timeout_secs: u64,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Build a request from a `RequireApproval` decision; `None` otherwise.
    pub fn from_decision(operation: &Operation, decision: &Decision) -> Option<Self> {
        match decision {
            Decision::RequireApproval {
                method,
                timeout_secs,
                reason,
                ..
            } => Some(Self {
                operation: operation.clone(),
                method: method.clone(),
                timeout_secs: *timeout_secs,
                reason: reason.clone(),
                requested_at: Utc::now(),
            }),
            _ => None,
        }
    }

    pub fn required_approvals(&self) -> usize {
        match self.method {
            ApprovalMethod::HumanReview => 1,
            ApprovalMethod::Quorum { approvals } => approvals.max(1) as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { approvers: Vec<String> },
    Rejected { by: String, reason: String },
    /// Votes arrived but were not enough to approve.
    Insufficient { approvals: usize, required: usize },
    TimedOut,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved { .. })
    }
}

/// Resolve collected votes against the request's method.
pub fn resolve_votes(request: &ApprovalRequest, votes: &[ApprovalVote]) -> ApprovalOutcome {
    if let Some(v) = votes.iter().find(|v| v.decision == VoteDecision::Reject) {
        return ApprovalOutcome::Rejected {
            by: v.voter.clone(),
            reason: v
                .comment
                .clone()
                .unwrap_or_else(|| format!("rejected by {}", v.voter)),
        };
    }
    let approvers: BTreeSet<&str> = votes
        .iter()
        .filter(|v| v.decision == VoteDecision::Approve)
        .map(|v| v.voter.as_str())
        .collect();
    let required = request.required_approvals();
    if approvers.len() >= required {
        ApprovalOutcome::Approved {
            approvers: approvers.into_iter().map(str::to_string).collect(),
        }
    } else {
        ApprovalOutcome::Insufficient {
            approvals: approvers.len(),
            required,
        }
    }
}

/// Source of human votes.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Collect votes for `request`. May wait for humans; the caller bounds
    /// the wait.
    async fn collect_votes(&self, request: &ApprovalRequest) -> ConstitutionResult<Vec<ApprovalVote>>;
}

/// Ask `gateway` and wait at most `min(request.timeout_secs, max_wait)`.
pub async fn request_approval(
    gateway: &dyn ApprovalGateway,
    request: &ApprovalRequest,
    max_wait: Duration,
) -> ConstitutionResult<ApprovalOutcome> {
    let wait = Duration::from_secs(request.timeout_secs).min(max_wait);
    match tokio::time::timeout(wait, gateway.collect_votes(request)).await {
        Ok(votes) => {
            let outcome = resolve_votes(request, &votes?);
            info!(
                operation_id = %request.operation.id(),
                outcome = ?outcome,
                "approval resolved"
            );
            Ok(outcome)
        }
        Err(_) => {
            warn!(
                operation_id = %request.operation.id(),
                wait_secs = wait.as_secs(),
                "approval timed out"
            );
            Ok(ApprovalOutcome::TimedOut)
        }
    }
}

// ---------------------------------------------------------------------------
// Gateways
// ---------------------------------------------------------------------------

/// Replays a fixed set of votes, or never answers.
#[derive(Debug, Clone, Default)]
pub struct StaticGateway {
    votes: Option<Vec<ApprovalVote>>,
}

impl StaticGateway {
    pub fn approve<I, S>(voters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            votes: Some(
                voters
                    .into_iter()
                    .map(|v| ApprovalVote::new(v, VoteDecision::Approve, None))
                    .collect(),
            ),
        }
    }

    pub fn reject(voter: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            votes: Some(vec![ApprovalVote::new(
                voter,
                VoteDecision::Reject,
                Some(comment.into()),
            )]),
        }
    }

    /// A gateway nobody answers; every request times out.
    pub fn silent() -> Self {
        Self { votes: None }
    }
}

#[async_trait]
impl ApprovalGateway for StaticGateway {
    async fn collect_votes(&self, _request: &ApprovalRequest) -> ConstitutionResult<Vec<ApprovalVote>> {
        match &self.votes {
            Some(v) => Ok(v.clone()),
            None => std::future::pending().await,
        }
    }
}

/// File-drop gateway used by the daemon.
///
/// Requests are written to `<dir>/pending/<operation-id>.json`; reviewers
/// answer with `ratchet approve`, which writes
/// `<dir>/votes/<operation-id>/<voter>.json`. The gateway polls the vote
/// directory until the votes resolve the request.
#[derive(Debug, Clone)]
pub struct FileApprovalGateway {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileApprovalGateway {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pending_path(&self, operation_id: &str) -> PathBuf {
        self.dir.join("pending").join(format!("{operation_id}.json"))
    }

    pub fn votes_dir(&self, operation_id: &str) -> PathBuf {
        self.dir.join("votes").join(operation_id)
    }

    /// Record a vote for a pending operation.
    pub fn cast_vote(&self, operation_id: &str, vote: &ApprovalVote) -> ConstitutionResult<PathBuf> {
        if !self.pending_path(operation_id).exists() {
            return Err(ConstitutionError::Approval(format!(
                "no pending approval request {operation_id}"
            )));
        }
        let dir = self.votes_dir(operation_id);
        std::fs::create_dir_all(&dir).map_err(|source| ConstitutionError::Io {
            path: dir.clone(),
            source,
        })?;
        let safe_voter: String = vote
            .voter
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{safe_voter}.json"));
        write_json(&path, vote)?;
        Ok(path)
    }

    /// Requests still waiting for votes.
    pub fn pending(&self) -> ConstitutionResult<Vec<ApprovalRequest>> {
        let dir = self.dir.join("pending");
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ConstitutionError::Io { path: dir, source }),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let text = std::fs::read_to_string(entry.path()).map_err(|source| {
                ConstitutionError::Io {
                    path: entry.path(),
                    source,
                }
            })?;
            out.push(
                serde_json::from_str(&text).map_err(|e| ConstitutionError::Approval(e.to_string()))?,
            );
        }
        Ok(out)
    }

    fn read_votes(&self, operation_id: &str) -> Vec<ApprovalVote> {
        let Ok(entries) = std::fs::read_dir(self.votes_dir(operation_id)) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .filter_map(|text| serde_json::from_str(&text).ok())
            .collect()
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> ConstitutionResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| ConstitutionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let json = serde_json::to_vec_pretty(value).map_err(|e| ConstitutionError::Approval(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| ConstitutionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    std::io::Write::write_all(&mut tmp, &json).map_err(|source| ConstitutionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.persist(path).map_err(|e| ConstitutionError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Removes the pending request when the wait ends, however it ends.
struct PendingGuard(PathBuf);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl ApprovalGateway for FileApprovalGateway {
    async fn collect_votes(&self, request: &ApprovalRequest) -> ConstitutionResult<Vec<ApprovalVote>> {
        let id = request.operation.id().to_string();
        let pending = self.pending_path(&id);
        write_json(&pending, request)?;
        let _guard = PendingGuard(pending);
        info!(operation_id = %id, reason = %request.reason, "approval requested");

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let votes = self.read_votes(&id);
            match resolve_votes(request, &votes) {
                ApprovalOutcome::Insufficient { approvals, required } => {
                    debug!(operation_id = %id, approvals, required, "waiting for votes");
                }
                _ => return Ok(votes),
            }
        }
    }
}
