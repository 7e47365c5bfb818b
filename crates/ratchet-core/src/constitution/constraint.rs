//! Constraint definitions and their compiled form.
//!
//! `ConstraintDef` / `DetectorDef` are the serde shapes read from the
//! constitution document. [`Constraint`] is the compiled, immutable form the
//! engine evaluates: regexes are compiled once at load time and an invalid
//! pattern fails the load.

use std::path::{Component, Path};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ActorOrigin, ApprovalMethod, Operation, OperationKind};

use super::error::ConstitutionError;

/// Attestation name the evolution controller attaches once the sandbox
/// test run succeeded.
pub const TESTS_PASSED: &str = "tests_passed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintCategory {
    Immutable,
    Supervised,
    Autonomous,
}

impl std::fmt::Display for ConstraintCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintCategory::Immutable => f.write_str("immutable"),
            ConstraintCategory::Supervised => f.write_str("supervised"),
            ConstraintCategory::Autonomous => f.write_str("autonomous"),
        }
    }
}

/// Serialized detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorDef {
    OperationKind { kinds: Vec<OperationKind> },
    TargetPattern { pattern: String },
    PayloadPattern { pattern: String },
    ActorOrigin { origins: Vec<ActorOrigin> },
    All { detectors: Vec<DetectorDef> },
    Any { detectors: Vec<DetectorDef> },
}

/// Something an autonomous rule requires before it allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prerequisite {
    /// The operation carries the `tests_passed` attestation.
    TestsPass,
    /// The operation target is a relative path under `root`.
    InsideWorkspace { root: String },
    /// The operation carries the named attestation.
    Attested { name: String },
    HumanOriginated,
}

impl Prerequisite {
    pub fn satisfied_by(&self, op: &Operation) -> bool {
        match self {
            Prerequisite::TestsPass => op.is_attested(TESTS_PASSED),
            Prerequisite::InsideWorkspace { root } => inside(root, op.target()),
            Prerequisite::Attested { name } => op.is_attested(name),
            Prerequisite::HumanOriginated => op.actor().is_human(),
        }
    }
}

fn inside(root: &str, target: &str) -> bool {
    let target = Path::new(target);
    let clean = target
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    clean && target.starts_with(root)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintAction {
    Deny {
        reason: String,
    },
    RequireApproval {
        #[serde(default)]
        method: ApprovalMethod,
        timeout_secs: u64,
    },
    Allow {
        #[serde(default)]
        prerequisites: Vec<Prerequisite>,
    },
}

impl ConstraintAction {
    fn legal_for(&self, category: ConstraintCategory) -> bool {
        matches!(
            (self, category),
            (ConstraintAction::Deny { .. }, ConstraintCategory::Immutable)
                | (
                    ConstraintAction::RequireApproval { .. },
                    ConstraintCategory::Supervised
                )
                | (ConstraintAction::Allow { .. }, ConstraintCategory::Autonomous)
        )
    }
}

/// One rule as written in the constitution document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub id: String,
    pub description: String,
    pub detector: DetectorDef,
    pub action: ConstraintAction,
}

/// Compiled detector.
#[derive(Debug, Clone)]
pub enum Detector {
    OperationKind(Vec<OperationKind>),
    TargetPattern(Regex),
    PayloadPattern(Regex),
    ActorOrigin(Vec<ActorOrigin>),
    All(Vec<Detector>),
    Any(Vec<Detector>),
}

impl Detector {
    pub fn compile(id: &str, def: &DetectorDef) -> Result<Self, ConstitutionError> {
        let regex = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ConstitutionError::InvalidPattern {
                id: id.to_string(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        };
        Ok(match def {
            DetectorDef::OperationKind { kinds } => Detector::OperationKind(kinds.clone()),
            DetectorDef::TargetPattern { pattern } => Detector::TargetPattern(regex(pattern)?),
            DetectorDef::PayloadPattern { pattern } => Detector::PayloadPattern(regex(pattern)?),
            DetectorDef::ActorOrigin { origins } => Detector::ActorOrigin(origins.clone()),
            DetectorDef::All { detectors } | DetectorDef::Any { detectors } => {
                if detectors.is_empty() {
                    return Err(ConstitutionError::InvalidConstraint {
                        id: id.to_string(),
                        reason: "empty detector group".to_string(),
                    });
                }
                let compiled = detectors
                    .iter()
                    .map(|d| Detector::compile(id, d))
                    .collect::<Result<Vec<_>, _>>()?;
                if matches!(def, DetectorDef::All { .. }) {
                    Detector::All(compiled)
                } else {
                    Detector::Any(compiled)
                }
            }
        })
    }

    pub fn matches(&self, op: &Operation) -> bool {
        match self {
            Detector::OperationKind(kinds) => kinds.contains(op.kind()),
            Detector::TargetPattern(re) => re.is_match(op.target()),
            Detector::PayloadPattern(re) => re.is_match(&op.payload_text()),
            Detector::ActorOrigin(origins) => origins.contains(&op.actor().origin),
            Detector::All(ds) => ds.iter().all(|d| d.matches(op)),
            Detector::Any(ds) => ds.iter().any(|d| d.matches(op)),
        }
    }
}

/// A compiled constraint. Built only by the constraint store.
#[derive(Debug, Clone)]
pub struct Constraint {
    id: String,
    category: ConstraintCategory,
    description: String,
    detector: Detector,
    action: ConstraintAction,
}

impl Constraint {
    pub(crate) fn compile(
        category: ConstraintCategory,
        def: &ConstraintDef,
    ) -> Result<Self, ConstitutionError> {
        if def.id.trim().is_empty() {
            return Err(ConstitutionError::InvalidConstraint {
                id: def.id.clone(),
                reason: "empty id".to_string(),
            });
        }
        if !def.action.legal_for(category) {
            return Err(ConstitutionError::InvalidConstraint {
                id: def.id.clone(),
                reason: format!("action not permitted for {category} constraints"),
            });
        }
        Ok(Self {
            id: def.id.clone(),
            category,
            description: def.description.clone(),
            detector: Detector::compile(&def.id, &def.detector)?,
            action: def.action.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> ConstraintCategory {
        self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn action(&self) -> &ConstraintAction {
        &self.action
    }

    pub fn matches(&self, op: &Operation) -> bool {
        self.detector.matches(op)
    }

    /// Prerequisites of an autonomous constraint that `op` does not meet.
    pub fn unmet_prerequisites(&self, op: &Operation) -> Vec<&Prerequisite> {
        match &self.action {
            ConstraintAction::Allow { prerequisites } => prerequisites
                .iter()
                .filter(|p| !p.satisfied_by(op))
                .collect(),
            _ => Vec::new(),
        }
    }
}
