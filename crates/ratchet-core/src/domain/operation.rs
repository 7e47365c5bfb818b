//! Operations submitted to the constitution engine.
//!
//! An [`Operation`] is built once through [`OperationBuilder`] and is
//! immutable afterwards; there are no setters.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an operation would do if allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    ApplyPatch,
    ExecuteSandbox,
    ArchiveVersion,
    Rollback,
    DeleteResource,
    LoadConstitution,
    SetEmergencyStop,
    ClearEmergencyStop,
    DisposeQuarantine,
    ListVersions,
    Custom(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::ApplyPatch => "apply_patch",
            OperationKind::ExecuteSandbox => "execute_sandbox",
            OperationKind::ArchiveVersion => "archive_version",
            OperationKind::Rollback => "rollback",
            OperationKind::DeleteResource => "delete_resource",
            OperationKind::LoadConstitution => "load_constitution",
            OperationKind::SetEmergencyStop => "set_emergency_stop",
            OperationKind::ClearEmergencyStop => "clear_emergency_stop",
            OperationKind::DisposeQuarantine => "dispose_quarantine",
            OperationKind::ListVersions => "list_versions",
            OperationKind::Custom(s) => s,
        }
    }
}

impl From<String> for OperationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "apply_patch" => OperationKind::ApplyPatch,
            "execute_sandbox" => OperationKind::ExecuteSandbox,
            "archive_version" => OperationKind::ArchiveVersion,
            "rollback" => OperationKind::Rollback,
            "delete_resource" => OperationKind::DeleteResource,
            "load_constitution" => OperationKind::LoadConstitution,
            "set_emergency_stop" => OperationKind::SetEmergencyStop,
            "clear_emergency_stop" => OperationKind::ClearEmergencyStop,
            "dispose_quarantine" => OperationKind::DisposeQuarantine,
            "list_versions" => OperationKind::ListVersions,
            _ => OperationKind::Custom(s),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(s: &str) -> Self {
        OperationKind::from(s.to_string())
    }
}

impl From<OperationKind> for String {
    fn from(k: OperationKind) -> Self {
        k.as_str().to_string()
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an actor's authority comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorOrigin {
    Agent,
    Human,
    System,
}

impl std::fmt::Display for ActorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorOrigin::Agent => f.write_str("agent"),
            ActorOrigin::Human => f.write_str("human"),
            ActorOrigin::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub origin: ActorOrigin,
}

impl Actor {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: ActorOrigin::Agent,
        }
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: ActorOrigin::Human,
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: ActorOrigin::System,
        }
    }

    pub fn is_human(&self) -> bool {
        self.origin == ActorOrigin::Human
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.origin, self.id)
    }
}

/// A request to perform a state-changing action, evaluated by the
/// constitution engine before the action happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: Uuid,
    kind: OperationKind,
    target: String,
    payload: serde_json::Value,
    actor: Actor,
    submitted_at: DateTime<Utc>,
    attestations: BTreeSet<String>,
}

impl Operation {
    pub fn builder(kind: impl Into<OperationKind>, actor: Actor) -> OperationBuilder {
        OperationBuilder {
            kind: kind.into(),
            actor,
            target: String::new(),
            payload: serde_json::Value::Null,
            attestations: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn is_attested(&self, name: &str) -> bool {
        self.attestations.contains(name)
    }

    pub fn attestations(&self) -> impl Iterator<Item = &str> {
        self.attestations.iter().map(String::as_str)
    }

    /// All string leaves of the payload joined by newlines. Payload
    /// detectors match against this text.
    pub fn payload_text(&self) -> String {
        fn walk(v: &serde_json::Value, out: &mut Vec<String>) {
            match v {
                serde_json::Value::String(s) => out.push(s.clone()),
                serde_json::Value::Array(a) => a.iter().for_each(|x| walk(x, out)),
                serde_json::Value::Object(m) => m.values().for_each(|x| walk(x, out)),
                _ => {}
            }
        }
        let mut parts = Vec::new();
        walk(&self.payload, &mut parts);
        parts.join("\n")
    }
}

/// Builder for [`Operation`]. `build` stamps the id and submission time.
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    kind: OperationKind,
    actor: Actor,
    target: String,
    payload: serde_json::Value,
    attestations: BTreeSet<String>,
}

impl OperationBuilder {
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn attest(mut self, name: impl Into<String>) -> Self {
        self.attestations.insert(name.into());
        self
    }

    pub fn build(self) -> Operation {
        Operation {
            id: Uuid::new_v4(),
            kind: self.kind,
            target: self.target,
            payload: self.payload,
            actor: self.actor,
            submitted_at: Utc::now(),
            attestations: self.attestations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        assert_eq!(OperationKind::from("rollback"), OperationKind::Rollback);
        assert_eq!(
            OperationKind::from("list_versions"),
            OperationKind::ListVersions
        );
        assert_eq!(
            OperationKind::from("reindex"),
            OperationKind::Custom("reindex".to_string())
        );
        let json = serde_json::to_string(&OperationKind::ApplyPatch).unwrap();
        assert_eq!(json, "\"apply_patch\"");
    }

    #[test]
    fn payload_text_flattens_string_leaves() {
        let op = Operation::builder(OperationKind::ApplyPatch, Actor::agent("evolver"))
            .payload(serde_json::json!({
                "edits": [{"path": "a.py", "content": "rm -rf /"}],
                "count": 1
            }))
            .build();
        let text = op.payload_text();
        assert!(text.contains("a.py"));
        assert!(text.contains("rm -rf /"));
        assert!(!text.contains('1'));
    }

    #[test]
    fn builder_collects_attestations() {
        let op = Operation::builder("archive_version", Actor::system("controller"))
            .target("archive")
            .attest("tests_passed")
            .build();
        assert!(op.is_attested("tests_passed"));
        assert!(!op.is_attested("reviewed"));
        assert_eq!(op.target(), "archive");
        assert_eq!(op.actor().to_string(), "system:controller");
    }
}
