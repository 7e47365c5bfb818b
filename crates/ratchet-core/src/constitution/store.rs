//! Constraint store: the rule set, loaded once and verified.
//!
//! Document layout (TOML shown; JSON with the same shape is accepted when the
//! file ends in `.json`):
//!
//! ```toml
//! integrity = "<sha256 of canonical JSON of [rules]>"
//!
//! [[rules.immutable]]
//! id = "no-archive-delete"
//! description = "Archived versions are never deleted"
//! detector = { type = "operation_kind", kinds = ["delete_resource"] }
//! action = { type = "deny", reason = "archive is append-only" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::digest::{digest_of, verify_digest};
use crate::domain::RatchetError;

use super::constraint::{Constraint, ConstraintCategory, ConstraintDef};
use super::error::{ConstitutionError, ConstitutionResult};

/// The three rule arrays, in document form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub immutable: Vec<ConstraintDef>,
    #[serde(default)]
    pub supervised: Vec<ConstraintDef>,
    #[serde(default)]
    pub autonomous: Vec<ConstraintDef>,
}

impl RuleSet {
    /// SHA-256 over the canonical JSON of the rule set.
    pub fn digest(&self) -> ConstitutionResult<String> {
        Ok(digest_of(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstitutionDocument {
    #[serde(default)]
    pub integrity: Option<String>,
    pub rules: RuleSet,
}

impl ConstitutionDocument {
    pub fn from_toml_str(s: &str) -> ConstitutionResult<Self> {
        toml::from_str(s).map_err(|e| ConstitutionError::Parse(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> ConstitutionResult<Self> {
        serde_json::from_str(s).map_err(|e| ConstitutionError::Parse(e.to_string()))
    }

    pub fn read(path: &Path) -> ConstitutionResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConstitutionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }
}

/// Compute the integrity value for a constitution file. Operators paste the
/// result into the document's `integrity` field (and, optionally, pin it in
/// configuration).
pub fn seal(path: &Path) -> ConstitutionResult<String> {
    ConstitutionDocument::read(path)?.rules.digest()
}

/// Verified, compiled, read-only rule set.
#[derive(Debug)]
pub struct ConstraintStore {
    digest: String,
    source: Option<PathBuf>,
    immutable: Vec<Constraint>,
    supervised: Vec<Constraint>,
    autonomous: Vec<Constraint>,
}

impl ConstraintStore {
    /// Load and verify the document at `path`.
    ///
    /// Fails if the document's own integrity digest does not match its
    /// content, or if `pinned` is given and differs.
    pub fn load(path: &Path, pinned: Option<&str>) -> ConstitutionResult<Self> {
        let doc = ConstitutionDocument::read(path)?;
        let mut store = Self::from_document(doc, pinned)?;
        store.source = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            digest = %store.digest,
            constraints = store.len(),
            "constitution loaded"
        );
        Ok(store)
    }

    pub fn from_document(
        doc: ConstitutionDocument,
        pinned: Option<&str>,
    ) -> ConstitutionResult<Self> {
        let actual = doc.rules.digest()?;
        let declared = doc.integrity.ok_or(ConstitutionError::MissingIntegrity)?;
        verify_digest(&declared, &actual).map_err(|e| match e {
            RatchetError::DigestMismatch { expected, actual } => {
                ConstitutionError::IntegrityMismatch { expected, actual }
            }
            other => other.into(),
        })?;
        if let Some(pinned) = pinned {
            if !pinned.eq_ignore_ascii_case(&actual) {
                warn!(pinned = %pinned, actual = %actual, "pinned constitution digest mismatch");
                return Err(ConstitutionError::PinnedDigestMismatch {
                    expected: pinned.to_string(),
                    actual,
                });
            }
        }

        let mut seen = HashSet::new();
        let mut compile = |category, defs: &[ConstraintDef]| {
            defs.iter()
                .map(|def| {
                    if !seen.insert(def.id.clone()) {
                        return Err(ConstitutionError::DuplicateConstraint(def.id.clone()));
                    }
                    Constraint::compile(category, def)
                })
                .collect::<ConstitutionResult<Vec<_>>>()
        };
        let immutable = compile(ConstraintCategory::Immutable, &doc.rules.immutable)?;
        let supervised = compile(ConstraintCategory::Supervised, &doc.rules.supervised)?;
        let autonomous = compile(ConstraintCategory::Autonomous, &doc.rules.autonomous)?;

        Ok(Self {
            digest: actual,
            source: None,
            immutable,
            supervised,
            autonomous,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn immutable(&self) -> &[Constraint] {
        &self.immutable
    }

    pub fn supervised(&self) -> &[Constraint] {
        &self.supervised
    }

    pub fn autonomous(&self) -> &[Constraint] {
        &self.autonomous
    }

    pub fn by_category(&self, category: ConstraintCategory) -> &[Constraint] {
        match category {
            ConstraintCategory::Immutable => &self.immutable,
            ConstraintCategory::Supervised => &self.supervised,
            ConstraintCategory::Autonomous => &self.autonomous,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.immutable
            .iter()
            .chain(&self.supervised)
            .chain(&self.autonomous)
    }

    pub fn get(&self, id: &str) -> Option<&Constraint> {
        self.iter().find(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.immutable.len() + self.supervised.len() + self.autonomous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
[[rules.immutable]]
id = "no-delete"
description = "never delete without approval"
detector = { type = "operation_kind", kinds = ["delete_resource"] }
action = { type = "deny", reason = "deletion is forbidden" }

[[rules.supervised]]
id = "rollback-review"
description = "rollbacks need a human"
detector = { type = "operation_kind", kinds = ["rollback"] }
action = { type = "require_approval", timeout_secs = 600 }

[[rules.autonomous]]
id = "archive-tested"
description = "archive tested versions"
detector = { type = "operation_kind", kinds = ["archive_version"] }
action = { type = "allow", prerequisites = [{ type = "tests_pass" }] }
"#;

    fn sealed() -> String {
        let doc = ConstitutionDocument::from_toml_str(RULES).unwrap();
        let digest = doc.rules.digest().unwrap();
        format!("integrity = \"{digest}\"\n{RULES}")
    }

    #[test]
    fn loads_sealed_document() {
        let doc = ConstitutionDocument::from_toml_str(&sealed()).unwrap();
        let store = ConstraintStore::from_document(doc, None).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.immutable()[0].id(), "no-delete");
        assert!(store.get("rollback-review").is_some());
    }

    #[test]
    fn tampered_document_is_rejected() {
        let tampered = sealed().replace("deletion is forbidden", "deletion is fine");
        let doc = ConstitutionDocument::from_toml_str(&tampered).unwrap();
        let err = ConstraintStore::from_document(doc, None).unwrap_err();
        assert!(matches!(err, ConstitutionError::IntegrityMismatch { .. }));
    }

    #[test]
    fn unsealed_document_is_rejected() {
        let doc = ConstitutionDocument::from_toml_str(RULES).unwrap();
        let err = ConstraintStore::from_document(doc, None).unwrap_err();
        assert!(matches!(err, ConstitutionError::MissingIntegrity));
    }

    #[test]
    fn pinned_digest_must_match() {
        let doc = ConstitutionDocument::from_toml_str(&sealed()).unwrap();
        let err = ConstraintStore::from_document(doc, Some(&"0".repeat(64))).unwrap_err();
        assert!(matches!(err, ConstitutionError::PinnedDigestMismatch { .. }));
    }

    #[test]
    fn toml_and_json_digest_identically() {
        let toml_doc = ConstitutionDocument::from_toml_str(RULES).unwrap();
        let json = serde_json::to_string(&toml_doc).unwrap();
        let json_doc = ConstitutionDocument::from_json_str(&json).unwrap();
        assert_eq!(
            toml_doc.rules.digest().unwrap(),
            json_doc.rules.digest().unwrap()
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dup = RULES.replace("rollback-review", "no-delete");
        let doc = ConstitutionDocument::from_toml_str(&dup).unwrap();
        let digest = doc.rules.digest().unwrap();
        let doc = ConstitutionDocument {
            integrity: Some(digest),
            ..doc
        };
        let err = ConstraintStore::from_document(doc, None).unwrap_err();
        assert!(matches!(err, ConstitutionError::DuplicateConstraint(_)));
    }

    #[test]
    fn seal_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constitution.toml");
        std::fs::write(&path, sealed()).unwrap();
        let digest = seal(&path).unwrap();
        let store = ConstraintStore::load(&path, Some(&digest)).unwrap();
        assert_eq!(store.digest(), digest);
        assert_eq!(store.source(), Some(path.as_path()));
    }
}
