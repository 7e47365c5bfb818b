//! Agent content snapshots and the patches between them.
//!
//! A [`Snapshot`] is the full text content of the agent under improvement,
//! keyed by relative path. Versions in the archive store only the [`Patch`]
//! from their parent; snapshots are rebuilt by replaying patches.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::domain::digest::digest_of;
use crate::domain::error::{RatchetError, Result};

/// Relative-path → text content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    files: BTreeMap<String, String>,
}

/// Reject absolute paths, `..` and empty paths.
pub(crate) fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(RatchetError::InvalidPatch("empty path".to_string()));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(RatchetError::InvalidPatch(format!(
                    "path escapes the snapshot: {path}"
                )))
            }
        }
    }
    Ok(())
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files<I, K, V>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (k, v) in files {
            let k = k.into();
            validate_relative(&k).map_err(|e| RatchetError::InvalidSnapshot(e.to_string()))?;
            map.insert(k, v.into());
        }
        Ok(Self { files: map })
    }

    /// Read every regular file under `root`. Non-UTF-8 files are an error.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let ft = entry.file_type()?;
                if ft.is_dir() {
                    stack.push(path);
                } else if ft.is_file() {
                    let rel = path
                        .strip_prefix(root)
                        .map_err(|e| RatchetError::InvalidSnapshot(e.to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    let content = std::fs::read_to_string(&path).map_err(|e| {
                        RatchetError::InvalidSnapshot(format!("{}: {e}", path.display()))
                    })?;
                    files.insert(rel, content);
                }
            }
        }
        Ok(Self { files })
    }

    /// Write every file beneath `root`, creating directories as needed.
    pub fn write_to(&self, root: &Path) -> Result<()> {
        for (rel, content) in &self.files {
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, content)?;
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content digest over the canonical JSON of the file map.
    pub fn digest(&self) -> Result<String> {
        digest_of(&self.files)
    }
}

/// A single file change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileEdit {
    Write { path: String, content: String },
    Delete { path: String },
}

impl FileEdit {
    pub fn path(&self) -> &str {
        match self {
            FileEdit::Write { path, .. } | FileEdit::Delete { path } => path,
        }
    }
}

/// An ordered list of file edits. This is the "diff" carried by proposals
/// and stored as `diff_from_parent` in the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub edits: Vec<FileEdit>,
}

impl Patch {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        Self { edits }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.edits.iter().map(FileEdit::path)
    }

    pub fn validate(&self) -> Result<()> {
        for edit in &self.edits {
            validate_relative(edit.path())?;
        }
        Ok(())
    }

    /// Apply to `base`, returning the new snapshot. `base` is untouched.
    pub fn apply(&self, base: &Snapshot) -> Result<Snapshot> {
        self.validate()?;
        let mut files = base.files.clone();
        for edit in &self.edits {
            match edit {
                FileEdit::Write { path, content } => {
                    files.insert(path.clone(), content.clone());
                }
                FileEdit::Delete { path } => {
                    if files.remove(path).is_none() {
                        return Err(RatchetError::InvalidPatch(format!(
                            "cannot delete missing file: {path}"
                        )));
                    }
                }
            }
        }
        Ok(Snapshot { files })
    }

    /// Number of lines added or removed relative to `base`. Every edit
    /// counts at least one line.
    pub fn changed_lines(&self, base: &Snapshot) -> usize {
        let mut current: BTreeMap<&str, &str> = base
            .files
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut total = 0;
        for edit in &self.edits {
            let n = match edit {
                FileEdit::Write { path, content } => {
                    let old = current.insert(path.as_str(), content.as_str()).unwrap_or("");
                    line_delta(old, content)
                }
                FileEdit::Delete { path } => current
                    .remove(path.as_str())
                    .map(|old| old.lines().count())
                    .unwrap_or(0),
            };
            total += n.max(1);
        }
        total
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let patch: Patch = serde_json::from_value(value.clone())?;
        patch.validate()?;
        Ok(patch)
    }
}

/// Symmetric difference of the two files' line multisets.
fn line_delta(old: &str, new: &str) -> usize {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for l in old.lines() {
        *counts.entry(l).or_default() += 1;
    }
    for l in new.lines() {
        *counts.entry(l).or_default() -= 1;
    }
    counts.values().map(|c| c.unsigned_abs() as usize).sum()
}
