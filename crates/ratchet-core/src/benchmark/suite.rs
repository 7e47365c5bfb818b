//! Benchmark suites.
//!
//! A suite is fixed when it is loaded: weights are validated to sum to 1.0
//! and the definition is digested so reports name exactly what was run.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::digest::digest_of;

use super::error::{BenchResult, BenchmarkError};
use super::probe::{BenchmarkResult, BenchmarkTarget, CompiledProbe, Probe, ProbeSpec};

pub const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuiteDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "probe")]
    pub probes: Vec<ProbeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuiteReport {
    pub suite_digest: String,
    pub results: Vec<BenchmarkResult>,
    pub aggregate: f64,
}

impl SuiteReport {
    pub fn result(&self, probe_name: &str) -> Option<&BenchmarkResult> {
        self.results.iter().find(|r| r.probe_name == probe_name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BenchmarkResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn claimed_markers(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .flat_map(|r| r.claimed_markers.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkSuite {
    name: String,
    probes: Vec<CompiledProbe>,
    digest: String,
}

impl BenchmarkSuite {
    pub fn from_definition(def: SuiteDefinition) -> BenchResult<Self> {
        if def.probes.is_empty() {
            return Err(BenchmarkError::Empty);
        }
        let digest = digest_of(&def)?;

        let mut seen = HashSet::new();
        let mut probes = Vec::with_capacity(def.probes.len());
        for spec in def.probes {
            if !seen.insert(spec.name.clone()) {
                return Err(BenchmarkError::DuplicateProbe(spec.name));
            }
            probes.push(CompiledProbe::compile(spec)?);
        }

        let sum: f64 = probes.iter().map(CompiledProbe::weight).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(BenchmarkError::InvalidWeights { sum });
        }

        Ok(Self {
            name: def.name,
            probes,
            digest,
        })
    }

    pub fn from_toml_str(s: &str) -> BenchResult<Self> {
        let def: SuiteDefinition =
            toml::from_str(s).map_err(|e| BenchmarkError::Parse(e.to_string()))?;
        Self::from_definition(def)
    }

    pub fn load(path: &Path) -> BenchResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| BenchmarkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let suite = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), digest = %suite.digest, probes = suite.probes.len(), "benchmark suite loaded");
        Ok(suite)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn probes(&self) -> &[CompiledProbe] {
        &self.probes
    }

    /// Run every probe in definition order.
    pub fn run(&self, target: &BenchmarkTarget<'_>) -> SuiteReport {
        let results: Vec<BenchmarkResult> = self.probes.iter().map(|p| p.run(target)).collect();
        let aggregate = self
            .probes
            .iter()
            .zip(&results)
            .map(|(p, r)| p.weight() * r.score.clamp(0.0, 1.0))
            .sum::<f64>()
            .clamp(0.0, 1.0);
        SuiteReport {
            suite_digest: self.digest.clone(),
            results,
            aggregate,
        }
    }

    /// Names of probes carrying `tag`.
    pub fn tagged(&self, tag: &str) -> Vec<&str> {
        self.probes
            .iter()
            .filter(|p| p.has_tag(tag))
            .map(|p| p.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Snapshot;

    const SUITE: &str = r#"
name = "prompt-quality"

[[probe]]
name = "has-readme"
weight = 0.25
kind = "file_exists"
path = "README.md"

[[probe]]
name = "keeps-safety"
weight = 0.25
tags = ["safety"]
kind = "pattern_present"
path = "agent/prompt.md"
pattern = "SAFETY:"

[[probe]]
name = "examples"
weight = 0.5
kind = "pattern_count"
path = "agent/prompt.md"
pattern = "(?m)^Example:"
target = 4
"#;

    #[test]
    fn aggregate_is_weighted_sum() {
        let suite = BenchmarkSuite::from_toml_str(SUITE).unwrap();
        let snap = Snapshot::from_files([
            ("README.md", "hi"),
            ("agent/prompt.md", "SAFETY: x\nExample: a\nExample: b\n"),
        ])
        .unwrap();
        let report = suite.run(&BenchmarkTarget::new(&snap));
        assert!((report.aggregate - 0.75).abs() < 1e-12);
        assert_eq!(report.suite_digest, suite.digest());
        assert_eq!(report.failed().count(), 1);
        assert_eq!(suite.tagged("safety"), vec!["keeps-safety"]);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let bad = SUITE.replace("weight = 0.5", "weight = 0.4");
        assert!(matches!(
            BenchmarkSuite::from_toml_str(&bad),
            Err(BenchmarkError::InvalidWeights { .. })
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let dup = SUITE.replace("name = \"examples\"", "name = \"has-readme\"");
        assert!(matches!(
            BenchmarkSuite::from_toml_str(&dup),
            Err(BenchmarkError::DuplicateProbe(_))
        ));
    }

    #[test]
    fn digest_tracks_definition() {
        let a = BenchmarkSuite::from_toml_str(SUITE).unwrap();
        let b = BenchmarkSuite::from_toml_str(SUITE).unwrap();
        assert_eq!(a.digest(), b.digest());
        let c = BenchmarkSuite::from_toml_str(&SUITE.replace("target = 4", "target = 5")).unwrap();
        assert_ne!(a.digest(), c.digest());
    }
}
