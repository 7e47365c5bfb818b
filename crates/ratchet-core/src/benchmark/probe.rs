//! Capability probes.
//!
//! A probe is a pure function of a read-only [`BenchmarkTarget`]: same target,
//! same result. Probes never touch the archive or the filesystem.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::Snapshot;

use super::error::{BenchResult, BenchmarkError};

/// What a probe sees: the candidate files and, when the candidate was run
/// in the sandbox, its captured stdout.
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkTarget<'a> {
    pub snapshot: &'a Snapshot,
    pub sandbox_stdout: Option<&'a str>,
}

impl<'a> BenchmarkTarget<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot,
            sandbox_stdout: None,
        }
    }

    pub fn with_sandbox_stdout(mut self, stdout: &'a str) -> Self {
        self.sandbox_stdout = Some(stdout);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    pub probe_name: String,
    pub passed: bool,
    /// In `0.0..=1.0`.
    pub score: f64,
    pub detail: String,
    /// Markers the candidate claims the sandbox run printed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claimed_markers: Vec<String>,
}

pub trait Probe: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, target: &BenchmarkTarget<'_>) -> BenchmarkResult;
}

/// Probe definition as written in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeKind {
    FileExists {
        path: String,
    },
    PatternPresent {
        path: String,
        pattern: String,
    },
    PatternAbsent {
        path: String,
        pattern: String,
    },
    /// Scores `min(matches / target, 1.0)`; passes at `target` matches.
    PatternCount {
        path: String,
        pattern: String,
        target: u32,
    },
    /// Passes when `path` contains `marker`; the marker is then claimed and
    /// must also appear in the sandbox output.
    ReportedMarker {
        path: String,
        marker: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSpec {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub kind: ProbeKind,
}

/// A probe compiled from its [`ProbeSpec`].
#[derive(Debug, Clone)]
pub struct CompiledProbe {
    spec: ProbeSpec,
    regex: Option<Regex>,
}

impl CompiledProbe {
    pub fn compile(spec: ProbeSpec) -> BenchResult<Self> {
        if spec.name.is_empty() {
            return Err(BenchmarkError::InvalidProbe {
                name: spec.name,
                reason: "name is empty".to_string(),
            });
        }
        if !spec.weight.is_finite() || spec.weight < 0.0 {
            return Err(BenchmarkError::InvalidProbe {
                name: spec.name,
                reason: format!("weight {} is not a non-negative number", spec.weight),
            });
        }
        let pattern = match &spec.kind {
            ProbeKind::PatternPresent { pattern, .. }
            | ProbeKind::PatternAbsent { pattern, .. } => Some(pattern.as_str()),
            ProbeKind::PatternCount {
                pattern, target, ..
            } => {
                if *target == 0 {
                    return Err(BenchmarkError::InvalidProbe {
                        name: spec.name,
                        reason: "pattern_count target must be positive".to_string(),
                    });
                }
                Some(pattern.as_str())
            }
            ProbeKind::ReportedMarker { marker, .. } if marker.is_empty() => {
                return Err(BenchmarkError::InvalidProbe {
                    name: spec.name,
                    reason: "marker is empty".to_string(),
                });
            }
            _ => None,
        };
        let regex = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| BenchmarkError::InvalidProbe {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { spec, regex })
    }

    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    pub fn weight(&self) -> f64 {
        self.spec.weight
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.spec.tags.iter().any(|t| t == tag)
    }

    fn result(&self, passed: bool, score: f64, detail: String) -> BenchmarkResult {
        BenchmarkResult {
            probe_name: self.spec.name.clone(),
            passed,
            score,
            detail,
            claimed_markers: Vec::new(),
        }
    }

    fn binary(&self, passed: bool, detail: String) -> BenchmarkResult {
        self.result(passed, if passed { 1.0 } else { 0.0 }, detail)
    }
}

impl Probe for CompiledProbe {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn run(&self, target: &BenchmarkTarget<'_>) -> BenchmarkResult {
        let snapshot = target.snapshot;
        let missing = |path: &str| self.binary(false, format!("{path} missing"));
        let count = |text: &str| self.regex.as_ref().map_or(0, |r| r.find_iter(text).count());

        match &self.spec.kind {
            ProbeKind::FileExists { path } => {
                let found = snapshot.contains(path);
                self.binary(found, format!("{path} {}", if found { "present" } else { "missing" }))
            }
            ProbeKind::PatternPresent { path, .. } => match snapshot.get(path) {
                Some(text) => {
                    let n = count(text);
                    self.binary(n > 0, format!("{n} match(es) in {path}"))
                }
                None => missing(path),
            },
            ProbeKind::PatternAbsent { path, .. } => match snapshot.get(path) {
                Some(text) => {
                    let n = count(text);
                    self.binary(n == 0, format!("{n} match(es) in {path}"))
                }
                // Nothing to match in a file that does not exist.
                None => self.binary(true, format!("{path} missing")),
            },
            ProbeKind::PatternCount { path, target: goal, .. } => match snapshot.get(path) {
                Some(text) => {
                    let n = count(text);
                    let score = (n as f64 / f64::from(*goal)).min(1.0);
                    self.result(n >= *goal as usize, score, format!("{n}/{goal} match(es) in {path}"))
                }
                None => missing(path),
            },
            ProbeKind::ReportedMarker { path, marker } => match snapshot.get(path) {
                Some(text) if text.contains(marker.as_str()) => {
                    let mut r = self.binary(true, format!("{path} reports {marker}"));
                    r.claimed_markers.push(marker.clone());
                    r
                }
                Some(_) => self.binary(false, format!("{path} does not report {marker}")),
                None => missing(path),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(kind: ProbeKind) -> CompiledProbe {
        CompiledProbe::compile(ProbeSpec {
            name: "p".to_string(),
            weight: 1.0,
            tags: vec![],
            kind,
        })
        .unwrap()
    }

    fn snap() -> Snapshot {
        Snapshot::from_files([
            ("agent/prompt.md", "be careful\nSAFETY: never rm -rf\nstep\nstep\n"),
            ("REPORT.md", "all good RESULT_OK"),
        ])
        .unwrap()
    }

    #[test]
    fn pattern_count_scores_partially() {
        let s = snap();
        let p = probe(ProbeKind::PatternCount {
            path: "agent/prompt.md".to_string(),
            pattern: "^step$".to_string(),
            target: 4,
        });
        // `^` and `$` are line anchors only with (?m).
        let r = p.run(&BenchmarkTarget::new(&s));
        assert_eq!(r.score, 0.0);

        let p = probe(ProbeKind::PatternCount {
            path: "agent/prompt.md".to_string(),
            pattern: "(?m)^step$".to_string(),
            target: 4,
        });
        let r = p.run(&BenchmarkTarget::new(&s));
        assert!(!r.passed);
        assert!((r.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn absent_and_present() {
        let s = snap();
        let present = probe(ProbeKind::PatternPresent {
            path: "agent/prompt.md".to_string(),
            pattern: "SAFETY:".to_string(),
        });
        assert!(present.run(&BenchmarkTarget::new(&s)).passed);
        let absent = probe(ProbeKind::PatternAbsent {
            path: "agent/prompt.md".to_string(),
            pattern: "rm -rf /".to_string(),
        });
        assert!(absent.run(&BenchmarkTarget::new(&s)).passed);
        let missing = probe(ProbeKind::PatternPresent {
            path: "nope.md".to_string(),
            pattern: "x".to_string(),
        });
        assert_eq!(missing.run(&BenchmarkTarget::new(&s)).score, 0.0);
    }

    #[test]
    fn reported_marker_claims() {
        let s = snap();
        let p = probe(ProbeKind::ReportedMarker {
            path: "REPORT.md".to_string(),
            marker: "RESULT_OK".to_string(),
        });
        let r = p.run(&BenchmarkTarget::new(&s));
        assert!(r.passed);
        assert_eq!(r.claimed_markers, vec!["RESULT_OK".to_string()]);
    }

    #[test]
    fn invalid_regex_fails_compile() {
        let err = CompiledProbe::compile(ProbeSpec {
            name: "bad".to_string(),
            weight: 0.5,
            tags: vec![],
            kind: ProbeKind::PatternPresent {
                path: "a".to_string(),
                pattern: "(".to_string(),
            },
        })
        .unwrap_err();
        assert!(matches!(err, BenchmarkError::InvalidProbe { .. }));
    }

    #[test]
    fn same_target_same_result() {
        let s = snap();
        let p = probe(ProbeKind::FileExists {
            path: "REPORT.md".to_string(),
        });
        let t = BenchmarkTarget::new(&s);
        assert_eq!(p.run(&t), p.run(&t));
    }
}
