//! Improvement gate: the score rules a candidate must meet before it can be
//! archived.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegressionPolicy {
    /// Allowed relative drop below the baseline.
    pub tolerance: f64,
    /// Absolute gain required to archive.
    pub min_improvement: f64,
}

impl Default for RegressionPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.05,
            min_improvement: 0.01,
        }
    }
}

impl RegressionPolicy {
    pub fn is_regression(&self, candidate: f64, baseline: f64) -> bool {
        candidate < baseline * (1.0 - self.tolerance)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err(format!("tolerance must be in [0, 1), got {}", self.tolerance));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(format!(
                "min_improvement must be non-negative, got {}",
                self.min_improvement
            ));
        }
        Ok(())
    }

    pub fn evaluate(&self, baseline: f64, candidate: f64) -> ImprovementVerdict {
        let mut violations = Vec::new();
        let gain = candidate - baseline;
        if self.is_regression(candidate, baseline) {
            violations.push(GateViolation {
                rule: GateRule::Regression,
                reason: format!(
                    "candidate {candidate:.4} below baseline {baseline:.4} by more than {:.1}%",
                    self.tolerance * 100.0
                ),
            });
        }
        // Epsilon keeps 0.80 -> 0.81 from failing a 0.01 threshold on rounding.
        if gain + 1e-12 < self.min_improvement {
            violations.push(GateViolation {
                rule: GateRule::MinImprovement,
                reason: format!(
                    "gain {gain:.4} below required {:.4}",
                    self.min_improvement
                ),
            });
        }
        ImprovementVerdict {
            baseline,
            candidate,
            violations,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateRule {
    Regression,
    MinImprovement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateViolation {
    pub rule: GateRule,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImprovementVerdict {
    pub baseline: f64,
    pub candidate: f64,
    pub violations: Vec<GateViolation>,
}

impl ImprovementVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn is_regression(&self) -> bool {
        self.violations.iter().any(|v| v.rule == GateRule::Regression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn improvement_passes() {
        let v = RegressionPolicy::default().evaluate(0.80, 0.83);
        assert!(v.passed());
    }

    #[test]
    fn exact_min_improvement_passes() {
        assert!(RegressionPolicy::default().evaluate(0.80, 0.81).passed());
    }

    #[test]
    fn small_drop_is_not_regression_but_not_improvement() {
        let v = RegressionPolicy::default().evaluate(0.80, 0.79);
        assert!(!v.passed());
        assert!(!v.is_regression());
    }

    #[test]
    fn large_drop_is_regression() {
        let p = RegressionPolicy::default();
        assert!(p.is_regression(0.70, 0.80));
        assert!(!p.is_regression(0.77, 0.80));
        assert!(p.evaluate(0.80, 0.70).is_regression());
    }

    #[test]
    fn validation() {
        assert!(RegressionPolicy::default().validate().is_ok());
        let bad = RegressionPolicy {
            tolerance: 1.5,
            ..RegressionPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
