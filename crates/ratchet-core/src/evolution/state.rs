//! Cycle state machine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Baseline,
    Propose,
    ConstitutionCheck,
    SandboxTest,
    CandidateBenchmark,
    Decide,
    Archive,
    Discard,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Baseline => "baseline",
            CycleState::Propose => "propose",
            CycleState::ConstitutionCheck => "constitution_check",
            CycleState::SandboxTest => "sandbox_test",
            CycleState::CandidateBenchmark => "candidate_benchmark",
            CycleState::Decide => "decide",
            CycleState::Archive => "archive",
            CycleState::Discard => "discard",
        }
    }

    /// Forward edges of the cycle. Every working state may drop to
    /// `Discard`; only `Archive` and `Discard` return to `Idle`.
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, next),
            (Idle, Baseline)
                | (Baseline, Propose)
                | (Propose, ConstitutionCheck)
                | (ConstitutionCheck, SandboxTest)
                | (SandboxTest, CandidateBenchmark)
                | (CandidateBenchmark, Decide)
                | (Decide, Archive)
                | (Archive, Idle)
                | (Discard, Idle)
                | (
                    Baseline
                        | Propose
                        | ConstitutionCheck
                        | SandboxTest
                        | CandidateBenchmark
                        | Decide
                        | Archive,
                    Discard
                )
        )
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CycleState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Idle,
            Baseline,
            Propose,
            ConstitutionCheck,
            SandboxTest,
            CandidateBenchmark,
            Decide,
            Archive,
            Idle,
        ];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn skipping_gates_is_illegal() {
        assert!(!Propose.can_transition_to(SandboxTest));
        assert!(!ConstitutionCheck.can_transition_to(Archive));
        assert!(!Idle.can_transition_to(Discard));
        assert!(!Baseline.can_transition_to(Idle));
        assert!(!Discard.can_transition_to(Archive));
    }

    #[test]
    fn every_working_state_can_discard() {
        for s in [Baseline, Propose, ConstitutionCheck, SandboxTest, CandidateBenchmark, Decide] {
            assert!(s.can_transition_to(Discard));
        }
    }
}
