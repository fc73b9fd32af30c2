//! Test goals and verdicts.

use serde::{Deserialize, Serialize};

/// What a test author expects the run to conclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpectedOutcome {
    Pass,
    Fail,
}

/// Outcome of a run or of the Supervisor's judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Error => "ERROR",
        }
    }

    /// ERROR never matches an expectation.
    pub fn matches(&self, expected: ExpectedOutcome) -> bool {
        matches!(
            (self, expected),
            (Verdict::Pass, ExpectedOutcome::Pass) | (Verdict::Fail, ExpectedOutcome::Fail)
        )
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExpectedOutcome> for Verdict {
    fn from(expected: ExpectedOutcome) -> Self {
        match expected {
            ExpectedOutcome::Pass => Verdict::Pass,
            ExpectedOutcome::Fail => Verdict::Fail,
        }
    }
}

/// A natural-language test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestGoal {
    pub id: String,
    pub goal: String,
    pub expected: ExpectedOutcome,
}

impl TestGoal {
    pub fn new(id: impl Into<String>, goal: impl Into<String>, expected: ExpectedOutcome) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            expected,
        }
    }

    pub fn expect_pass(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self::new(id, goal, ExpectedOutcome::Pass)
    }

    pub fn expect_fail(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self::new(id, goal, ExpectedOutcome::Fail)
    }
}
