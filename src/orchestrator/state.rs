use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::goal::Verdict;

/// Run loop states.
///
/// `INIT -> PLANNING -> EXECUTING -> OBSERVING -> (PLANNING | DONE_*)`; a
/// terminal directive from the Planner jumps from PLANNING straight to
/// DONE_PASS or DONE_FAIL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Planning,
    Executing,
    Observing,
    DonePass,
    DoneFail,
    DoneError(ErrorKind),
}

impl RunState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            RunState::DonePass | RunState::DoneFail | RunState::DoneError(_)
        )
    }

    /// Whether moving to `next` follows the loop's edges.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Init, Planning) => true,
            (Planning, Executing | DonePass | DoneFail) => true,
            (Executing, Observing) => true,
            (Observing, Planning) => true,
            // Fatal errors can end the run from any live state.
            (s, DoneError(_)) => !s.is_done(),
            _ => false,
        }
    }

    /// Verdict this terminal state implies before supervision.
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            RunState::DonePass => Some(Verdict::Pass),
            RunState::DoneFail => Some(Verdict::Fail),
            RunState::DoneError(_) => Some(Verdict::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Init => write!(f, "INIT"),
            RunState::Planning => write!(f, "PLANNING"),
            RunState::Executing => write!(f, "EXECUTING"),
            RunState::Observing => write!(f, "OBSERVING"),
            RunState::DonePass => write!(f, "DONE_PASS"),
            RunState::DoneFail => write!(f, "DONE_FAIL"),
            RunState::DoneError(kind) => write!(f, "DONE_ERROR({})", kind),
        }
    }
}

/// Detects K consecutive steps that leave the state hash unchanged.
#[derive(Debug, Clone)]
pub struct StuckDetector {
    threshold: u32,
    last_hash: String,
    unchanged: u32,
}

impl StuckDetector {
    /// Start from the hash of the state observed before the first step.
    pub fn new(threshold: u32, initial_hash: impl Into<String>) -> Self {
        Self {
            threshold: threshold.max(1),
            last_hash: initial_hash.into(),
            unchanged: 0,
        }
    }

    /// Feed the hash observed after a step. Returns true once the hash has
    /// been unchanged for `threshold` consecutive steps.
    pub fn observe(&mut self, hash: &str) -> bool {
        if hash == self.last_hash {
            self.unchanged += 1;
        } else {
            self.last_hash = hash.to_string();
            self.unchanged = 0;
        }
        self.unchanged >= self.threshold
    }

    pub fn unchanged_steps(&self) -> u32 {
        self.unchanged
    }
}
