//! Durable memory of what worked (and what did not) per screen and goal.
//!
//! - `ContextKey`: `(screen_id, goal)`, compared by exact string equality
//! - `Pattern`: an ordered action list that completed a goal from a context
//! - `FailureEntry`: an action list that failed from a context, with a count
//! - `RewardTable`: advisory per-action-kind score, EMA-updated
//!
//! [`MemoryStore`] owns all of it and persists to one JSON file.

mod store;

pub use store::{DEFAULT_AVOID_THRESHOLD, DEFAULT_MAX_PATTERNS, MemoryStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::action::{Action, ActionKind};
use crate::goal::Verdict;

/// Weight kept from the previous reward on each update.
pub const REWARD_DECAY: f64 = 0.9;

/// Reward delta per step of a run that passed.
pub const SUCCESS_REWARD: f64 = 0.2;

/// Reward delta for a step that failed.
pub const FAILURE_PENALTY: f64 = -0.5;

/// Exact-match lookup key for patterns and failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub screen_id: String,
    pub goal: String,
}

impl ContextKey {
    pub fn new(screen_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            screen_id: screen_id.into(),
            goal: goal.into(),
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} :: {}", self.screen_id, self.goal)
    }
}

/// A replayable action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub context: ContextKey,
    pub actions: Vec<Action>,
    pub use_count: u32,
    pub last_outcome: Verdict,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(context: ContextKey, actions: Vec<Action>, outcome: Verdict) -> Self {
        let now = Utc::now();
        Self {
            context,
            actions,
            use_count: 1,
            last_outcome: outcome,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The directive that concludes a fully replayed pattern.
    pub fn terminal_action(&self) -> Option<Action> {
        let reason = format!("Replayed {} remembered steps", self.actions.len());
        match self.last_outcome {
            Verdict::Pass => Some(Action::AssertPass { reason }),
            Verdict::Fail => Some(Action::AssertFail { reason }),
            Verdict::Error => None,
        }
    }

    /// Ordering used for retrieval (max wins) and eviction (min loses).
    fn rank(&self) -> (u32, DateTime<Utc>) {
        (self.use_count, self.last_used_at)
    }
}

/// An action sequence that failed from a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub actions: Vec<Action>,
    pub reason: String,
    pub count: u32,
    pub last_failed_at: DateTime<Utc>,
}

/// Advisory action-kind scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardTable {
    scores: BTreeMap<ActionKind, f64>,
}

impl RewardTable {
    pub fn get(&self, kind: ActionKind) -> f64 {
        self.scores.get(&kind).copied().unwrap_or(0.0)
    }

    /// `reward = reward * 0.9 + delta * 0.1`, returning the new value.
    pub fn update(&mut self, kind: ActionKind, delta: f64) -> f64 {
        let score = self.scores.entry(kind).or_insert(0.0);
        *score = *score * REWARD_DECAY + delta * (1.0 - REWARD_DECAY);
        *score
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionKind, f64)> + '_ {
        self.scores.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}
