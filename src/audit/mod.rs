//! Run records and the append-only sink they are written to.

mod logger;

pub use logger::JsonRunLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;
use crate::errors::ErrorKind;
use crate::goal::{ExpectedOutcome, TestGoal, Verdict};
use crate::memory::ContextKey;
use crate::planner::DecisionSource;
use crate::reasoning::CallCounts;
use crate::resolver::ResolutionTier;
use crate::subgoal::SubgoalProgress;
use crate::supervisor::{AssertionResult, SupervisorReport};

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub action: Action,
    pub source: DecisionSource,
    /// Tier that carried the action out; `None` for actions that need no lookup
    /// and for steps where every tier failed
    pub tier: Option<ResolutionTier>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Context the action was planned under
    pub context: ContextKey,
    /// Hash of the state observed after the action
    pub state_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    /// `ok`, or the error kind and detail.
    pub fn outcome_label(&self) -> String {
        match (self.success, self.error) {
            (true, _) => "ok".to_string(),
            (false, Some(kind)) if self.detail.is_empty() => kind.to_string(),
            (false, Some(kind)) => format!("{}: {}", kind, self.detail),
            (false, None) => "failed".to_string(),
        }
    }
}

/// Per-run tallies kept next to the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Reasoning calls, retries and vision lookups included
    pub reasoning_calls: u32,
    /// Reasoning calls answered with a rate limit
    pub rate_limit_hits: u32,
    /// Steps served from memory
    pub replayed_steps: u32,
    /// Back, home and relaunch steps
    pub recoveries: u32,
}

impl RunCounters {
    pub fn collect(history: &[ActionRecord], calls: CallCounts) -> Self {
        Self {
            reasoning_calls: calls.calls,
            rate_limit_hits: calls.rate_limited,
            replayed_steps: history
                .iter()
                .filter(|r| r.source == DecisionSource::Memory)
                .count() as u32,
            recoveries: history.iter().filter(|r| r.action.is_recovery()).count() as u32,
        }
    }

    pub fn rate_limited(&self) -> bool {
        self.rate_limit_hits > 0
    }
}

/// Final outcome of one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub goal_id: String,
    pub goal: String,
    pub expected: ExpectedOutcome,
    pub status: Verdict,
    /// Machine-readable reason when `status` is ERROR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<SupervisorReport>,
    pub history: Vec<ActionRecord>,
    #[serde(default)]
    pub counters: RunCounters,
    #[serde(default, skip_serializing_if = "SubgoalProgress::is_empty")]
    pub subgoals: SubgoalProgress,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunResult {
    pub fn new(run_id: Uuid, goal: &TestGoal, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            goal_id: goal.id.clone(),
            goal: goal.goal.clone(),
            expected: goal.expected,
            status: Verdict::Error,
            error: None,
            reason: String::new(),
            report: None,
            history: Vec::new(),
            counters: RunCounters::default(),
            subgoals: SubgoalProgress::default(),
            started_at,
            ended_at: started_at,
        }
    }

    pub fn matches_expectation(&self) -> bool {
        self.status.matches(self.expected)
    }

    pub fn steps(&self) -> usize {
        self.history.len()
    }

    pub fn failed_steps(&self) -> usize {
        self.history.iter().filter(|r| !r.success).count()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Append-only destination for run data.
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn record_action(&self, run_id: Uuid, record: &ActionRecord) -> anyhow::Result<()>;

    async fn record_assertion(&self, run_id: Uuid, assertion: &AssertionResult)
    -> anyhow::Result<()>;

    async fn record_run(&self, result: &RunResult) -> anyhow::Result<()>;
}
