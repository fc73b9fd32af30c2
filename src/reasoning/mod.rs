//! Reasoning/vision collaborator boundary.
//!
//! [`ReasoningService`] is the only way the loop consults a model. The
//! request types render their own prompts so any backend (hosted model, local
//! model, scripted fake) can stay a thin transport.

mod metered;

pub use metered::{CallCounts, MeteredReasoning};

use async_trait::async_trait;
use std::fmt::Write as _;

use crate::action::{Action, ActionKind};
use crate::audit::ActionRecord;
use crate::device::{ObservableState, Screenshot};
use crate::errors::ReasoningError;
use crate::goal::ExpectedOutcome;
use crate::util::truncate_chars;

/// Visible texts included in a prompt.
pub const PROMPT_VISIBLE_TEXTS: usize = 20;

/// History entries included in a decision prompt.
pub const PROMPT_HISTORY_STEPS: usize = 10;

const ACTION_SCHEMA: &str = r#"Respond with exactly one JSON object, one of:
{"action": "tap", "text": "<label>", "id": "<resource id>", "x": 0, "y": 0, "description": "..."}
{"action": "type", "text": "<text to enter>", "target": {"text": "<field label>"}}
{"action": "key", "code": 66}
{"action": "swipe", "x1": 500, "y1": 1500, "x2": 500, "y2": 400, "duration_ms": 300}
{"action": "open_app", "app": "<package>"}
{"action": "wait", "seconds": 2}
{"action": "assert_pass", "reason": "<why the goal is achieved>"}
{"action": "assert_fail", "reason": "<why the goal cannot be achieved>"}
Use x/y only when you can see the element; 0 means unknown."#;

const VERDICT_SCHEMA: &str = r#"Respond with exactly one JSON object:
{"verdict": "PASS" | "FAIL", "reason": "...", "details": "...",
 "assertions": [{"expected": "...", "observed": "...", "passed": true}]}"#;

/// The screen as the reasoning service sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenSummary {
    pub screen_id: String,
    pub has_editable: bool,
    pub visible_texts: Vec<String>,
}

impl ScreenSummary {
    pub fn from_state(state: &ObservableState) -> Self {
        Self {
            screen_id: state.screen_id.clone(),
            has_editable: state.snapshot.has_editable(),
            visible_texts: state
                .snapshot
                .visible_texts(PROMPT_VISIBLE_TEXTS)
                .into_iter()
                .map(|t| truncate_chars(t, 80))
                .collect(),
        }
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "Screen: {}", self.screen_id);
        let _ = writeln!(
            out,
            "Editable field present: {}",
            if self.has_editable { "yes" } else { "no" }
        );
        if self.visible_texts.is_empty() {
            let _ = writeln!(out, "Visible text: (none)");
        } else {
            let _ = writeln!(out, "Visible text: {}", self.visible_texts.join(" | "));
        }
    }
}

/// Everything the planner tells the reasoning service for one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub goal: String,
    pub screen: ScreenSummary,
    pub screenshot: Option<Screenshot>,
    /// `(step, action summary, outcome)` for the most recent steps
    pub history: Vec<(u32, String, String)>,
    /// Advisory scores; never used to filter choices
    pub rewards: Vec<(ActionKind, f64)>,
    /// Actions that repeatedly failed here, with the last reason
    pub avoid: Vec<(Action, String)>,
    /// Sequences that passed this goal from other screens
    pub examples: Vec<Vec<Action>>,
    /// Why the previous answer was rejected, when retrying
    pub correction: Option<String>,
}

impl DecisionContext {
    pub fn new(goal: &str, state: &ObservableState, history: &[ActionRecord]) -> Self {
        let skip = history.len().saturating_sub(PROMPT_HISTORY_STEPS);
        Self {
            goal: goal.to_string(),
            screen: ScreenSummary::from_state(state),
            screenshot: state.screenshot.clone(),
            history: history
                .iter()
                .skip(skip)
                .map(|r| (r.step, r.action.summary(), r.outcome_label()))
                .collect(),
            rewards: Vec::new(),
            avoid: Vec::new(),
            examples: Vec::new(),
            correction: None,
        }
    }

    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "You are testing a mobile app one action at a time.");
        let _ = writeln!(out, "\nGoal: {}\n", self.goal);
        self.screen.render(&mut out);

        let _ = writeln!(out, "\nHistory:");
        if self.history.is_empty() {
            let _ = writeln!(out, "(no actions yet)");
        }
        for (step, summary, outcome) in &self.history {
            let _ = writeln!(out, "{}. {} -> {}", step, summary, outcome);
        }

        if !self.rewards.is_empty() {
            let _ = writeln!(out, "\nAction scores from past runs (advisory):");
            for (kind, score) in &self.rewards {
                let _ = writeln!(out, "- {}: {:+.3}", kind, score);
            }
        }

        if !self.avoid.is_empty() {
            let _ = writeln!(out, "\nThese actions keep failing on this screen:");
            for (action, reason) in &self.avoid {
                let _ = writeln!(out, "- {} ({})", action.summary(), reason);
            }
        }

        if !self.examples.is_empty() {
            let _ = writeln!(out, "\nSequences that achieved this goal before:");
            for (i, example) in self.examples.iter().enumerate() {
                let steps: Vec<String> = example.iter().map(Action::summary).collect();
                let _ = writeln!(out, "{}) {}", i + 1, steps.join(" ; "));
            }
        }

        if let Some(correction) = &self.correction {
            let _ = writeln!(out, "\nYour previous answer was rejected: {}", correction);
        }

        let _ = writeln!(out, "\n{}", ACTION_SCHEMA);
        out
    }
}

/// What the Supervisor asks the reasoning service to judge.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyRequest {
    pub goal: String,
    pub expected: ExpectedOutcome,
    pub screen: ScreenSummary,
    pub screenshot: Option<Screenshot>,
    /// Directive that ended the loop (`assert_pass: ...`)
    pub claim: String,
    pub steps: Vec<String>,
}

impl VerifyRequest {
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "You are verifying the end state of a mobile UI test.");
        let _ = writeln!(out, "\nGoal: {}", self.goal);
        let _ = writeln!(
            out,
            "Test author expects: {}",
            match self.expected {
                ExpectedOutcome::Pass => "the goal can be achieved (PASS)",
                ExpectedOutcome::Fail => "the goal cannot be achieved (FAIL)",
            }
        );
        let _ = writeln!(out, "Agent concluded: {}\n", self.claim);
        self.screen.render(&mut out);

        if !self.steps.is_empty() {
            let _ = writeln!(out, "\nSteps taken:");
            for step in &self.steps {
                let _ = writeln!(out, "- {}", step);
            }
        }

        let _ = writeln!(
            out,
            "\nJudge whether the goal was achieved on the final screen, list each check you made, then answer."
        );
        let _ = writeln!(out, "\n{}", VERDICT_SCHEMA);
        out
    }
}

/// The model-backed collaborator.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Answer a free-form question about a screenshot (used to locate elements).
    async fn describe(&self, screenshot: &Screenshot, query: &str) -> Result<String, ReasoningError>;

    /// Propose the next action. The answer must contain one action object.
    async fn decide(&self, context: &DecisionContext) -> Result<String, ReasoningError>;

    /// Judge the final state. The answer must contain one verdict object.
    async fn verify(&self, request: &VerifyRequest) -> Result<String, ReasoningError>;
}
