//! Next-action selection: memory replay first, reasoning otherwise.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::action::{Action, parse_action};
use crate::audit::ActionRecord;
use crate::config::PlannerConfig;
use crate::device::ObservableState;
use crate::errors::{ActionParseError, RunError};
use crate::memory::{ContextKey, MemoryStore};
use crate::reasoning::{DecisionContext, ReasoningService};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Where a planned action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionSource {
    Memory,
    Reasoning,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionSource::Memory => write!(f, "MEMORY"),
            DecisionSource::Reasoning => write!(f, "REASONING"),
        }
    }
}

/// The Planner's answer for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub source: DecisionSource,
    /// Context the action belongs to. For replays this is the pattern's key.
    pub context: ContextKey,
}

pub struct Planner {
    reasoning: Arc<dyn ReasoningService>,
    config: PlannerConfig,
    retry: RetryPolicy,
}

impl Planner {
    pub fn new(reasoning: Arc<dyn ReasoningService>, config: PlannerConfig, retry: RetryPolicy) -> Self {
        Self {
            reasoning,
            config,
            retry,
        }
    }

    /// Choose exactly one action (or terminal directive) for the current state.
    pub async fn next_action(
        &self,
        state: &ObservableState,
        goal: &str,
        history: &[ActionRecord],
        memory: &MemoryStore,
    ) -> Result<Decision, RunError> {
        let current = ContextKey::new(state.screen_id.as_str(), goal);

        if let Some(decision) = self.replay(&current, history, memory) {
            tracing::debug!(
                context = %decision.context,
                step = history.len(),
                action = %decision.action.summary(),
                "Replaying from memory"
            );
            return Ok(decision);
        }

        self.ask_reasoning(current, state, goal, history, memory).await
    }

    /// Serve the next remembered action, if a replay applies.
    ///
    /// A replay continues under the key of the previous step while that step
    /// came from memory and succeeded, even across screen changes. A pattern
    /// served to the end concludes with its recorded outcome. Once a replayed
    /// step under a key has failed, that key is not replayed again this run.
    fn replay(
        &self,
        current: &ContextKey,
        history: &[ActionRecord],
        memory: &MemoryStore,
    ) -> Option<Decision> {
        let continuing = history
            .last()
            .filter(|last| last.source == DecisionSource::Memory && last.success);
        let key = continuing.map(|last| &last.context).unwrap_or(current);

        if history
            .iter()
            .any(|r| r.source == DecisionSource::Memory && !r.success && r.context == *key)
        {
            return None;
        }

        let pattern = memory.get_pattern(key)?;
        let position = history.len();

        if position < pattern.len() {
            return Some(Decision {
                action: pattern.actions[position].clone(),
                source: DecisionSource::Memory,
                context: key.clone(),
            });
        }

        if continuing.is_some() {
            return pattern.terminal_action().map(|action| Decision {
                action,
                source: DecisionSource::Memory,
                context: key.clone(),
            });
        }

        None
    }

    async fn ask_reasoning(
        &self,
        current: ContextKey,
        state: &ObservableState,
        goal: &str,
        history: &[ActionRecord],
        memory: &MemoryStore,
    ) -> Result<Decision, RunError> {
        let mut context = DecisionContext::new(goal, state, history);
        context.rewards = memory.rewards().iter().collect();
        context.avoid = memory.avoided_actions(&current);
        context.examples = memory
            .example_sequences(goal, self.config.example_limit)
            .into_iter()
            .filter(|p| p.context != current)
            .map(|p| p.actions.clone())
            .collect();

        let attempts = self.config.invalid_output_attempts.max(1);
        let mut last_error = ActionParseError::NoJson;

        for attempt in 1..=attempts {
            let output = retry_with_backoff(&self.retry, "decide", || self.reasoning.decide(&context))
                .await
                .map_err(|source| RunError::Reasoning {
                    operation: "decide",
                    source,
                })?;

            match parse_action(&output) {
                Ok(action) => {
                    if let Some(reason) = memory.should_avoid_action(&current, &action) {
                        // Advisory only: the flag is in the prompt, the choice stands.
                        tracing::info!(
                            action = %action.summary(),
                            reason = %reason,
                            "Reasoning chose an action flagged avoid"
                        );
                    }
                    return Ok(Decision {
                        action,
                        source: DecisionSource::Reasoning,
                        context: current,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Reasoning output failed validation"
                    );
                    context.correction = Some(err.to_string());
                    last_error = err;
                    if attempt < attempts {
                        let delay = self.retry.delay_for(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(RunError::PlannerInvalidOutput {
            attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Target;
    use crate::errors::{ErrorKind, ReasoningError};
    use crate::goal::Verdict;
    use crate::reasoning::VerifyRequest;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const GOAL: &str = "create note titled X";

    /// Returns scripted `decide` answers in order; the last one repeats.
    struct Scripted {
        answers: Vec<Result<String, ReasoningError>>,
        calls: AtomicU32,
        prompts: Mutex<Vec<DecisionContext>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<String, ReasoningError>>) -> Arc<Self> {
            Arc::new(Self {
                answers,
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReasoningService for Scripted {
        async fn describe(
            &self,
            _: &crate::device::Screenshot,
            _: &str,
        ) -> Result<String, ReasoningError> {
            Ok("NOT_FOUND".into())
        }

        async fn decide(&self, context: &DecisionContext) -> Result<String, ReasoningError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.prompts.lock().unwrap().push(context.clone());
            self.answers[i.min(self.answers.len() - 1)].clone()
        }

        async fn verify(&self, _: &VerifyRequest) -> Result<String, ReasoningError> {
            Ok(r#"{"verdict": "PASS"}"#.into())
        }
    }

    fn planner(reasoning: Arc<Scripted>) -> Planner {
        Planner::new(reasoning, PlannerConfig::default(), RetryPolicy::immediate(3))
    }

    fn state(screen: &str) -> ObservableState {
        ObservableState::new(screen, "", None)
    }

    fn record(step: u32, action: Action, source: DecisionSource, context: ContextKey, success: bool) -> ActionRecord {
        ActionRecord {
            step,
            action,
            source,
            tier: None,
            success,
            error: (!success).then_some(ErrorKind::ElementNotFound),
            detail: String::new(),
            context,
            state_hash: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn three_steps() -> Vec<Action> {
        vec![
            Action::tap(Target::text("New note")),
            Action::type_text("X", None),
            Action::key(66),
        ]
    }

    // =========================================
    // Replay
    // =========================================

    #[tokio::test]
    async fn test_replays_pattern_without_reasoning() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "key", "code": 4}"#.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        let key = ContextKey::new("NotesList", GOAL);
        memory.record_success(&key, &three_steps(), Verdict::Pass);

        let mut history = Vec::new();
        let screens = ["NotesList", "Editor", "Editor"];
        for (i, screen) in screens.iter().enumerate() {
            let decision = planner
                .next_action(&state(screen), GOAL, &history, &memory)
                .await
                .unwrap();
            assert_eq!(decision.source, DecisionSource::Memory);
            assert_eq!(decision.action, three_steps()[i]);
            assert_eq!(decision.context, key);
            history.push(record(i as u32 + 1, decision.action, decision.source, decision.context, true));
        }

        let done = planner
            .next_action(&state("Editor"), GOAL, &history, &memory)
            .await
            .unwrap();
        assert!(matches!(done.action, Action::AssertPass { .. }));
        assert_eq!(done.source, DecisionSource::Memory);
        assert_eq!(reasoning.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_replay_step_falls_back_to_reasoning() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "key", "code": 4}"#.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        let key = ContextKey::new("NotesList", GOAL);
        memory.record_success(&key, &three_steps(), Verdict::Pass);

        let history = vec![record(1, three_steps()[0].clone(), DecisionSource::Memory, key, false)];
        let decision = planner
            .next_action(&state("Editor"), GOAL, &history, &memory)
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Reasoning);
        assert_eq!(decision.action, Action::key(4));
        assert_eq!(reasoning.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_replay_on_unchanged_screen_stops_replay() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "key", "code": 4}"#.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        let key = ContextKey::new("NotesList", GOAL);
        memory.record_success(&key, &three_steps(), Verdict::Pass);

        // The failed tap left the device on the same screen.
        let mut history = vec![record(1, three_steps()[0].clone(), DecisionSource::Memory, key.clone(), false)];
        let decision = planner
            .next_action(&state("NotesList"), GOAL, &history, &memory)
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Reasoning);
        assert_eq!(decision.action, Action::key(4));

        // A later successful reasoning step does not re-enable the pattern.
        history.push(record(2, decision.action, decision.source, decision.context, true));
        let decision = planner
            .next_action(&state("NotesList"), GOAL, &history, &memory)
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Reasoning);
        assert_eq!(reasoning.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_fuzzy_context_match() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "key", "code": 4}"#.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        memory.record_success(&ContextKey::new("NotesList", "create note titled Y"), &three_steps(), Verdict::Pass);

        let decision = planner
            .next_action(&state("NotesList"), GOAL, &[], &memory)
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Reasoning);
    }

    // =========================================
    // Reasoning path
    // =========================================

    #[tokio::test]
    async fn test_invalid_output_retried_with_correction() {
        let reasoning = Scripted::new(vec![
            Ok("tap the button".into()),
            Ok(r#"{"action": "tap", "text": "New note"}"#.into()),
        ]);
        let planner = planner(reasoning.clone());
        let decision = planner
            .next_action(&state("NotesList"), GOAL, &[], &MemoryStore::in_memory())
            .await
            .unwrap();
        assert_eq!(decision.action, Action::tap(Target::text("New note")));
        assert_eq!(reasoning.calls(), 2);

        let prompts = reasoning.prompts.lock().unwrap();
        assert!(prompts[0].correction.is_none());
        assert!(prompts[1].correction.as_deref().unwrap().contains("No JSON"));
    }

    #[tokio::test]
    async fn test_invalid_output_exhausts_into_planner_error() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "fly"}"#.into())]);
        let planner = planner(reasoning.clone());
        let err = planner
            .next_action(&state("NotesList"), GOAL, &[], &MemoryStore::in_memory())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlannerInvalidOutput);
        assert_eq!(reasoning.calls(), PlannerConfig::default().invalid_output_attempts);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_is_fatal() {
        let reasoning = Scripted::new(vec![Err(ReasoningError::RateLimited { retry_after: None })]);
        let planner = planner(reasoning.clone());
        let err = planner
            .next_action(&state("NotesList"), GOAL, &[], &MemoryStore::in_memory())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(reasoning.calls(), 3);
    }

    #[tokio::test]
    async fn test_avoid_flag_and_rewards_are_advisory() {
        let bad = r#"{"action": "tap", "text": "Export"}"#;
        let reasoning = Scripted::new(vec![Ok(bad.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        let key = ContextKey::new("Editor", GOAL);
        let export = Action::tap(Target::text("Export"));
        for _ in 0..3 {
            memory.record_failure(&key, std::slice::from_ref(&export), "ELEMENT_NOT_FOUND");
        }
        memory.update_reward(crate::action::ActionKind::Tap, -0.5);

        let decision = planner
            .next_action(&state("Editor"), GOAL, &[], &memory)
            .await
            .unwrap();
        assert_eq!(decision.action, export);

        let prompts = reasoning.prompts.lock().unwrap();
        assert_eq!(prompts[0].avoid.len(), 1);
        assert_eq!(prompts[0].rewards.len(), 1);
    }

    #[tokio::test]
    async fn test_examples_come_from_other_screens() {
        let reasoning = Scripted::new(vec![Ok(r#"{"action": "key", "code": 4}"#.into())]);
        let planner = planner(reasoning.clone());
        let mut memory = MemoryStore::in_memory();
        memory.record_success(&ContextKey::new("Settings", GOAL), &three_steps(), Verdict::Pass);

        planner
            .next_action(&state("NotesList"), GOAL, &[], &memory)
            .await
            .unwrap();
        let prompts = reasoning.prompts.lock().unwrap();
        assert_eq!(prompts[0].examples, vec![three_steps()]);
    }
}
