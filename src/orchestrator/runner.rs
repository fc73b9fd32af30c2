use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use super::state::{RunState, StuckDetector};
use crate::action::Action;
use crate::audit::{ActionRecord, JsonRunLog, RunCounters, RunResult, RunSink};
use crate::config::{QaConfig, RunConfig};
use crate::device::{DeviceControl, ObservableState};
use crate::errors::{ErrorKind, RunError};
use crate::goal::{TestGoal, Verdict};
use crate::memory::{ContextKey, FAILURE_PENALTY, MemoryStore, SUCCESS_REWARD};
use crate::planner::Planner;
use crate::reasoning::{MeteredReasoning, ReasoningService};
use crate::resolver::ActionResolver;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::subgoal::{SubgoalRules, SubgoalTracker};
use crate::supervisor::Supervisor;

/// How the decide/execute/observe loop ended.
enum LoopEnd {
    /// The Planner returned assert_pass or assert_fail
    Directive(Action),
    Fatal { kind: ErrorKind, reason: String },
}

impl From<RunError> for LoopEnd {
    fn from(err: RunError) -> Self {
        LoopEnd::Fatal {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Drives one goal from the first observation to a verdict.
pub struct Orchestrator {
    device: Arc<dyn DeviceControl>,
    planner: Planner,
    resolver: ActionResolver,
    supervisor: Supervisor,
    meter: Arc<MeteredReasoning>,
    subgoals: SubgoalRules,
    sink: Option<Arc<dyn RunSink>>,
    run: RunConfig,
    device_retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        reasoning: Arc<dyn ReasoningService>,
        config: &QaConfig,
    ) -> Self {
        let meter = Arc::new(MeteredReasoning::new(reasoning));
        let reasoning: Arc<dyn ReasoningService> = meter.clone();
        let planner = Planner::new(
            reasoning.clone(),
            config.planner.clone(),
            config.retry.reasoning.clone(),
        );
        let resolver = ActionResolver::new(
            device.clone(),
            reasoning.clone(),
            config.resolver.clone(),
            config.retry.device.clone(),
            config.retry.reasoning.clone(),
        );
        let supervisor = Supervisor::new(reasoning, config.retry.reasoning.clone());

        Self {
            device,
            planner,
            resolver,
            supervisor,
            meter,
            subgoals: SubgoalRules::compile(&config.subgoals),
            sink: None,
            run: config.run.clone(),
            device_retry: config.retry.device.clone(),
        }
    }

    /// `new`, plus a `JsonRunLog` sink when `run.log_dir` is set.
    pub fn from_config(
        device: Arc<dyn DeviceControl>,
        reasoning: Arc<dyn ReasoningService>,
        config: &QaConfig,
    ) -> Result<Self> {
        let orchestrator = Self::new(device, reasoning, config);
        Ok(match JsonRunLog::from_config(&config.run)? {
            Some(log) => orchestrator.with_sink(Arc::new(log)),
            None => orchestrator,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run `goal` to completion, update `memory` with the outcome and flush it.
    ///
    /// Fatal run conditions are reported inside the `RunResult` (status ERROR);
    /// the returned error is reserved for failing to persist memory. Runs on
    /// one orchestrator are expected to be sequential: reasoning calls are
    /// attributed to whichever run is in flight.
    pub async fn run(&self, goal: &TestGoal, memory: &mut MemoryStore) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id, goal_id = %goal.id);
        self.run_inner(run_id, goal, memory).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        goal: &TestGoal,
        memory: &mut MemoryStore,
    ) -> Result<RunResult> {
        let mut result = RunResult::new(run_id, goal, Utc::now());
        let calls_before = self.meter.counts();
        let mut subgoals = self.subgoals.tracker(&goal.goal);
        let mut state = RunState::Init;
        tracing::info!(goal = %goal.goal, expected = ?goal.expected, "Run started");

        let (end, last_state, entry_context) = match self.capture().await {
            Ok(initial) => {
                let entry = ContextKey::new(initial.screen_id.as_str(), goal.goal.as_str());
                subgoals.observe(&initial, 0);
                let (end, last) = self
                    .drive(
                        run_id,
                        goal,
                        initial,
                        &mut state,
                        &mut result.history,
                        &mut subgoals,
                        memory,
                    )
                    .await;
                (end, Some(last), Some(entry))
            }
            Err(err) => (LoopEnd::from(err), None, None),
        };

        match end {
            LoopEnd::Directive(directive) => {
                let done = if matches!(directive, Action::AssertPass { .. }) {
                    RunState::DonePass
                } else {
                    RunState::DoneFail
                };
                advance(&mut state, done);

                // A directive is only produced after an observation.
                let Some(final_state) = last_state.as_ref() else {
                    anyhow::bail!("Run ended with a directive but no observed state");
                };
                match self
                    .supervisor
                    .verify(final_state, goal, &directive, &result.history)
                    .await
                {
                    Ok(report) => {
                        result.status = report.verdict;
                        result.reason = if report.reason.is_empty() {
                            directive.summary()
                        } else {
                            report.reason.clone()
                        };
                        for assertion in &report.assertions {
                            if let Some(sink) = &self.sink
                                && let Err(e) = sink.record_assertion(run_id, assertion).await
                            {
                                tracing::warn!(error = %e, "Failed to record assertion");
                            }
                        }
                        result.report = Some(report);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Supervisor failed");
                        result.status = Verdict::Error;
                        result.error = Some(err.kind());
                        result.reason = err.to_string();
                    }
                }
            }
            LoopEnd::Fatal { kind, reason } => {
                advance(&mut state, RunState::DoneError(kind));
                tracing::warn!(error = %kind, %reason, "Run ended with error");
                result.status = Verdict::Error;
                result.error = Some(kind);
                result.reason = reason;
            }
        }

        result.ended_at = Utc::now();
        result.counters = RunCounters::collect(&result.history, self.meter.counts().since(calls_before));
        result.subgoals = subgoals.into_progress();
        self.update_memory(&result, entry_context.as_ref(), memory);
        memory.flush().context("Failed to flush memory store after run")?;

        if let Some(sink) = &self.sink
            && let Err(e) = sink.record_run(&result).await
        {
            tracing::warn!(error = %e, "Failed to record run result");
        }

        tracing::info!(
            status = %result.status,
            steps = result.steps(),
            reasoning_calls = result.counters.reasoning_calls,
            recoveries = result.counters.recoveries,
            matched = result.matches_expectation(),
            "Run finished"
        );
        Ok(result)
    }

    /// The PLANNING -> EXECUTING -> OBSERVING loop. Returns how it ended and
    /// the last observed state.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: Uuid,
        goal: &TestGoal,
        initial: ObservableState,
        state: &mut RunState,
        history: &mut Vec<ActionRecord>,
        subgoals: &mut SubgoalTracker,
        memory: &MemoryStore,
    ) -> (LoopEnd, ObservableState) {
        let mut stuck = StuckDetector::new(self.run.stuck_threshold, initial.state_hash());
        let mut current = initial;

        loop {
            advance(state, RunState::Planning);
            let decision = match self
                .planner
                .next_action(&current, &goal.goal, history, memory)
                .await
            {
                Ok(decision) => decision,
                Err(err) => return (err.into(), current),
            };

            if decision.action.is_terminal() {
                tracing::info!(source = %decision.source, action = %decision.action.summary(), "Terminal directive");
                return (LoopEnd::Directive(decision.action), current);
            }

            let step = history.len() as u32 + 1;
            advance(state, RunState::Executing);
            let resolution = match self.resolver.execute(&decision.action, &current).await {
                Ok(resolution) => resolution,
                Err(err) => return (err.into(), current),
            };

            advance(state, RunState::Observing);
            let observed = match self.capture().await {
                Ok(observed) => observed,
                Err(err) => return (err.into(), current),
            };

            let record = ActionRecord {
                step,
                action: decision.action,
                source: decision.source,
                tier: resolution.tier,
                success: resolution.success,
                error: resolution.error,
                detail: resolution.detail,
                context: decision.context,
                state_hash: observed.state_hash(),
                timestamp: Utc::now(),
            };
            tracing::info!(
                step,
                source = %record.source,
                tier = ?record.tier,
                success = record.success,
                action = %record.action.summary(),
                "Step executed"
            );
            if let Some(sink) = &self.sink
                && let Err(e) = sink.record_action(run_id, &record).await
            {
                tracing::warn!(step, error = %e, "Failed to record action");
            }

            subgoals.observe(&observed, step);
            let hash = record.state_hash.clone();
            history.push(record);
            current = observed;

            if history.len() as u32 >= self.run.max_steps {
                return (
                    LoopEnd::Fatal {
                        kind: ErrorKind::MaxStepsReached,
                        reason: format!("Step budget of {} exhausted", self.run.max_steps),
                    },
                    current,
                );
            }

            if stuck.observe(&hash) {
                return (
                    LoopEnd::Fatal {
                        kind: ErrorKind::StuckLoop,
                        reason: format!(
                            "Screen unchanged for {} consecutive steps",
                            stuck.unchanged_steps()
                        ),
                    },
                    current,
                );
            }
        }
    }

    /// Fold the run outcome into the memory store.
    ///
    /// Failed steps are logged under the context they were planned in and
    /// penalised. A run whose verdict matches the expectation stores its
    /// successful actions as a pattern under the entry context; any other
    /// run is logged as a failure there.
    fn update_memory(
        &self,
        result: &RunResult,
        entry_context: Option<&ContextKey>,
        memory: &mut MemoryStore,
    ) {
        for record in result.history.iter().filter(|r| !r.success) {
            let reason = record
                .error
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "step failed".to_string());
            memory.record_failure(&record.context, std::slice::from_ref(&record.action), &reason);
            memory.update_reward(record.action.kind(), FAILURE_PENALTY);
        }

        let Some(entry) = entry_context else {
            return;
        };
        let succeeded: Vec<Action> = result
            .history
            .iter()
            .filter(|r| r.success)
            .map(|r| r.action.clone())
            .collect();

        if result.matches_expectation() {
            memory.record_success(entry, &succeeded, result.status);
            if result.status == Verdict::Pass {
                for action in &succeeded {
                    memory.update_reward(action.kind(), SUCCESS_REWARD);
                }
            }
        } else {
            let reason = match result.error {
                Some(kind) => kind.to_string(),
                None => format!("verdict {} but expected {:?}", result.status, result.expected),
            };
            let attempted: Vec<Action> = result.history.iter().map(|r| r.action.clone()).collect();
            memory.record_failure(entry, &attempted, &reason);
        }
    }

    async fn capture(&self) -> Result<ObservableState, RunError> {
        retry_with_backoff(&self.device_retry, "capture_state", || self.device.capture_state())
            .await
            .map_err(|source| RunError::Device {
                operation: "capture_state",
                source,
            })
    }
}

fn advance(state: &mut RunState, next: RunState) {
    if !state.can_transition_to(next) {
        tracing::warn!(from = %state, to = %next, "Unexpected state transition");
    }
    tracing::debug!(from = %state, to = %next, "State transition");
    *state = next;
}
