//! Re-execute a recorded run on the device, step by step.
//!
//! Replay reads a saved [`RunResult`] (see [`crate::JsonRunLog::load_run`])
//! and drives each recorded action through the [`ActionResolver`] again,
//! without the planner or supervisor. It is a debugging aid: the report shows
//! where today's device behaves differently from the recording.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::action::Action;
use crate::audit::RunResult;
use crate::config::QaConfig;
use crate::device::{DeviceControl, ObservableState};
use crate::errors::{ErrorKind, RunError};
use crate::reasoning::ReasoningService;
use crate::resolver::{ActionResolver, ResolutionTier};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Outcome of one re-executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub step: u32,
    pub action: Action,
    /// Whether the step succeeded when it was recorded
    pub recorded_success: bool,
    pub success: bool,
    pub tier: Option<ResolutionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ReplayStep {
    /// The step behaved differently this time.
    pub fn diverged(&self) -> bool {
        self.success != self.recorded_success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Run the actions were taken from
    pub source_run: Uuid,
    pub goal_id: String,
    /// Steps in the recording
    pub planned: usize,
    pub steps: Vec<ReplayStep>,
    /// Set when a fatal device or reasoning error stopped the replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl ReplayReport {
    /// Every recorded step was re-executed.
    pub fn completed(&self) -> bool {
        self.error.is_none() && self.steps.len() == self.planned
    }

    pub fn divergences(&self) -> usize {
        self.steps.iter().filter(|s| s.diverged()).count()
    }
}

pub struct EpisodeReplayer {
    device: Arc<dyn DeviceControl>,
    resolver: ActionResolver,
    device_retry: RetryPolicy,
    delay: Duration,
}

impl EpisodeReplayer {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        reasoning: Arc<dyn ReasoningService>,
        config: &QaConfig,
    ) -> Self {
        let resolver = ActionResolver::new(
            device.clone(),
            reasoning,
            config.resolver.clone(),
            config.retry.device.clone(),
            config.retry.reasoning.clone(),
        );
        Self {
            device,
            resolver,
            device_retry: config.retry.device.clone(),
            delay: Duration::ZERO,
        }
    }

    /// Pause between steps so the screen can settle or be watched.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Re-execute the recorded actions of `run` in order.
    ///
    /// Step failures are reported and the replay moves on; a fatal error
    /// stops it and is recorded in the report.
    pub async fn replay(&self, run: &RunResult) -> ReplayReport {
        let mut report = ReplayReport {
            source_run: run.run_id,
            goal_id: run.goal_id.clone(),
            planned: run.history.len(),
            steps: Vec::with_capacity(run.history.len()),
            error: None,
            reason: String::new(),
        };
        tracing::info!(run_id = %run.run_id, steps = report.planned, "Replaying run");

        for (i, record) in run.history.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let outcome = match self.capture().await {
                Ok(state) => self.resolver.execute(&record.action, &state).await,
                Err(err) => Err(err),
            };
            let resolution = match outcome {
                Ok(resolution) => resolution,
                Err(err) => {
                    tracing::warn!(step = record.step, error = %err, "Replay stopped");
                    report.error = Some(err.kind());
                    report.reason = err.to_string();
                    break;
                }
            };

            let step = ReplayStep {
                step: record.step,
                action: record.action.clone(),
                recorded_success: record.success,
                success: resolution.success,
                tier: resolution.tier,
                error: resolution.error,
                detail: resolution.detail,
            };
            if step.diverged() {
                tracing::warn!(
                    step = step.step,
                    action = %step.action.summary(),
                    recorded = record.success,
                    now = step.success,
                    "Replay diverged from recording"
                );
            } else {
                tracing::debug!(step = step.step, action = %step.action.summary(), "Replayed step");
            }
            report.steps.push(step);
        }

        tracing::info!(
            replayed = report.steps.len(),
            divergences = report.divergences(),
            completed = report.completed(),
            "Replay finished"
        );
        report
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
