//! Final verdict on a finished run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::action::Action;
use crate::audit::ActionRecord;
use crate::device::ObservableState;
use crate::errors::RunError;
use crate::goal::{TestGoal, Verdict};
use crate::reasoning::{ReasoningService, ScreenSummary, VerifyRequest};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::util::{extract_json_object, truncate_chars};

/// One check the Supervisor made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

/// Parsed Supervisor answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
}

impl SupervisorReport {
    /// Parse the reasoning answer. Only PASS and FAIL verdicts are accepted;
    /// anything else is returned as the reason it was rejected.
    pub fn parse(output: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(alias = "status", alias = "result")]
            verdict: String,
            #[serde(default)]
            reason: String,
            #[serde(default)]
            details: String,
            #[serde(default)]
            assertions: Vec<AssertionResult>,
        }

        let raw = extract_json_object(output)
            .and_then(|json| serde_json::from_str::<Raw>(&json).ok())
            .ok_or_else(|| format!("unparseable answer: {}", truncate_chars(output.trim(), 200)))?;

        let verdict = match raw.verdict.trim().to_uppercase().as_str() {
            "PASS" | "PASSED" => Verdict::Pass,
            "FAIL" | "FAILED" => Verdict::Fail,
            other => return Err(format!("unknown verdict '{}'", other)),
        };

        Ok(Self {
            verdict,
            reason: raw.reason,
            details: raw.details,
            assertions: raw.assertions,
        })
    }
}

pub struct Supervisor {
    reasoning: Arc<dyn ReasoningService>,
    retry: RetryPolicy,
}

impl Supervisor {
    pub fn new(reasoning: Arc<dyn ReasoningService>, retry: RetryPolicy) -> Self {
        Self { reasoning, retry }
    }

    /// Judge the final state. Makes one `verify` call unless that call fails
    /// transiently, in which case the shared retry policy applies.
    pub async fn verify(
        &self,
        state: &ObservableState,
        goal: &TestGoal,
        claim: &Action,
        history: &[ActionRecord],
    ) -> Result<SupervisorReport, RunError> {
        let request = VerifyRequest {
            goal: goal.goal.clone(),
            expected: goal.expected,
            screen: ScreenSummary::from_state(state),
            screenshot: state.screenshot.clone(),
            claim: claim.summary(),
            steps: history
                .iter()
                .map(|r| format!("{} -> {}", r.action.summary(), r.outcome_label()))
                .collect(),
        };

        let output = retry_with_backoff(&self.retry, "verify", || self.reasoning.verify(&request))
            .await
            .map_err(|source| RunError::Reasoning {
                operation: "verify",
                source,
            })?;

        let report = SupervisorReport::parse(&output).map_err(|reason| {
            tracing::warn!(goal_id = %goal.id, %reason, "Supervisor answer rejected");
            RunError::SupervisorInvalidOutput { reason }
        })?;
        tracing::info!(
            goal_id = %goal.id,
            verdict = %report.verdict,
            assertions = report.assertions.len(),
            "Supervisor verdict"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ReasoningError};
    use crate::reasoning::DecisionContext;
    use async_trait::async_trait;

    #[test]
    fn test_parse_full_report() {
        let report = SupervisorReport::parse(
            r#"Looks good.
            {"verdict": "PASS", "reason": "Note is listed",
             "assertions": [{"expected": "note titled X", "observed": "X in list", "passed": true}]}"#,
        )
        .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.reason, "Note is listed");
        assert_eq!(report.assertions.len(), 1);
        assert!(report.assertions[0].passed);
    }

    #[test]
    fn test_parse_accepts_status_alias_and_case() {
        let report = SupervisorReport::parse(r#"{"status": "failed", "reason": "no PDF"}"#).unwrap();
        assert_eq!(report.verdict, Verdict::Fail);
    }

    #[test]
    fn test_parse_rejects_output_outside_the_verdict_schema() {
        let err = SupervisorReport::parse("I am not sure what happened").unwrap_err();
        assert!(err.contains("unparseable"));

        let err = SupervisorReport::parse(r#"{"verdict": "MAYBE"}"#).unwrap_err();
        assert!(err.contains("MAYBE"));

        assert!(SupervisorReport::parse(r#"{"verdict": "ERROR"}"#).is_err());
    }

    struct Answering(&'static str);

    #[async_trait]
    impl ReasoningService for Answering {
        async fn describe(&self, _: &crate::device::Screenshot, _: &str) -> Result<String, ReasoningError> {
            Ok("NOT_FOUND".into())
        }

        async fn decide(&self, _: &DecisionContext) -> Result<String, ReasoningError> {
            Err(ReasoningError::Rejected("not used".into()))
        }

        async fn verify(&self, _: &VerifyRequest) -> Result<String, ReasoningError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_invalid_answer_is_supervisor_error() {
        let supervisor = Supervisor::new(Arc::new(Answering("no idea")), RetryPolicy::immediate(1));
        let state = ObservableState::new("NoteView", "", None);
        let goal = TestGoal::expect_pass("T1", "create note titled X");

        let err = supervisor
            .verify(&state, &goal, &Action::AssertPass { reason: String::new() }, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SupervisorInvalidOutput);
    }
}
