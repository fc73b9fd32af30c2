//! Sequential execution of several goals against one memory store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::audit::RunResult;
use crate::goal::{TestGoal, Verdict};
use crate::memory::MemoryStore;
use crate::orchestrator::Orchestrator;

/// Aggregate counts for a suite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// Runs whose verdict equals the goal's expected outcome
    pub matched: usize,
}

impl SuiteSummary {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                Verdict::Pass => summary.passed += 1,
                Verdict::Fail => summary.failed += 1,
                Verdict::Error => summary.errors += 1,
            }
            if result.matches_expectation() {
                summary.matched += 1;
            }
        }
        summary
    }

    pub fn all_matched(&self) -> bool {
        self.matched == self.total
    }
}

impl std::fmt::Display for SuiteSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} runs: {} passed, {} failed, {} errors; {}/{} as expected",
            self.total, self.passed, self.failed, self.errors, self.matched, self.total
        )
    }
}

/// Load goals from a JSON array file.
pub fn load_goals(path: &Path) -> Result<Vec<TestGoal>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read goals file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse goals file: {}", path.display()))
}

pub struct SuiteRunner<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> SuiteRunner<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Run every goal in order. Memory is flushed after each run, so a later
    /// goal sees what earlier ones learned.
    pub async fn run_all(
        &self,
        goals: &[TestGoal],
        memory: &mut MemoryStore,
    ) -> Result<(Vec<RunResult>, SuiteSummary)> {
        let mut results = Vec::with_capacity(goals.len());
        for (i, goal) in goals.iter().enumerate() {
            tracing::info!(index = i + 1, total = goals.len(), goal_id = %goal.id, "Suite case");
            let result = self
                .orchestrator
                .run(goal, memory)
                .await
                .with_context(|| format!("Suite aborted at goal {}", goal.id))?;
            results.push(result);
        }

        let summary = SuiteSummary::from_results(&results);
        tracing::info!(%summary, "Suite finished");
        Ok((results, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn result(expected: TestGoal, status: Verdict) -> RunResult {
        let mut r = RunResult::new(Uuid::new_v4(), &expected, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            result(TestGoal::expect_pass("a", "g"), Verdict::Pass),
            result(TestGoal::expect_fail("b", "g"), Verdict::Fail),
            result(TestGoal::expect_pass("c", "g"), Verdict::Fail),
            result(TestGoal::expect_pass("d", "g"), Verdict::Error),
        ];
        let summary = SuiteSummary::from_results(&results);
        assert_eq!(
            summary,
            SuiteSummary {
                total: 4,
                passed: 1,
                failed: 2,
                errors: 1,
                matched: 2,
            }
        );
        assert!(!summary.all_matched());
        assert_eq!(summary.to_string(), "4 runs: 1 passed, 2 failed, 1 errors; 2/4 as expected");
    }

    #[test]
    fn test_load_goals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goals.json");
        std::fs::write(
            &path,
            r#"[{"id": "T1", "goal": "Create a vault", "expected": "PASS"},
                {"id": "T2", "goal": "Print to PDF", "expected": "FAIL"}]"#,
        )
        .unwrap();
        let goals = load_goals(&path).unwrap();
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[1], TestGoal::expect_fail("T2", "Print to PDF"));
    }
}
