//! Memory behaviour across runs: learning, replay, eviction and persistence.

mod common;

use common::*;
use qa_pilot::memory::DEFAULT_MAX_PATTERNS;
use qa_pilot::{
    Action, ActionKind, ContextKey, DecisionSource, MemoryStore, Orchestrator, SuiteRunner,
    Target, TestGoal, Verdict,
};
use std::sync::Arc;

#[tokio::test]
async fn test_second_run_replays_what_the_first_learned() {
    let device = Arc::new(notes_app());
    let reasoning = Arc::new(ScriptedReasoning::passing(&CREATE_NOTE_DECISIONS));
    let orchestrator = Orchestrator::new(device.clone(), reasoning.clone(), &test_config(10));

    let dir = tempfile::tempdir().unwrap();
    let mut memory = MemoryStore::load(&dir.path().join("memory.json")).unwrap();
    let goal = TestGoal::expect_pass("T1", CREATE_NOTE_GOAL);

    let first = orchestrator.run(&goal, &mut memory).await.unwrap();
    assert_eq!(first.status, Verdict::Pass);
    assert_eq!(reasoning.decide_calls(), 4);

    // Back to the list screen for the second attempt.
    let device = Arc::new(notes_app());
    let orchestrator = Orchestrator::new(device.clone(), reasoning.clone(), &test_config(10));
    let second = orchestrator.run(&goal, &mut memory).await.unwrap();

    assert_eq!(second.status, Verdict::Pass);
    assert_eq!(second.steps(), 3);
    assert!(second.history.iter().all(|r| r.source == DecisionSource::Memory));
    assert_eq!(reasoning.decide_calls(), 4, "replay must not consult the planner model");
    assert_eq!(reasoning.verify_calls(), 2);

    let pattern = memory
        .get_pattern(&ContextKey::new("NotesList", CREATE_NOTE_GOAL))
        .unwrap();
    assert_eq!(pattern.use_count, 2);
}

#[tokio::test]
async fn test_suite_accumulates_rewards() {
    let reasoning = Arc::new(ScriptedReasoning::passing(&CREATE_NOTE_DECISIONS));
    let orchestrator = Orchestrator::new(Arc::new(notes_app()), reasoning.clone(), &test_config(10));
    let mut memory = MemoryStore::in_memory();

    let goals = vec![TestGoal::expect_pass("T1", CREATE_NOTE_GOAL)];
    let (results, summary) = SuiteRunner::new(&orchestrator)
        .run_all(&goals, &mut memory)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(summary.all_matched());
    assert_eq!(summary.passed, 1);

    // Two taps and one type, each rewarded once per successful step.
    assert!((memory.reward(ActionKind::Tap) - 0.038).abs() < 1e-9);
    assert!((memory.reward(ActionKind::Type) - 0.02).abs() < 1e-9);
    assert_eq!(memory.reward(ActionKind::Swipe), 0.0);
}

#[tokio::test]
async fn test_suite_reports_mismatches() {
    let reasoning = Arc::new(ScriptedReasoning::failing(&[
        r#"{"action": "assert_fail", "reason": "no export menu"}"#,
        r#"{"action": "assert_fail", "reason": "no export menu"}"#,
    ]));
    let orchestrator = Orchestrator::new(Arc::new(notes_app()), reasoning.clone(), &test_config(10));
    let mut memory = MemoryStore::in_memory();

    let goals = vec![
        TestGoal::expect_fail("T2", "export note as pdf"),
        TestGoal::expect_pass("T3", "export note as pdf"),
    ];
    let (results, summary) = SuiteRunner::new(&orchestrator)
        .run_all(&goals, &mut memory)
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.status == Verdict::Fail));
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.matched, 1);
    assert!(!summary.all_matched());
}

#[test]
fn test_pattern_cap_evicts_least_used() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.json");
    let context = ContextKey::new("Settings", "enable dark mode");
    let tap = |label: &str| vec![Action::tap(Target::text(label))];

    {
        let mut memory = MemoryStore::load(&path).unwrap();
        for i in 0..DEFAULT_MAX_PATTERNS {
            let actions = tap(&format!("Option {}", i));
            memory.record_success(&context, &actions, Verdict::Pass);
            // Option 0 is the only pattern left with use_count 1.
            if i > 0 {
                memory.record_success(&context, &actions, Verdict::Pass);
            }
        }
        memory.record_success(&context, &tap("Theme"), Verdict::Pass);
        memory.flush().unwrap();
    }

    let memory = MemoryStore::load(&path).unwrap();
    let patterns = memory.patterns_for(&context);
    assert_eq!(patterns.len(), DEFAULT_MAX_PATTERNS);
    assert!(!patterns.iter().any(|p| p.actions == tap("Option 0")));
    assert!(patterns.iter().any(|p| p.actions == tap("Theme")));
    assert_eq!(memory.get_pattern(&context).unwrap().use_count, 2);
}
