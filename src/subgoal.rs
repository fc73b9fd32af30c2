//! Subgoal detection and progress tracking.
//!
//! Rules come from `[[subgoals]]` tables in `qa.toml`:
//!
//! ```toml
//! [[subgoals]]
//! name = "open_settings"
//! description = "Open Settings"
//! triggers = ["open.*settings", "navigate.*settings"]
//! screen = "Settings"
//!
//! [[subgoals]]
//! name = "type_title"
//! triggers = ["note.*titled"]
//! text = "Meeting Notes"
//! ```
//!
//! A rule applies to a goal when any trigger regex matches the goal text
//! (case-insensitive). It is achieved the first time an observed state shows
//! the configured screen and contains the configured text.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::device::ObservableState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgoalRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Regexes matched against the goal text
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Screen id that marks the subgoal achieved (case-insensitive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    /// Visible text that marks the subgoal achieved (case-insensitive substring)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl SubgoalRule {
    fn compile_triggers(&self) -> Result<Vec<Regex>, regex::Error> {
        self.triggers
            .iter()
            .map(|t| RegexBuilder::new(t).case_insensitive(true).build())
            .collect()
    }

    /// Problems that make the rule useless. Empty when the rule is sound.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("subgoal rule has an empty name".to_string());
        }
        if self.triggers.is_empty() {
            problems.push(format!("subgoal '{}' has no triggers and never applies", self.name));
        }
        if self.screen.is_none() && self.text.is_none() {
            problems.push(format!(
                "subgoal '{}' has neither screen nor text and is never achieved",
                self.name
            ));
        }
        if let Err(e) = self.compile_triggers() {
            problems.push(format!("subgoal '{}' has an invalid trigger: {}", self.name, e));
        }
        problems
    }

    fn is_met(&self, state: &ObservableState) -> bool {
        if self.screen.is_none() && self.text.is_none() {
            return false;
        }
        let screen_ok = self
            .screen
            .as_deref()
            .is_none_or(|screen| state.screen_id.eq_ignore_ascii_case(screen));
        let text_ok = self.text.as_deref().is_none_or(|text| {
            let needle = text.to_lowercase();
            state
                .snapshot
                .elements
                .iter()
                .any(|e| e.label().to_lowercase().contains(&needle))
        });
        screen_ok && text_ok
    }
}

/// Rules with their triggers compiled. Rules whose triggers do not compile
/// are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct SubgoalRules {
    rules: Vec<(SubgoalRule, Vec<Regex>)>,
}

impl SubgoalRules {
    pub fn compile(rules: &[SubgoalRule]) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| match rule.compile_triggers() {
                Ok(triggers) => Some((rule.clone(), triggers)),
                Err(e) => {
                    tracing::warn!(subgoal = %rule.name, error = %e, "Skipping subgoal rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Start tracking the rules that apply to `goal`, in rule order.
    pub fn tracker(&self, goal: &str) -> SubgoalTracker {
        let active: Vec<SubgoalRule> = self
            .rules
            .iter()
            .filter(|(_, triggers)| triggers.iter().any(|t| t.is_match(goal)))
            .map(|(rule, _)| rule.clone())
            .collect();

        if !active.is_empty() {
            tracing::debug!(
                subgoals = ?active.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                "Detected subgoals"
            );
        }

        let progress = SubgoalProgress {
            subgoals: active
                .iter()
                .map(|rule| Subgoal {
                    name: rule.name.clone(),
                    description: rule.description.clone(),
                    achieved_at_step: None,
                })
                .collect(),
        };
        SubgoalTracker { active, progress }
    }
}

/// One detected subgoal and when it was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgoal {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Step after which it was first observed; 0 is the initial screen
    #[serde(default)]
    pub achieved_at_step: Option<u32>,
}

impl Subgoal {
    pub fn is_achieved(&self) -> bool {
        self.achieved_at_step.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgoalProgress {
    pub subgoals: Vec<Subgoal>,
}

impl SubgoalProgress {
    pub fn is_empty(&self) -> bool {
        self.subgoals.is_empty()
    }

    pub fn total(&self) -> usize {
        self.subgoals.len()
    }

    pub fn achieved(&self) -> usize {
        self.subgoals.iter().filter(|s| s.is_achieved()).count()
    }

    /// Share of detected subgoals reached; 0.0 when none were detected.
    pub fn completion_rate(&self) -> f64 {
        if self.subgoals.is_empty() {
            return 0.0;
        }
        self.achieved() as f64 / self.total() as f64
    }

    pub fn remaining(&self) -> Vec<&Subgoal> {
        self.subgoals.iter().filter(|s| !s.is_achieved()).collect()
    }
}

/// Progress of one run against its detected subgoals.
#[derive(Debug, Clone)]
pub struct SubgoalTracker {
    active: Vec<SubgoalRule>,
    progress: SubgoalProgress,
}

impl SubgoalTracker {
    /// Check `state`, observed after `step`. Returns the names reached for
    /// the first time.
    pub fn observe(&mut self, state: &ObservableState, step: u32) -> Vec<String> {
        let mut reached = Vec::new();
        for (rule, subgoal) in self.active.iter().zip(self.progress.subgoals.iter_mut()) {
            if !subgoal.is_achieved() && rule.is_met(state) {
                subgoal.achieved_at_step = Some(step);
                tracing::info!(subgoal = %subgoal.name, step, "Subgoal reached");
                reached.push(subgoal.name.clone());
            }
        }
        reached
    }

    pub fn progress(&self) -> &SubgoalProgress {
        &self.progress
    }

    pub fn into_progress(self) -> SubgoalProgress {
        self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, triggers: &[&str], screen: Option<&str>, text: Option<&str>) -> SubgoalRule {
        SubgoalRule {
            name: name.to_string(),
            description: String::new(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            screen: screen.map(str::to_string),
            text: text.map(str::to_string),
        }
    }

    fn state(screen: &str, label: &str) -> ObservableState {
        ObservableState::new(
            screen,
            format!(r#"<node text="{}" class="android.widget.TextView" bounds="[0,0][100,50]"/>"#, label),
            None,
        )
    }

    fn rules() -> SubgoalRules {
        SubgoalRules::compile(&[
            rule("open_settings", &["open.*settings"], Some("Settings"), None),
            rule("open_appearance", &["appearance"], None, Some("Appearance")),
            rule("create_note", &["create.*note", "new.*note"], Some("Editor"), None),
        ])
    }

    #[test]
    fn test_detection_matches_goal_case_insensitively() {
        let tracker = rules().tracker("Open Settings and switch the Appearance tab to dark");
        let names: Vec<&str> = tracker.progress().subgoals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["open_settings", "open_appearance"]);

        assert!(rules().tracker("export note as pdf").progress().is_empty());
    }

    #[test]
    fn test_observe_marks_first_step_reached() {
        let mut tracker = rules().tracker("open settings, then appearance");

        assert!(tracker.observe(&state("Home", "Vault"), 0).is_empty());
        assert_eq!(tracker.observe(&state("settings", "General"), 1), vec!["open_settings"]);
        // Already reached: not reported again.
        assert!(tracker.observe(&state("Settings", "General"), 2).is_empty());
        assert_eq!(
            tracker.observe(&state("Settings", "Appearance options"), 3),
            vec!["open_appearance"]
        );

        let progress = tracker.into_progress();
        assert_eq!(progress.achieved(), 2);
        assert_eq!(progress.subgoals[0].achieved_at_step, Some(1));
        assert_eq!(progress.subgoals[1].achieved_at_step, Some(3));
        assert!((progress.completion_rate() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_screen_and_text_must_both_hold() {
        let rules = SubgoalRules::compile(&[rule(
            "type_title",
            &["titled"],
            Some("Editor"),
            Some("Meeting Notes"),
        )]);
        let mut tracker = rules.tracker("create note titled Meeting Notes");

        assert!(tracker.observe(&state("NoteView", "Meeting Notes"), 1).is_empty());
        assert!(tracker.observe(&state("Editor", "Untitled"), 2).is_empty());
        assert_eq!(tracker.observe(&state("Editor", "Meeting Notes"), 3), vec!["type_title"]);
    }

    #[test]
    fn test_progress_remaining_and_rate() {
        let mut tracker = rules().tracker("open settings and create a new note");
        tracker.observe(&state("Editor", ""), 2);

        let progress = tracker.progress();
        assert_eq!(progress.total(), 2);
        assert_eq!(progress.achieved(), 1);
        assert_eq!(progress.remaining()[0].name, "open_settings");
        assert!((progress.completion_rate() - 0.5).abs() < 1e-12);
        assert_eq!(SubgoalProgress::default().completion_rate(), 0.0);
    }

    #[test]
    fn test_invalid_trigger_is_skipped_and_reported() {
        let broken = rule("broken", &["open(settings"], Some("Settings"), None);
        let rules = SubgoalRules::compile(&[broken.clone(), rule("ok", &["x"], Some("X"), None)]);
        assert_eq!(rules.len(), 1);

        let problems = broken.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("invalid trigger"));
    }

    #[test]
    fn test_rule_without_condition_is_never_met() {
        let idle = rule("idle", &["anything"], None, None);
        assert!(idle.problems().iter().any(|p| p.contains("never achieved")));

        let mut tracker = SubgoalRules::compile(&[idle]).tracker("anything at all");
        assert!(tracker.observe(&state("Home", "anything"), 1).is_empty());
    }
}
