//! Configuration for qa-pilot, read from `qa.toml`.
//!
//! Layering: file -> environment -> programmatic overrides.
//!
//! ```toml
//! [run]
//! max_steps = 20
//! stuck_threshold = 3
//! log_dir = ".qa-pilot/runs"
//!
//! [planner]
//! invalid_output_attempts = 3
//! example_limit = 3
//!
//! [resolver]
//! vision_enabled = true
//! backspace_margin = 5
//!
//! [memory]
//! file = "~/.qa-pilot/memory.json"
//! max_patterns_per_context = 5
//! avoid_threshold = 3
//!
//! [retry.reasoning]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! multiplier = 2.0
//! max_delay_ms = 30000
//! timeout_secs = 60
//!
//! [retry.device]
//! max_attempts = 2
//! timeout_secs = 30
//!
//! [[subgoals]]
//! name = "open_settings"
//! triggers = ["open.*settings"]
//! screen = "Settings"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::memory::{DEFAULT_AVOID_THRESHOLD, DEFAULT_MAX_PATTERNS};
use crate::retry::RetryPolicy;
use crate::subgoal::SubgoalRule;

pub const CONFIG_FILE: &str = "qa.toml";

pub const ENV_MAX_STEPS: &str = "QA_PILOT_MAX_STEPS";
pub const ENV_STUCK_THRESHOLD: &str = "QA_PILOT_STUCK_THRESHOLD";
pub const ENV_MEMORY_FILE: &str = "QA_PILOT_MEMORY_FILE";

/// Run loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Executed steps before the run ends with MAX_STEPS_REACHED
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Consecutive unchanged states before the run ends with STUCK_LOOP
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    /// Where `JsonRunLog` writes events and run files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_max_steps() -> u32 {
    20
}

fn default_stuck_threshold() -> u32 {
    3
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            stuck_threshold: default_stuck_threshold(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Decide calls allowed to return unparseable or invalid actions
    #[serde(default = "default_invalid_output_attempts")]
    pub invalid_output_attempts: u32,
    /// Example sequences included in a decision prompt
    #[serde(default = "default_example_limit")]
    pub example_limit: usize,
}

fn default_invalid_output_attempts() -> u32 {
    3
}

fn default_example_limit() -> usize {
    3
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            invalid_output_attempts: default_invalid_output_attempts(),
            example_limit: default_example_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Whether the VISION tier may call the reasoning service
    #[serde(default = "default_true")]
    pub vision_enabled: bool,
    /// Extra backspaces sent beyond the field length when clearing
    #[serde(default = "default_backspace_margin")]
    pub backspace_margin: usize,
}

fn default_true() -> bool {
    true
}

fn default_backspace_margin() -> usize {
    5
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            vision_enabled: true,
            backspace_margin: default_backspace_margin(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Backing file; `~/.qa-pilot/memory.json` when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_max_patterns")]
    pub max_patterns_per_context: usize,
    #[serde(default = "default_avoid_threshold")]
    pub avoid_threshold: u32,
}

fn default_max_patterns() -> usize {
    DEFAULT_MAX_PATTERNS
}

fn default_avoid_threshold() -> u32 {
    DEFAULT_AVOID_THRESHOLD
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_patterns_per_context: default_max_patterns(),
            avoid_threshold: default_avoid_threshold(),
        }
    }
}

impl MemoryConfig {
    /// The configured file with `~/` expanded, or the default location.
    pub fn resolved_file(&self) -> Result<PathBuf> {
        match &self.file {
            Some(path) => expand_home(path),
            None => Ok(default_data_dir()?.join("memory.json")),
        }
    }
}

/// Retry policies per collaborator. Fields missing from a table take the
/// general `RetryPolicy` defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub reasoning: RetryPolicy,
    #[serde(default = "RetryPolicy::device")]
    pub device: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reasoning: RetryPolicy::default(),
            device: RetryPolicy::device(),
        }
    }
}

/// Root of `qa.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Progress markers detected from goal text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subgoals: Vec<SubgoalRule>,
}

impl QaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse qa.toml")
    }

    /// Load `qa.toml` from `dir`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize qa.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `QA_PILOT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Returns warnings for values that
    /// could not be parsed; those are ignored.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(raw) = lookup(ENV_MAX_STEPS) {
            match raw.trim().parse() {
                Ok(value) => self.run.max_steps = value,
                Err(_) => warnings.push(format!("Ignoring {}={:?}: not a number", ENV_MAX_STEPS, raw)),
            }
        }

        if let Some(raw) = lookup(ENV_STUCK_THRESHOLD) {
            match raw.trim().parse() {
                Ok(value) => self.run.stuck_threshold = value,
                Err(_) => warnings.push(format!(
                    "Ignoring {}={:?}: not a number",
                    ENV_STUCK_THRESHOLD, raw
                )),
            }
        }

        if let Some(raw) = lookup(ENV_MEMORY_FILE).filter(|v| !v.trim().is_empty()) {
            self.memory.file = Some(PathBuf::from(raw.trim()));
        }

        warnings
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.run.max_steps = max_steps;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: u32) -> Self {
        self.run.stuck_threshold = threshold;
        self
    }

    pub fn with_memory_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory.file = Some(path.into());
        self
    }

    /// Use the same retry policy for every collaborator.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry.reasoning = policy.clone();
        self.retry.device = policy;
        self
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.run.max_steps == 0 {
            warnings.push("run.max_steps is 0: every run will end with MAX_STEPS_REACHED".to_string());
        }
        if self.run.stuck_threshold == 0 {
            warnings.push("run.stuck_threshold is 0: it will be treated as 1".to_string());
        }
        if self.planner.invalid_output_attempts == 0 {
            warnings.push("planner.invalid_output_attempts is 0: one attempt is always made".to_string());
        }
        if self.memory.max_patterns_per_context == 0 {
            warnings.push("memory.max_patterns_per_context is 0: it will be treated as 1".to_string());
        }
        for (name, policy) in [("reasoning", &self.retry.reasoning), ("device", &self.retry.device)] {
            if policy.max_attempts == 0 {
                warnings.push(format!("retry.{}.max_attempts is 0: one attempt is always made", name));
            }
            if policy.multiplier < 1.0 {
                warnings.push(format!(
                    "retry.{}.multiplier {} is below 1.0: delays will not grow",
                    name, policy.multiplier
                ));
            }
        }
        for rule in &self.subgoals {
            warnings.extend(rule.problems());
        }

        warnings
    }
}

/// `~/.qa-pilot`
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".qa-pilot"))
}

/// Replace a leading `~` with the home directory.
pub(crate) fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = QaConfig::default();
        assert_eq!(config.run.max_steps, 20);
        assert_eq!(config.run.stuck_threshold, 3);
        assert_eq!(config.planner.invalid_output_attempts, 3);
        assert_eq!(config.memory.max_patterns_per_context, 5);
        assert_eq!(config.memory.avoid_threshold, 3);
        assert_eq!(config.retry.device.max_attempts, 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = QaConfig::parse(
            r#"
            [run]
            max_steps = 5

            [retry.reasoning]
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.run.max_steps, 5);
        assert_eq!(config.run.stuck_threshold, 3);
        assert_eq!(config.retry.reasoning.max_attempts, 4);
        assert_eq!(config.retry.reasoning.initial_delay_ms, 1_000);
        assert_eq!(config.retry.device, RetryPolicy::device());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = QaConfig::parse("[run\nmax_steps = ").unwrap_err();
        assert!(err.to_string().contains("qa.toml"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let config = QaConfig::default().with_max_steps(7).with_memory_file("/tmp/m.json");
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = QaConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        assert_eq!(QaConfig::load_or_default(dir.path()).unwrap(), QaConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_STEPS, "8"),
            (ENV_STUCK_THRESHOLD, "many"),
            (ENV_MEMORY_FILE, "/data/mem.json"),
        ]);
        let mut config = QaConfig::default();
        let warnings = config.apply_env_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.run.max_steps, 8);
        assert_eq!(config.run.stuck_threshold, 3);
        assert_eq!(config.memory.file, Some(PathBuf::from("/data/mem.json")));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains(ENV_STUCK_THRESHOLD));
    }

    #[test]
    fn test_validate_flags_zero_budgets() {
        let mut config = QaConfig::default().with_max_steps(0);
        config.retry.device.max_attempts = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("max_steps")));
        assert!(warnings.iter().any(|w| w.contains("retry.device")));
    }

    #[test]
    fn test_parse_subgoal_rules() {
        let config = QaConfig::parse(
            r#"
            [[subgoals]]
            name = "open_settings"
            description = "Open Settings"
            triggers = ["open.*settings"]
            screen = "Settings"

            [[subgoals]]
            name = "bad"
            triggers = ["(unclosed"]
            text = "x"
            "#,
        )
        .unwrap();
        assert_eq!(config.subgoals.len(), 2);
        assert_eq!(config.subgoals[0].screen.as_deref(), Some("Settings"));
        assert_eq!(config.subgoals[1].text.as_deref(), Some("x"));

        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("subgoal 'bad'"));
    }

    #[test]
    fn test_memory_file_resolution() {
        let config = MemoryConfig {
            file: Some(PathBuf::from("/abs/memory.json")),
            ..Default::default()
        };
        assert_eq!(config.resolved_file().unwrap(), PathBuf::from("/abs/memory.json"));
        if let Some(home) = dirs::home_dir() {
            let default = MemoryConfig::default().resolved_file().unwrap();
            assert_eq!(default, home.join(".qa-pilot").join("memory.json"));
        }
    }
}
