use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use super::{ContextKey, FailureEntry, Pattern, RewardTable};
use crate::action::{Action, ActionKind};
use crate::config::MemoryConfig;
use crate::goal::Verdict;

/// Candidate patterns kept per context before the least-used is evicted.
pub const DEFAULT_MAX_PATTERNS: usize = 5;

/// Failures of an action within one context before it is flagged "avoid".
pub const DEFAULT_AVOID_THRESHOLD: u32 = 3;

const FILE_VERSION: u32 = 1;

/// On-disk layout. Context keys are structs, so they are stored as a list
/// rather than as JSON object keys.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    contexts: Vec<ContextEntry>,
    #[serde(default)]
    rewards: RewardTable,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    context: ContextKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    patterns: Vec<Pattern>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    failures: Vec<FailureEntry>,
}

/// Owned, single-writer memory of patterns, failures and rewards.
///
/// File-backed stores hold an exclusive advisory lock on `<file>.lock` for
/// their whole lifetime, so a second process opening the same file fails fast
/// instead of racing on flush.
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    _lock: Option<File>,
    patterns: HashMap<ContextKey, Vec<Pattern>>,
    failures: HashMap<ContextKey, Vec<FailureEntry>>,
    rewards: RewardTable,
    max_patterns: usize,
    avoid_threshold: u32,
    dirty: bool,
}

impl MemoryStore {
    /// A store with no backing file. `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            _lock: None,
            patterns: HashMap::new(),
            failures: HashMap::new(),
            rewards: RewardTable::default(),
            max_patterns: DEFAULT_MAX_PATTERNS,
            avoid_threshold: DEFAULT_AVOID_THRESHOLD,
            dirty: false,
        }
    }

    /// Open the store backed by `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let lock_path = lock_path_for(path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "Memory file {} is in use by another run (single writer only)",
                path.display()
            )
        })?;

        let mut store = Self::in_memory();
        store.path = Some(path.to_path_buf());
        store._lock = Some(lock);

        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read memory file: {}", path.display()))?;
            if !content.trim().is_empty() {
                let file: MemoryFile = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse memory file: {}", path.display()))?;
                store.absorb(file);
            }
        }

        tracing::debug!(
            path = %path.display(),
            contexts = store.patterns.len(),
            "Loaded memory store"
        );
        Ok(store)
    }

    /// Open the configured store with its pattern cap and avoid threshold.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let path = config.resolved_file()?;
        Ok(Self::load(&path)?
            .with_max_patterns(config.max_patterns_per_context)
            .with_avoid_threshold(config.avoid_threshold))
    }

    pub fn with_max_patterns(mut self, max_patterns: usize) -> Self {
        self.max_patterns = max_patterns.max(1);
        self
    }

    pub fn with_avoid_threshold(mut self, threshold: u32) -> Self {
        self.avoid_threshold = threshold.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the store to its backing file via a temp file and rename.
    pub fn flush(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&self.snapshot())
            .context("Failed to serialize memory store")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write memory file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace memory file: {}", path.display()))?;

        self.dirty = false;
        tracing::debug!(path = %path.display(), "Flushed memory store");
        Ok(())
    }

    // =========================================================================
    // Patterns
    // =========================================================================

    /// Best pattern stored for exactly this context.
    pub fn get_pattern(&self, context: &ContextKey) -> Option<&Pattern> {
        self.patterns
            .get(context)?
            .iter()
            .max_by(|a, b| a.rank().cmp(&b.rank()))
    }

    pub fn patterns_for(&self, context: &ContextKey) -> &[Pattern] {
        self.patterns.get(context).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remember that `actions` reached `outcome` from `context`.
    ///
    /// An identical list bumps the existing pattern. A new list is inserted,
    /// evicting the least-used (oldest on ties) candidate when the context is
    /// full. Empty lists are ignored.
    pub fn record_success(&mut self, context: &ContextKey, actions: &[Action], outcome: Verdict) {
        if actions.is_empty() {
            tracing::debug!(context = %context, "Skipping empty pattern");
            return;
        }

        let candidates = self.patterns.entry(context.clone()).or_default();
        self.dirty = true;

        if let Some(existing) = candidates.iter_mut().find(|p| p.actions == actions) {
            existing.use_count += 1;
            existing.last_outcome = outcome;
            existing.last_used_at = Utc::now();
            return;
        }

        if candidates.len() >= self.max_patterns
            && let Some(victim) = candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.rank().cmp(&b.rank()))
                .map(|(i, _)| i)
        {
            let evicted = candidates.remove(victim);
            tracing::info!(
                context = %context,
                use_count = evicted.use_count,
                steps = evicted.len(),
                "Evicted least-used pattern"
            );
        }

        candidates.push(Pattern::new(context.clone(), actions.to_vec(), outcome));
    }

    // =========================================================================
    // Failures
    // =========================================================================

    /// Log that `actions` failed from `context`.
    pub fn record_failure(&mut self, context: &ContextKey, actions: &[Action], reason: &str) {
        if actions.is_empty() {
            return;
        }

        let entries = self.failures.entry(context.clone()).or_default();
        self.dirty = true;

        if let Some(existing) = entries.iter_mut().find(|f| f.actions == actions) {
            existing.count += 1;
            existing.reason = reason.to_string();
            existing.last_failed_at = Utc::now();
        } else {
            entries.push(FailureEntry {
                actions: actions.to_vec(),
                reason: reason.to_string(),
                count: 1,
                last_failed_at: Utc::now(),
            });
        }
    }

    /// Number of logged failures in `context` whose action list contains `action`.
    pub fn failure_count(&self, context: &ContextKey, action: &Action) -> u32 {
        self.failures
            .get(context)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|f| f.actions.contains(action))
                    .map(|f| f.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// The most recent failure reason when `action` has failed often enough
    /// in `context` to be avoided.
    pub fn should_avoid_action(&self, context: &ContextKey, action: &Action) -> Option<String> {
        if self.failure_count(context, action) < self.avoid_threshold {
            return None;
        }
        self.failures
            .get(context)?
            .iter()
            .filter(|f| f.actions.contains(action))
            .max_by_key(|f| f.last_failed_at)
            .map(|f| f.reason.clone())
    }

    /// Every action currently flagged "avoid" in `context`, with its reason.
    pub fn avoided_actions(&self, context: &ContextKey) -> Vec<(Action, String)> {
        let mut seen: Vec<&Action> = Vec::new();
        let mut flagged = Vec::new();
        for entry in self.failures.get(context).into_iter().flatten() {
            for action in &entry.actions {
                if seen.contains(&action) {
                    continue;
                }
                seen.push(action);
                if let Some(reason) = self.should_avoid_action(context, action) {
                    flagged.push((action.clone(), reason));
                }
            }
        }
        flagged
    }

    // =========================================================================
    // Rewards
    // =========================================================================

    pub fn update_reward(&mut self, kind: ActionKind, delta: f64) -> f64 {
        self.dirty = true;
        self.rewards.update(kind, delta)
    }

    pub fn reward(&self, kind: ActionKind) -> f64 {
        self.rewards.get(kind)
    }

    pub fn rewards(&self) -> &RewardTable {
        &self.rewards
    }

    // =========================================================================
    // Examples
    // =========================================================================

    /// Best passing patterns recorded for `goal` from any screen, most used first.
    pub fn example_sequences(&self, goal: &str, limit: usize) -> Vec<&Pattern> {
        let mut found: Vec<&Pattern> = self
            .patterns
            .iter()
            .filter(|(key, _)| key.goal == goal)
            .flat_map(|(_, candidates)| candidates.iter())
            .filter(|p| p.last_outcome == Verdict::Pass)
            .collect();
        found.sort_by(|a, b| b.rank().cmp(&a.rank()));
        found.truncate(limit);
        found
    }

    fn absorb(&mut self, file: MemoryFile) {
        if file.version > FILE_VERSION {
            tracing::warn!(
                version = file.version,
                supported = FILE_VERSION,
                "Memory file written by a newer version"
            );
        }
        for entry in file.contexts {
            if !entry.patterns.is_empty() {
                self.patterns.insert(entry.context.clone(), entry.patterns);
            }
            if !entry.failures.is_empty() {
                self.failures.insert(entry.context, entry.failures);
            }
        }
        self.rewards = file.rewards;
    }

    fn snapshot(&self) -> MemoryFile {
        let mut keys: Vec<&ContextKey> = self.patterns.keys().chain(self.failures.keys()).collect();
        keys.sort();
        keys.dedup();

        let contexts = keys
            .into_iter()
            .map(|key| ContextEntry {
                context: key.clone(),
                patterns: self.patterns.get(key).cloned().unwrap_or_default(),
                failures: self.failures.get(key).cloned().unwrap_or_default(),
            })
            .collect();

        MemoryFile {
            version: FILE_VERSION,
            contexts,
            rewards: self.rewards.clone(),
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}
