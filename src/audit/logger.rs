use super::{ActionRecord, RunCounters, RunResult, RunSink};
use crate::config::{RunConfig, expand_home};
use crate::supervisor::AssertionResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// One line of `events.jsonl`.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Action {
        run_id: Uuid,
        record: &'a ActionRecord,
    },
    Assertion {
        run_id: Uuid,
        assertion: &'a AssertionResult,
    },
    Run {
        run_id: Uuid,
        goal_id: &'a str,
        status: &'a str,
        steps: usize,
        counters: &'a RunCounters,
        file: String,
    },
}

/// File-backed `RunSink`.
///
/// ```text
/// <dir>/events.jsonl                 one JSON event per line
/// <dir>/runs/<timestamp>_<id8>.json  each finished RunResult
/// ```
pub struct JsonRunLog {
    log_dir: PathBuf,
    events_file: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRunLog {
    pub fn new(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir.join("runs"))
            .with_context(|| format!("Failed to create run log directory: {}", log_dir.display()))?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            events_file: log_dir.join("events.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    /// The log configured by `run.log_dir`, if any.
    pub fn from_config(config: &RunConfig) -> Result<Option<Self>> {
        match &config.log_dir {
            Some(dir) => Ok(Some(Self::new(&expand_home(dir)?)?)),
            None => Ok(None),
        }
    }

    pub fn events_file(&self) -> &Path {
        &self.events_file
    }

    fn run_file_for(&self, result: &RunResult) -> PathBuf {
        let filename = format!(
            "{}_{}.json",
            result.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &result.run_id.to_string()[..8]
        );
        self.log_dir.join("runs").join(filename)
    }

    fn append(&self, event: &Event<'_>) -> Result<()> {
        let line = serde_json::to_string(event).context("Failed to serialize run event")?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Run log write lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_file)
            .with_context(|| format!("Failed to open {}", self.events_file.display()))?;
        writeln!(file, "{}", line).context("Failed to append run event")?;
        Ok(())
    }

    /// Finished runs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.log_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<RunResult> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run file: {}", path.display()))
    }
}

#[async_trait]
impl RunSink for JsonRunLog {
    async fn record_action(&self, run_id: Uuid, record: &ActionRecord) -> Result<()> {
        self.append(&Event::Action { run_id, record })
    }

    async fn record_assertion(&self, run_id: Uuid, assertion: &AssertionResult) -> Result<()> {
        self.append(&Event::Assertion { run_id, assertion })
    }

    async fn record_run(&self, result: &RunResult) -> Result<()> {
        let run_file = self.run_file_for(result);
        let json = serde_json::to_string_pretty(result).context("Failed to serialize run result")?;
        fs::write(&run_file, json)
            .with_context(|| format!("Failed to write run file: {}", run_file.display()))?;

        self.append(&Event::Run {
            run_id: result.run_id,
            goal_id: &result.goal_id,
            status: result.status.as_str(),
            steps: result.steps(),
            counters: &result.counters,
            file: run_file.display().to_string(),
        })?;

        tracing::debug!(
            run_id = %result.run_id,
            file = %run_file.display(),
            "Run result written"
        );
        Ok(())
    }
}
