//! Deterministic collaborators for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use qa_pilot::device::UiSnapshot;
use qa_pilot::errors::{DeviceError, ReasoningError};
use qa_pilot::{
    DecisionContext, DeviceControl, DeviceOp, ObservableState, QaConfig, ReasoningService,
    RetryPolicy, Screenshot, VerifyRequest,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Config with instant retries so tests never sleep.
pub fn test_config(max_steps: u32) -> QaConfig {
    QaConfig::default()
        .with_max_steps(max_steps)
        .with_retry(RetryPolicy::immediate(2))
}

/// A `<node/>` line for a clickable element.
pub fn node(text: &str, class: &str, bounds: [i32; 4]) -> String {
    format!(
        r#"<node text="{}" resource-id="" class="{}" content-desc="" bounds="[{},{}][{},{}]" />"#,
        text, class, bounds[0], bounds[1], bounds[2], bounds[3]
    )
}

/// A fake phone: named screens, and transitions triggered by exact device ops.
///
/// Taps that land outside every element of the current screen are rejected,
/// like a tap on a stale coordinate.
pub struct ScriptedDevice {
    screens: HashMap<String, String>,
    transitions: Vec<(String, DeviceOp, String)>,
    current: Mutex<String>,
    ops: Mutex<Vec<DeviceOp>>,
    failing_captures: AtomicU32,
    captures: AtomicU32,
}

impl ScriptedDevice {
    pub fn new(start: &str) -> Self {
        Self {
            screens: HashMap::new(),
            transitions: Vec::new(),
            current: Mutex::new(start.to_string()),
            ops: Mutex::new(Vec::new()),
            failing_captures: AtomicU32::new(0),
            captures: AtomicU32::new(0),
        }
    }

    pub fn screen(mut self, id: &str, nodes: &[String]) -> Self {
        self.screens.insert(id.to_string(), nodes.join("\n"));
        self
    }

    pub fn on(mut self, from: &str, op: DeviceOp, to: &str) -> Self {
        self.transitions.push((from.to_string(), op, to.to_string()));
        self
    }

    /// Make the next `n` captures fail with a transport error.
    pub fn failing_captures(self, n: u32) -> Self {
        self.failing_captures.store(n, Ordering::SeqCst);
        self
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn current_screen(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    pub fn capture_count(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    fn xml_for(&self, screen: &str) -> String {
        self.screens.get(screen).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DeviceControl for ScriptedDevice {
    async fn capture_state(&self) -> Result<ObservableState, DeviceError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_captures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeviceError::Unavailable("device offline".into()));
        }
        let screen = self.current_screen();
        Ok(ObservableState::new(
            screen.as_str(),
            self.xml_for(&screen),
            Some(Screenshot::new(format!("/tmp/{}.png", screen))),
        ))
    }

    async fn perform(&self, op: &DeviceOp) -> Result<(), DeviceError> {
        self.ops.lock().unwrap().push(op.clone());
        let mut current = self.current.lock().unwrap();

        if let DeviceOp::Tap { x, y } = op {
            let snapshot = UiSnapshot::parse(&self.xml_for(&current));
            let hit = snapshot.elements.iter().any(|e| {
                e.bounds.left <= *x && *x <= e.bounds.right && e.bounds.top <= *y && *y <= e.bounds.bottom
            });
            if !hit {
                return Err(DeviceError::Rejected(format!("nothing at ({}, {})", x, y)));
            }
        }

        if let Some((_, _, to)) = self
            .transitions
            .iter()
            .find(|(from, trigger, _)| *from == *current && trigger == op)
        {
            *current = to.clone();
        }
        Ok(())
    }
}

/// Reasoning fake answering `decide` from a script and `verify` with a fixed verdict.
pub struct ScriptedReasoning {
    decisions: Mutex<VecDeque<String>>,
    verdict: String,
    describe_answer: String,
    decide_calls: AtomicU32,
    verify_calls: AtomicU32,
    describe_calls: AtomicU32,
}

impl ScriptedReasoning {
    pub fn new(decisions: &[&str], verdict: &str) -> Self {
        Self {
            decisions: Mutex::new(decisions.iter().map(|d| d.to_string()).collect()),
            verdict: verdict.to_string(),
            describe_answer: "NOT_FOUND".to_string(),
            decide_calls: AtomicU32::new(0),
            verify_calls: AtomicU32::new(0),
            describe_calls: AtomicU32::new(0),
        }
    }

    pub fn passing(decisions: &[&str]) -> Self {
        Self::new(decisions, r#"{"verdict": "PASS", "reason": "goal met", "assertions": [{"expected": "goal met", "observed": "goal met", "passed": true}]}"#)
    }

    pub fn failing(decisions: &[&str]) -> Self {
        Self::new(decisions, r#"{"verdict": "FAIL", "reason": "feature missing", "assertions": [{"expected": "feature present", "observed": "feature absent", "passed": false}]}"#)
    }

    pub fn decide_calls(&self) -> u32 {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> u32 {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn describe(&self, _: &Screenshot, _: &str) -> Result<String, ReasoningError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.describe_answer.clone())
    }

    async fn decide(&self, _: &DecisionContext) -> Result<String, ReasoningError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ReasoningError::Rejected("decision script exhausted".into()))
    }

    async fn verify(&self, _: &VerifyRequest) -> Result<String, ReasoningError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

// =========================================
// A small notes app
// =========================================

pub const NEW_NOTE: [i32; 4] = [0, 100, 200, 200];
pub const TITLE_FIELD: [i32; 4] = [0, 300, 1000, 400];
pub const DONE: [i32; 4] = [0, 500, 200, 600];

/// NotesList --tap New note--> Editor --type X--> EditorTyped --tap Done--> NoteView
pub fn notes_app() -> ScriptedDevice {
    ScriptedDevice::new("NotesList")
        .screen("NotesList", &[node("New note", "android.widget.Button", NEW_NOTE)])
        .screen(
            "Editor",
            &[
                node("", "android.widget.EditText", TITLE_FIELD),
                node("Done", "android.widget.Button", DONE),
            ],
        )
        .screen(
            "EditorTyped",
            &[
                node("X", "android.widget.EditText", TITLE_FIELD),
                node("Done", "android.widget.Button", DONE),
            ],
        )
        .screen("NoteView", &[node("X", "android.widget.TextView", [0, 100, 1000, 200])])
        .on("NotesList", DeviceOp::Tap { x: 100, y: 150 }, "Editor")
        .on("Editor", DeviceOp::InputText { text: "X".into() }, "EditorTyped")
        .on("EditorTyped", DeviceOp::Tap { x: 100, y: 550 }, "NoteView")
}

pub const CREATE_NOTE_GOAL: &str = "create note titled X";

pub const CREATE_NOTE_DECISIONS: [&str; 4] = [
    r#"{"action": "tap", "text": "New note"}"#,
    r#"{"action": "type", "text": "X"}"#,
    r#"{"action": "tap", "text": "Done"}"#,
    r#"{"action": "assert_pass", "reason": "Note X is shown"}"#,
];
