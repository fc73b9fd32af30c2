//! Symbolic UI actions and their wire format.
//!
//! The reasoning collaborator answers with one JSON object per step:
//!
//! ```json
//! {"action": "tap", "text": "Create note", "x": 540, "y": 1210, "description": "Tap create"}
//! {"action": "type", "text": "Meeting Notes", "target": "Title"}
//! {"action": "key", "code": 66}
//! {"action": "swipe", "x1": 500, "y1": 1500, "x2": 500, "y2": 400}
//! {"action": "open_app", "app": "md.obsidian"}
//! {"action": "wait", "seconds": 2}
//! {"action": "assert_pass", "reason": "Note is visible"}
//! {"action": "assert_fail", "reason": "No 'Print to PDF' entry"}
//! ```
//!
//! `parse_action` extracts the object from surrounding prose, deserializes it
//! into the closed [`Action`] union and validates it. Nothing downstream of the
//! Planner ever sees an unvalidated action.

use serde::{Deserialize, Serialize};

use crate::errors::ActionParseError;
use crate::util::extract_json_object;

/// Longest wait the planner may request.
pub const MAX_WAIT_SECONDS: u64 = 30;

/// Android key codes the planner commonly uses.
pub mod keycode {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const ENTER: u32 = 66;
    pub const DEL: u32 = 67;
}

/// A screen coordinate in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Coordinates at or below zero mean "no usable hint".
    pub fn is_usable(&self) -> bool {
        self.x > 0 && self.y > 0
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// What a tap (or a focusing tap before typing) is aimed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Visible text or content description of the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Resource id of the element (full `pkg:id/name` or bare `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
}

impl Target {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_point(mut self, x: i32, y: i32) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    /// The coordinate hint, if both axes are present and usable.
    pub fn point(&self) -> Option<Point> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Point::new(x, y)).filter(Point::is_usable),
            _ => None,
        }
    }

    /// Whether the target names an element that can be searched for.
    pub fn is_searchable(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.id.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.is_searchable() && self.point().is_none()
    }

    /// Short human label used in prompts and logs.
    pub fn label(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            format!("'{}'", text)
        } else if let Some(id) = self.id.as_deref().filter(|t| !t.is_empty()) {
            format!("#{}", id)
        } else if let Some(point) = self.point() {
            point.to_string()
        } else {
            "<none>".to_string()
        }
    }
}

/// The closed set of action kinds. Used as the reward table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tap,
    Type,
    Key,
    Swipe,
    OpenApp,
    AssertPass,
    AssertFail,
    Wait,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Tap,
        ActionKind::Type,
        ActionKind::Key,
        ActionKind::Swipe,
        ActionKind::OpenApp,
        ActionKind::AssertPass,
        ActionKind::AssertFail,
        ActionKind::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Tap => "tap",
            ActionKind::Type => "type",
            ActionKind::Key => "key",
            ActionKind::Swipe => "swipe",
            ActionKind::OpenApp => "open_app",
            ActionKind::AssertPass => "assert_pass",
            ActionKind::AssertFail => "assert_fail",
            ActionKind::Wait => "wait",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One symbolic UI action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Tap {
        #[serde(flatten)]
        target: Target,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    Type {
        /// Text to enter
        text: String,
        /// Field to focus first; the first editable field when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    Key {
        code: u32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    OpenApp {
        app: String,
    },
    #[serde(alias = "assert")]
    AssertPass {
        #[serde(default, alias = "description")]
        reason: String,
    },
    #[serde(alias = "fail", alias = "FAIL")]
    AssertFail {
        #[serde(default)]
        reason: String,
    },
    Wait {
        #[serde(default = "default_wait_seconds")]
        seconds: u64,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
}

fn default_swipe_ms() -> u64 {
    300
}

fn default_wait_seconds() -> u64 {
    1
}

impl Action {
    pub fn tap(target: Target) -> Self {
        Action::Tap {
            target,
            description: String::new(),
        }
    }

    pub fn type_text(text: impl Into<String>, target: Option<Target>) -> Self {
        Action::Type {
            text: text.into(),
            target,
            description: String::new(),
        }
    }

    pub fn key(code: u32) -> Self {
        Action::Key {
            code,
            description: String::new(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Tap { .. } => ActionKind::Tap,
            Action::Type { .. } => ActionKind::Type,
            Action::Key { .. } => ActionKind::Key,
            Action::Swipe { .. } => ActionKind::Swipe,
            Action::OpenApp { .. } => ActionKind::OpenApp,
            Action::AssertPass { .. } => ActionKind::AssertPass,
            Action::AssertFail { .. } => ActionKind::AssertFail,
            Action::Wait { .. } => ActionKind::Wait,
        }
    }

    /// Terminal directives end the loop instead of being executed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::AssertPass { .. } | Action::AssertFail { .. })
    }

    /// Back, home or an app (re)launch: steps that retreat to a known screen.
    pub fn is_recovery(&self) -> bool {
        match self {
            Action::Key { code, .. } => matches!(*code, keycode::BACK | keycode::HOME),
            Action::OpenApp { .. } => true,
            _ => false,
        }
    }

    /// The element this action aims at, if any.
    pub fn target(&self) -> Option<&Target> {
        match self {
            Action::Tap { target, .. } => Some(target),
            Action::Type { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    /// One-line summary for history listings and logs.
    pub fn summary(&self) -> String {
        match self {
            Action::Tap { target, .. } => format!("tap {}", target.label()),
            Action::Type { text, target, .. } => match target {
                Some(t) => format!("type '{}' into {}", text, t.label()),
                None => format!("type '{}'", text),
            },
            Action::Key { code, .. } => format!("key {}", code),
            Action::Swipe { x1, y1, x2, y2, .. } => {
                format!("swipe ({}, {}) -> ({}, {})", x1, y1, x2, y2)
            }
            Action::OpenApp { app } => format!("open_app {}", app),
            Action::AssertPass { reason } => format!("assert_pass: {}", reason),
            Action::AssertFail { reason } => format!("assert_fail: {}", reason),
            Action::Wait { seconds, .. } => format!("wait {}s", seconds),
        }
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ActionParseError> {
        let invalid = |message: &str| ActionParseError::Invalid {
            kind: self.kind().to_string(),
            message: message.to_string(),
        };

        match self {
            Action::Tap { target, .. } if target.is_empty() => {
                Err(invalid("needs a text, id or positive coordinate target"))
            }
            Action::Type { text, .. } if text.is_empty() => Err(invalid("text must not be empty")),
            Action::Type {
                target: Some(target),
                ..
            } if target.is_empty() => Err(invalid("target is present but empty")),
            Action::Swipe { x1, y1, x2, y2, .. } if [x1, y1, x2, y2].iter().any(|v| **v < 0) => {
                Err(invalid("coordinates must not be negative"))
            }
            Action::Swipe { x1, y1, x2, y2, .. } if x1 == x2 && y1 == y2 => {
                Err(invalid("start and end points are identical"))
            }
            Action::OpenApp { app } if app.trim().is_empty() => {
                Err(invalid("app package must not be empty"))
            }
            Action::Wait { seconds, .. } if *seconds > MAX_WAIT_SECONDS => Err(invalid(&format!(
                "wait of {}s exceeds the {}s cap",
                seconds, MAX_WAIT_SECONDS
            ))),
            _ => Ok(()),
        }
    }
}

/// Parse and validate one action from raw reasoning output.
pub fn parse_action(output: &str) -> Result<Action, ActionParseError> {
    let json = extract_json_object(output).ok_or(ActionParseError::NoJson)?;
    let action: Action =
        serde_json::from_str(&json).map_err(|e| ActionParseError::Schema(e.to_string()))?;
    action.validate()?;
    Ok(action)
}
