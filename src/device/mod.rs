//! Device-control boundary.
//!
//! The loop never talks to a phone directly. It asks a [`DeviceControl`]
//! implementation for the current [`ObservableState`] and hands it concrete
//! [`DeviceOp`]s. Capture and command transport (adb, an emulator bridge, a
//! scripted fake) live behind the trait.

pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::DeviceError;
use crate::util::digest_parts;

pub use snapshot::{Bounds, UiElement, UiSnapshot};

/// Handle to a captured screenshot on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub path: PathBuf,
}

impl Screenshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// What the device shows after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableState {
    /// Identifier of the current screen (activity or route name)
    pub screen_id: String,
    /// Raw structural dump as returned by the device
    pub ui_xml: String,
    /// Parsed form of `ui_xml`
    pub snapshot: UiSnapshot,
    pub screenshot: Option<Screenshot>,
}

impl ObservableState {
    pub fn new(
        screen_id: impl Into<String>,
        ui_xml: impl Into<String>,
        screenshot: Option<Screenshot>,
    ) -> Self {
        let ui_xml = ui_xml.into();
        let snapshot = UiSnapshot::parse(&ui_xml);
        Self {
            screen_id: screen_id.into(),
            ui_xml,
            snapshot,
            screenshot,
        }
    }

    /// Fingerprint of the screen id and normalized element list.
    ///
    /// The screenshot is left out: clocks and cursors change pixels on every
    /// capture and would hide a stuck loop.
    pub fn state_hash(&self) -> String {
        let normalized = self.snapshot.normalized();
        digest_parts([self.screen_id.as_str(), normalized.as_str()])
    }
}

/// Concrete device operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeviceOp {
    Tap {
        x: i32,
        y: i32,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    },
    /// Type into whatever currently has focus
    InputText {
        text: String,
    },
    Key {
        code: u32,
    },
    /// Select the whole content of the focused field
    SelectAll,
    /// Replace the content of the field at a point without key events
    SetText {
        x: i32,
        y: i32,
        text: String,
    },
    OpenApp {
        package: String,
    },
}

impl DeviceOp {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceOp::Tap { .. } => "tap",
            DeviceOp::Swipe { .. } => "swipe",
            DeviceOp::InputText { .. } => "input_text",
            DeviceOp::Key { .. } => "key",
            DeviceOp::SelectAll => "select_all",
            DeviceOp::SetText { .. } => "set_text",
            DeviceOp::OpenApp { .. } => "open_app",
        }
    }
}

/// Screen capture and command execution on the device under test.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Capture screen id, structural dump and screenshot.
    async fn capture_state(&self) -> Result<ObservableState, DeviceError>;

    /// Execute one operation. `DeviceError::Rejected` means the operation
    /// reached the device but had no effect.
    async fn perform(&self, op: &DeviceOp) -> Result<(), DeviceError>;
}
