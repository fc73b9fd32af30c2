//! Turns symbolic actions into device operations.
//!
//! Element lookups go through three tiers, strictly in order, and stop at the
//! first tier whose device operation succeeds:
//!
//! 1. `XML` - match text/id in the structural snapshot, tap the element center
//! 2. `VISION` - ask the reasoning service to locate the target on the screenshot
//! 3. `FALLBACK_COORDS` - the action's own coordinate hint
//!
//! A tier fails when it finds nothing or the device rejects the operation.
//! Transport failures are retried once and then end the run.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::action::{Action, Point, Target, keycode};
use crate::config::ResolverConfig;
use crate::device::{Bounds, DeviceControl, DeviceOp, ObservableState, UiElement};
use crate::errors::{DeviceError, ErrorKind, RunError};
use crate::reasoning::ReasoningService;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::util::extract_json_object;

/// Android `KEYCODE_MOVE_END`.
const KEY_MOVE_END: u32 = 123;

static PAREN_COORDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(\d+)\s*,\s*(\d+)\s*\)").unwrap());

static NAMED_COORDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bx\s*[=:]\s*(\d+)\D+?\by\s*[=:]\s*(\d+)").unwrap());

/// Which lookup tier carried out an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionTier {
    Xml,
    Vision,
    FallbackCoords,
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionTier::Xml => write!(f, "XML"),
            ResolutionTier::Vision => write!(f, "VISION"),
            ResolutionTier::FallbackCoords => write!(f, "FALLBACK_COORDS"),
        }
    }
}

/// Outcome of executing one action. Step-level failures live here; fatal
/// ones are returned as `RunError`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub tier: Option<ResolutionTier>,
    pub success: bool,
    pub error: Option<ErrorKind>,
    pub detail: String,
}

impl Resolution {
    fn ok(tier: Option<ResolutionTier>, detail: impl Into<String>) -> Self {
        Self {
            tier,
            success: true,
            error: None,
            detail: detail.into(),
        }
    }

    fn failed(tier: Option<ResolutionTier>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            tier,
            success: false,
            error: Some(kind),
            detail: detail.into(),
        }
    }
}

/// Parse a coordinate answer from the vision collaborator.
///
/// Accepts `{"x": 540, "y": 1210}` (optionally inside prose), `(540, 1210)` and
/// `x=540, y=1210`. `NOT_FOUND` or unusable coordinates yield `None`.
pub fn parse_coordinates(answer: &str) -> Option<Point> {
    if answer.to_uppercase().contains("NOT_FOUND") {
        return None;
    }

    let point = extract_json_object(answer)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
        .and_then(|value| {
            let x = value.get("x")?.as_f64()?;
            let y = value.get("y")?.as_f64()?;
            Some(Point::new(x.round() as i32, y.round() as i32))
        })
        .or_else(|| {
            [&*PAREN_COORDS_REGEX, &*NAMED_COORDS_REGEX]
                .iter()
                .find_map(|re| {
                    let cap = re.captures(answer)?;
                    Some(Point::new(cap[1].parse().ok()?, cap[2].parse().ok()?))
                })
        })?;

    point.is_usable().then_some(point)
}

pub struct ActionResolver {
    device: Arc<dyn DeviceControl>,
    reasoning: Arc<dyn ReasoningService>,
    config: ResolverConfig,
    device_retry: RetryPolicy,
    reasoning_retry: RetryPolicy,
}

impl ActionResolver {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        reasoning: Arc<dyn ReasoningService>,
        config: ResolverConfig,
        device_retry: RetryPolicy,
        reasoning_retry: RetryPolicy,
    ) -> Self {
        Self {
            device,
            reasoning,
            config,
            device_retry,
            reasoning_retry,
        }
    }

    /// Execute a non-terminal action against the device.
    pub async fn execute(
        &self,
        action: &Action,
        state: &ObservableState,
    ) -> Result<Resolution, RunError> {
        match action {
            Action::Tap { target, .. } => match self.tap_target(target, state).await? {
                Some((tier, point)) => Ok(Resolution::ok(Some(tier), format!("tapped {}", point))),
                None => Ok(Resolution::failed(
                    None,
                    ErrorKind::ElementNotFound,
                    format!("{} not found by any tier", target.label()),
                )),
            },
            Action::Type { text, target, .. } => self.type_text(text, target.as_ref(), state).await,
            Action::Key { code, .. } => self.direct(DeviceOp::Key { code: *code }).await,
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
                ..
            } => {
                self.direct(DeviceOp::Swipe {
                    x1: *x1,
                    y1: *y1,
                    x2: *x2,
                    y2: *y2,
                    duration_ms: *duration_ms,
                })
                .await
            }
            Action::OpenApp { app } => self.direct(DeviceOp::OpenApp { package: app.clone() }).await,
            Action::Wait { seconds, .. } => {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Ok(Resolution::ok(None, format!("waited {}s", seconds)))
            }
            Action::AssertPass { .. } | Action::AssertFail { .. } => {
                Ok(Resolution::ok(None, "terminal directive, nothing to execute"))
            }
        }
    }

    async fn direct(&self, op: DeviceOp) -> Result<Resolution, RunError> {
        if self.perform(&op).await? {
            Ok(Resolution::ok(None, op.name()))
        } else {
            Ok(Resolution::failed(
                None,
                ErrorKind::DeviceError,
                format!("device rejected {}", op.name()),
            ))
        }
    }

    /// Locate and tap `target`, returning the tier and point that worked.
    async fn tap_target(
        &self,
        target: &Target,
        state: &ObservableState,
    ) -> Result<Option<(ResolutionTier, Point)>, RunError> {
        let searchable = target.is_searchable();

        if searchable {
            match state.snapshot.find(target) {
                Some(element) => {
                    let point = element.bounds.center();
                    if self.tap(point).await? {
                        tracing::debug!(tier = %ResolutionTier::Xml, element = %target.label(), %point, "Tier succeeded");
                        return Ok(Some((ResolutionTier::Xml, point)));
                    }
                    tracing::debug!(tier = %ResolutionTier::Xml, element = %target.label(), "Tap rejected");
                }
                None => {
                    tracing::debug!(tier = %ResolutionTier::Xml, element = %target.label(), "No snapshot match");
                }
            }
        }

        if searchable
            && self.config.vision_enabled
            && let Some(screenshot) = &state.screenshot
        {
            let query = format!(
                "Find the UI element {} on this screen. Reply with JSON {{\"x\": <int>, \"y\": <int>}} for its center, or NOT_FOUND.",
                target.label()
            );
            let answer = retry_with_backoff(&self.reasoning_retry, "describe", || {
                self.reasoning.describe(screenshot, &query)
            })
            .await
            .map_err(|source| RunError::Reasoning {
                operation: "describe",
                source,
            })?;

            match parse_coordinates(&answer) {
                Some(point) => {
                    if self.tap(point).await? {
                        tracing::debug!(tier = %ResolutionTier::Vision, element = %target.label(), %point, "Tier succeeded");
                        return Ok(Some((ResolutionTier::Vision, point)));
                    }
                    tracing::debug!(tier = %ResolutionTier::Vision, element = %target.label(), "Tap rejected");
                }
                None => {
                    tracing::debug!(tier = %ResolutionTier::Vision, element = %target.label(), "Vision found nothing");
                }
            }
        }

        if let Some(point) = target.point() {
            if self.tap(point).await? {
                tracing::debug!(tier = %ResolutionTier::FallbackCoords, %point, "Tier succeeded");
                return Ok(Some((ResolutionTier::FallbackCoords, point)));
            }
            tracing::debug!(tier = %ResolutionTier::FallbackCoords, %point, "Tap rejected");
        }

        tracing::info!(element = %target.label(), "All resolution tiers failed");
        Ok(None)
    }

    async fn type_text(
        &self,
        text: &str,
        target: Option<&Target>,
        state: &ObservableState,
    ) -> Result<Resolution, RunError> {
        let (tier, field_bounds) = match target {
            Some(target) => match self.tap_target(target, state).await? {
                Some((tier, _)) => {
                    let bounds = state
                        .snapshot
                        .find(target)
                        .filter(|_| tier == ResolutionTier::Xml)
                        .map(|e| e.bounds);
                    (Some(tier), bounds)
                }
                None => {
                    return Ok(Resolution::failed(
                        None,
                        ErrorKind::ElementNotFound,
                        format!("field {} not found by any tier", target.label()),
                    ));
                }
            },
            None => match state.snapshot.first_editable() {
                Some(field) => {
                    if !self.tap(field.bounds.center()).await? {
                        return Ok(Resolution::failed(
                            None,
                            ErrorKind::ElementNotFound,
                            "could not focus the first editable field",
                        ));
                    }
                    (Some(ResolutionTier::Xml), Some(field.bounds))
                }
                // Nothing editable in the dump: type into whatever has focus.
                None => (None, None),
            },
        };

        let focused = self.capture().await?;
        let mut cleared_with = None;
        if let Some(field) = locate_field(&focused, field_bounds)
            && !field.text.is_empty()
        {
            match self.clear_field(field).await? {
                Some(strategy) => cleared_with = Some(strategy),
                None => {
                    return Ok(Resolution::failed(
                        tier,
                        ErrorKind::FieldNotCleared,
                        format!("field still contains '{}' after all clear strategies", field.text),
                    ));
                }
            }
        }

        if !self
            .perform(&DeviceOp::InputText {
                text: text.to_string(),
            })
            .await?
        {
            return Ok(Resolution::failed(tier, ErrorKind::DeviceError, "device rejected text input"));
        }

        let detail = match cleared_with {
            Some(strategy) => format!("typed {} chars after clearing via {}", text.chars().count(), strategy),
            None => format!("typed {} chars", text.chars().count()),
        };
        Ok(Resolution::ok(tier, detail))
    }

    /// Try each clear strategy in turn, verifying after each one.
    /// Returns the name of the strategy that emptied the field.
    async fn clear_field(&self, field: &UiElement) -> Result<Option<&'static str>, RunError> {
        let center = field.bounds.center();
        let backspaces = field.text.chars().count() + self.config.backspace_margin;

        let strategies: [(&'static str, Vec<DeviceOp>); 3] = [
            (
                "select_all",
                vec![DeviceOp::SelectAll, DeviceOp::Key { code: keycode::DEL }],
            ),
            (
                "backspace",
                std::iter::once(DeviceOp::Key { code: KEY_MOVE_END })
                    .chain(std::iter::repeat_n(DeviceOp::Key { code: keycode::DEL }, backspaces))
                    .collect(),
            ),
            (
                "overwrite",
                vec![DeviceOp::SetText {
                    x: center.x,
                    y: center.y,
                    text: String::new(),
                }],
            ),
        ];

        for (name, ops) in strategies {
            let mut applied = true;
            for op in &ops {
                if !self.perform(op).await? {
                    applied = false;
                    break;
                }
            }

            if applied {
                let after = self.capture().await?;
                match locate_field(&after, Some(field.bounds)) {
                    Some(f) if !f.text.is_empty() => {
                        tracing::debug!(strategy = name, remaining = %f.text, "Field not cleared");
                    }
                    _ => {
                        tracing::debug!(strategy = name, "Field cleared");
                        return Ok(Some(name));
                    }
                }
            } else {
                tracing::debug!(strategy = name, "Clear strategy rejected by device");
            }
        }

        tracing::warn!(field = %field.text, "Could not clear pre-filled field");
        Ok(None)
    }

    async fn tap(&self, point: Point) -> Result<bool, RunError> {
        self.perform(&DeviceOp::Tap { x: point.x, y: point.y }).await
    }

    /// `Ok(false)` when the device rejected the operation; transport errors
    /// that survive the retry are fatal.
    async fn perform(&self, op: &DeviceOp) -> Result<bool, RunError> {
        match retry_with_backoff(&self.device_retry, op.name(), || self.device.perform(op)).await {
            Ok(()) => Ok(true),
            Err(DeviceError::Rejected(reason)) => {
                tracing::debug!(op = op.name(), %reason, "Device rejected operation");
                Ok(false)
            }
            Err(source) => Err(RunError::Device {
                operation: op.name(),
                source,
            }),
        }
    }

    async fn capture(&self) -> Result<ObservableState, RunError> {
        retry_with_backoff(&self.device_retry, "capture_state", || self.device.capture_state())
            .await
            .map_err(|source| RunError::Device {
                operation: "capture_state",
                source,
            })
    }
}

/// The field being typed into: the editable element at `bounds`, else the
/// focused editable element.
fn locate_field(state: &ObservableState, bounds: Option<Bounds>) -> Option<&UiElement> {
    bounds
        .and_then(|b| {
            state
                .snapshot
                .elements
                .iter()
                .find(|e| e.is_editable() && e.bounds == b)
        })
        .or_else(|| state.snapshot.focused_editable())
}
