//! Typed error hierarchy for qa-pilot.
//!
//! - `ErrorKind`: the machine-readable reason attached to records and results
//! - `ReasoningError`: failures of the reasoning/vision collaborator
//! - `DeviceError`: failures of the device-control collaborator
//! - `ActionParseError`: reasoning output that does not fit the action schema
//! - `RunError`: fatal conditions that end a run with status ERROR

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error reasons.
///
/// Serialized in SCREAMING_SNAKE_CASE so persisted records and run results
/// carry the same strings the error table uses (`ELEMENT_NOT_FOUND`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PlannerInvalidOutput,
    SupervisorInvalidOutput,
    ElementNotFound,
    FieldNotCleared,
    RateLimit,
    CollaboratorUnavailable,
    StuckLoop,
    MaxStepsReached,
    DeviceError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PlannerInvalidOutput => "PLANNER_INVALID_OUTPUT",
            ErrorKind::SupervisorInvalidOutput => "SUPERVISOR_INVALID_OUTPUT",
            ErrorKind::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorKind::FieldNotCleared => "FIELD_NOT_CLEARED",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::CollaboratorUnavailable => "COLLABORATOR_UNAVAILABLE",
            ErrorKind::StuckLoop => "STUCK_LOOP",
            ErrorKind::MaxStepsReached => "MAX_STEPS_REACHED",
            ErrorKind::DeviceError => "DEVICE_ERROR",
        }
    }

    /// Whether this kind terminates the run when it surfaces.
    ///
    /// Step-level kinds (`ELEMENT_NOT_FOUND`, `FIELD_NOT_CLEARED`) only land in
    /// the action history. Collaborator and device kinds are fatal once their
    /// retry budget is spent, which is the only way they reach a result.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::ElementNotFound | ErrorKind::FieldNotCleared)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a retry policy can classify and synthesize on timeout.
pub trait Retryable: Sized {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// Error to report when one attempt exceeds the policy timeout.
    fn timed_out(after: Duration) -> Self;

    /// Minimum wait the remote side asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Errors from the reasoning/vision collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReasoningError {
    #[error("Reasoning service rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Reasoning call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Reasoning service unavailable: {0}")]
    Unavailable(String),

    #[error("Reasoning service rejected the request: {0}")]
    Rejected(String),
}

impl ReasoningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReasoningError::RateLimited { .. } => ErrorKind::RateLimit,
            _ => ErrorKind::CollaboratorUnavailable,
        }
    }
}

impl Retryable for ReasoningError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ReasoningError::Rejected(_))
    }

    fn timed_out(after: Duration) -> Self {
        ReasoningError::Timeout(after)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ReasoningError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors from the device-control collaborator.
///
/// `Rejected` means the device answered but the operation did not take effect
/// (a resolution tier treats it as "this tier failed"). The other variants are
/// transport problems that are retried once and then end the run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("Device rejected the operation: {0}")]
    Rejected(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Device operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for DeviceError {
    fn is_retryable(&self) -> bool {
        !matches!(self, DeviceError::Rejected(_))
    }

    fn timed_out(after: Duration) -> Self {
        DeviceError::Timeout(after)
    }
}

/// Reasoning output that could not be turned into a valid `Action`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionParseError {
    #[error("No JSON object found in reasoning output")]
    NoJson,

    #[error("Action JSON does not match the schema: {0}")]
    Schema(String),

    #[error("Invalid {kind} action: {message}")]
    Invalid { kind: String, message: String },
}

/// Fatal run conditions. Each maps to exactly one `ErrorKind`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Planner produced invalid output {attempts} times: {last}")]
    PlannerInvalidOutput {
        attempts: u32,
        #[source]
        last: ActionParseError,
    },

    #[error("Supervisor answer is not a PASS/FAIL verdict: {reason}")]
    SupervisorInvalidOutput { reason: String },

    #[error("Reasoning collaborator failed during {operation}: {source}")]
    Reasoning {
        operation: &'static str,
        #[source]
        source: ReasoningError,
    },

    #[error("Device collaborator failed during {operation}: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: DeviceError,
    },
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::PlannerInvalidOutput { .. } => ErrorKind::PlannerInvalidOutput,
            RunError::SupervisorInvalidOutput { .. } => ErrorKind::SupervisorInvalidOutput,
            RunError::Reasoning { source, .. } => source.kind(),
            RunError::Device { .. } => ErrorKind::DeviceError,
        }
    }
}
