// Author: BlackIce Project
// License: MIT

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure class of a single step attempt.
///
/// The orchestrator is the only place these become state transitions;
/// everything below it just reports the kind and a detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Permission guard refused. Non-retryable.
    PolicyDenied,

    /// Activity monitor vetoed. Retryable once the user goes quiet.
    NotSafe,

    /// Step exceeded its deadline. Retryable under policy.
    Timeout,

    /// FindElement yielded no match above threshold.
    TemplateNotFound,

    /// AI display missing or unresponsive.
    DisplayUnavailable,

    /// Cooperative cancel. Terminal.
    Cancelled,

    /// Bug class.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub detail: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            StepErrorKind::NotSafe | StepErrorKind::Timeout | StepErrorKind::DisplayUnavailable
        )
    }

    /// Whether a failed attempt should be answered with replanning rather
    /// than a blind retry.
    pub fn wants_adaptation(&self) -> bool {
        matches!(self.kind, StepErrorKind::TemplateNotFound)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepErrorKind::PolicyDenied => write!(f, "policy denied: {}", self.detail),
            StepErrorKind::NotSafe => write!(f, "not safe: {}", self.detail),
            StepErrorKind::Timeout => write!(f, "timed out: {}", self.detail),
            StepErrorKind::TemplateNotFound => write!(f, "template not found: {}", self.detail),
            StepErrorKind::DisplayUnavailable => write!(f, "display unavailable: {}", self.detail),
            StepErrorKind::Cancelled => write!(f, "cancelled: {}", self.detail),
            StepErrorKind::Internal => write!(f, "internal error: {}", self.detail),
        }
    }
}

impl std::error::Error for StepError {}

/// Façade-level planner failures. Fatal for `plan`, treated as
/// CannotRecover for `adapt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    /// Backend unreachable or refused the call.
    Unavailable(String),

    /// Output failed schema validation.
    Malformed(String),

    /// Per-call deadline expired.
    Timeout,

    /// The planner signalled it cannot produce a recovery plan.
    CannotRecover,
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::Unavailable(d) => write!(f, "planner unavailable: {d}"),
            PlannerError::Malformed(d) => write!(f, "planner output malformed: {d}"),
            PlannerError::Timeout => write!(f, "planner call timed out"),
            PlannerError::CannotRecover => write!(f, "planner cannot recover"),
        }
    }
}

impl std::error::Error for PlannerError {}

/// An event was rejected because it is invalid in the current task state.
///
/// Examples:
/// - resume while not paused
/// - pause on a terminal task
/// - intent delivered twice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    AlreadyPaused,
    NotPaused,
    TaskTerminal,
    UnexpectedEvent(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AlreadyPaused => write!(f, "already paused"),
            EngineError::NotPaused => write!(f, "not paused"),
            EngineError::TaskTerminal => write!(f, "task already terminal"),
            EngineError::UnexpectedEvent(what) => write!(f, "unexpected event: {what}"),
        }
    }
}

impl std::error::Error for EngineError {}
