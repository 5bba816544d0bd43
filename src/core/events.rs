// Author: BlackIce Project
// License: MIT

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::error::{PlannerError, StepError};
use crate::core::plan::Plan;

/// Coarse classification of user engagement, derived from input timestamps
/// and resource use. Ordered: Idle < Light < Intensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Idle,
    Light,
    Intensive,
}

/// Outcome of the full safety consultation, not just the input-derived
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyVerdict {
    Safe,
    BlockedByActivity,
    BlockedByCriticalApp,
    BlockedByResources,
    BlockedByPresentation,
}

impl SafetyVerdict {
    pub fn is_safe(self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

/// What pulled the emergency brake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    Hotkey,
    Manual,
    IsolationBreach,
    Internal,
}

/// Classification of an isolation check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Display,
    Process,
    Window,
    Resource,
}

/// Condensed screen-analysis facts the orchestrator routes on. The full
/// `ScreenAnalysis` stays at the planner boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenSummary {
    /// Popup/dialog/notification/error elements the analysis did not expect.
    pub unexpected_elements: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenSnapshot {
    pub path: PathBuf,
    pub taken_ms: u64,
    pub summary: ScreenSummary,
}

/// Result of one step attempt, produced by the executor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutcome {
    pub ok: bool,
    pub output: Option<String>,
    pub error: Option<StepError>,
    pub screen_changed: Option<bool>,
    pub adaptation_hint: Option<String>,
}

impl StepOutcome {
    pub fn success(output: Option<String>) -> Self {
        Self {
            ok: true,
            output,
            ..Self::default()
        }
    }

    pub fn failure(error: StepError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Inputs to the pure orchestrator engine. The effect runtime feeds one of
/// these back for every effect it performed; control surfaces inject the
/// pause/resume/cancel family.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchEvent {
    IntentAccepted {
        now_ms: u64,
    },

    PlanReady {
        plan: Box<Plan>,
        now_ms: u64,
    },
    PlanFailed {
        error: PlannerError,
        now_ms: u64,
    },

    ScreenCaptured {
        snapshot: ScreenSnapshot,
        now_ms: u64,
    },
    ScreenCaptureFailed {
        detail: String,
        now_ms: u64,
    },

    StepFinished {
        index: usize,
        outcome: StepOutcome,
        now_ms: u64,
    },

    AdaptReady {
        plan: Box<Plan>,
        now_ms: u64,
    },
    AdaptFailed {
        error: PlannerError,
        now_ms: u64,
    },

    PauseRequested {
        now_ms: u64,
    },
    ResumeRequested {
        now_ms: u64,
    },
    CancelRequested {
        now_ms: u64,
    },

    /// Global emergency stop observed by this task.
    EmergencyStop {
        source: StopSource,
        now_ms: u64,
    },

    /// An isolation violation surfaced by the verifier while this task
    /// was running. Feeds the soft disrupt routing; the hard violation
    /// budget stays with the emergency stop.
    ViolationObserved {
        kind: ViolationKind,
        now_ms: u64,
    },
}

impl OrchEvent {
    pub fn now_ms(&self) -> u64 {
        match self {
            OrchEvent::IntentAccepted { now_ms }
            | OrchEvent::PlanReady { now_ms, .. }
            | OrchEvent::PlanFailed { now_ms, .. }
            | OrchEvent::ScreenCaptured { now_ms, .. }
            | OrchEvent::ScreenCaptureFailed { now_ms, .. }
            | OrchEvent::StepFinished { now_ms, .. }
            | OrchEvent::AdaptReady { now_ms, .. }
            | OrchEvent::AdaptFailed { now_ms, .. }
            | OrchEvent::PauseRequested { now_ms }
            | OrchEvent::ResumeRequested { now_ms }
            | OrchEvent::CancelRequested { now_ms }
            | OrchEvent::EmergencyStop { now_ms, .. }
            | OrchEvent::ViolationObserved { now_ms, .. } => *now_ms,
        }
    }
}

/// Lifecycle events fanned out to subscribers (UI, logs, tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    PlanReady { steps: usize },
    StepStarted { index: usize },
    StepCompleted { index: usize, ok: bool },
    PlanAdapted { reason: String },
    TaskCompleted { status: TerminalStatus, reason: Option<String> },
    ViolationDetected { kind: ViolationKind },
    EmergencyStop { source: StopSource },
    DisplayReady { id: String },
    DisplayLost { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
}
