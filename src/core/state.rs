// Author: BlackIce Project
// License: MIT

use std::collections::VecDeque;

use serde::Serialize;

use crate::core::error::StepError;
use crate::core::events::{ScreenSnapshot, TerminalStatus};
use crate::core::plan::Plan;

/// Errors kept for adaptation context; older ones only bump the counter.
const ERROR_BACKLOG: usize = 32;

/// Window the disrupt routing counts isolation violations over.
const VIOLATION_WINDOW_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Adapting,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn terminal(self) -> Option<TerminalStatus> {
        match self {
            TaskStatus::Completed => Some(TerminalStatus::Completed),
            TaskStatus::Failed => Some(TerminalStatus::Failed),
            TaskStatus::Cancelled => Some(TerminalStatus::Cancelled),
            _ => None,
        }
    }
}

/// Position in the plan state machine between two engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    CaptureScreen,
    ExecuteStep,
    Adapt,
    Done,
}

/// Per-task execution state. Owned exclusively by one orchestrator; lives
/// from intent accepted to terminal event emitted.
#[derive(Debug, Clone)]
pub struct TaskExec {
    pub task_id: String,
    pub intent: String,

    plan: Option<Plan>,
    cursor: usize,
    retries_for_cursor: u32,

    status: TaskStatus,
    phase: Phase,
    paused_from: Option<Phase>,

    adaptation_count: u32,
    errors: VecDeque<StepError>,
    error_total: u32,
    capture_failures: u32,

    /// Timestamps of violations the verifier observed for this task.
    recent_violations: VecDeque<u64>,

    /// Adapt forced by the error-rate ratio; consumed at the next route.
    adapt_pending: Option<String>,

    /// Reason for the adaptation currently in flight.
    adapt_reason: Option<String>,

    last_screen: Option<ScreenSnapshot>,
    pub timings_ms: Vec<u64>,
    step_started_ms: u64,

    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

impl TaskExec {
    pub fn new(task_id: String, intent: String, now_ms: u64) -> Self {
        Self {
            task_id,
            intent,
            plan: None,
            cursor: 0,
            retries_for_cursor: 0,
            status: TaskStatus::Pending,
            phase: Phase::Idle,
            paused_from: None,
            adaptation_count: 0,
            errors: VecDeque::new(),
            error_total: 0,
            capture_failures: 0,
            recent_violations: VecDeque::new(),
            adapt_pending: None,
            adapt_reason: None,
            last_screen: None,
            timings_ms: Vec::new(),
            step_started_ms: now_ms,
            start_ms: now_ms,
            end_ms: None,
            failure_reason: None,
        }
    }

    // ---------------- accessors ----------------

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn retries_for_cursor(&self) -> u32 {
        self.retries_for_cursor
    }

    pub fn adaptation_count(&self) -> u32 {
        self.adaptation_count
    }

    pub fn error_total(&self) -> u32 {
        self.error_total
    }

    pub fn capture_failures(&self) -> u32 {
        self.capture_failures
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &StepError> {
        self.errors.iter()
    }

    pub fn last_screen(&self) -> Option<&ScreenSnapshot> {
        self.last_screen.as_ref()
    }

    pub fn steps_len(&self) -> usize {
        self.plan.as_ref().map_or(0, |p| p.steps.len())
    }

    pub fn adapt_pending(&self) -> Option<&str> {
        self.adapt_pending.as_deref()
    }

    /// Cumulative errors over executed steps. Uses `max(cursor, 1)` so a
    /// first-step failure alone trips the retry bound, not this ratio.
    pub fn error_rate(&self) -> f32 {
        self.error_total as f32 / self.cursor.max(1) as f32
    }

    /// Violations inside the disrupt window.
    pub fn violations_in_window(&self, now_ms: u64) -> u32 {
        self.recent_violations
            .iter()
            .filter(|&&ts| now_ms.saturating_sub(ts) <= VIOLATION_WINDOW_MS)
            .count() as u32
    }

    // ---------------- transitions (engine-internal) ----------------

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn set_plan(&mut self, plan: Plan) {
        self.plan = Some(plan);
    }

    pub(crate) fn plan_mut(&mut self) -> Option<&mut Plan> {
        self.plan.as_mut()
    }

    pub(crate) fn set_screen(&mut self, snapshot: ScreenSnapshot) {
        self.capture_failures = 0;
        self.last_screen = Some(snapshot);
    }

    pub(crate) fn note_capture_failure(&mut self) -> u32 {
        self.capture_failures += 1;
        self.capture_failures
    }

    pub(crate) fn note_violation(&mut self, now_ms: u64) {
        while let Some(&front) = self.recent_violations.front() {
            if now_ms.saturating_sub(front) > VIOLATION_WINDOW_MS {
                self.recent_violations.pop_front();
            } else {
                break;
            }
        }
        self.recent_violations.push_back(now_ms);
    }

    pub(crate) fn begin_step(&mut self, now_ms: u64) {
        self.step_started_ms = now_ms;
    }

    pub(crate) fn advance_cursor(&mut self, now_ms: u64) {
        self.timings_ms
            .push(now_ms.saturating_sub(self.step_started_ms));
        self.cursor += 1;
        self.retries_for_cursor = 0;
    }

    pub(crate) fn bump_retry(&mut self) -> u32 {
        self.retries_for_cursor += 1;
        self.retries_for_cursor
    }

    pub(crate) fn push_error(&mut self, err: StepError) {
        self.error_total += 1;
        if self.errors.len() == ERROR_BACKLOG {
            self.errors.pop_front();
        }
        self.errors.push_back(err);
    }

    pub(crate) fn force_adapt(&mut self, reason: impl Into<String>) {
        self.adapt_pending = Some(reason.into());
    }

    pub(crate) fn take_adapt_pending(&mut self) -> Option<String> {
        self.adapt_pending.take()
    }

    pub(crate) fn set_adapt_reason(&mut self, reason: String) {
        self.adapt_reason = Some(reason);
    }

    pub(crate) fn take_adapt_reason(&mut self) -> Option<String> {
        self.adapt_reason.take()
    }

    /// Splice an adapted tail in. `cursor` is clamped into the new index
    /// range; it never moves forward past work that has not run.
    pub(crate) fn apply_adaptation(&mut self, tail: Vec<crate::core::plan::Step>) {
        let cut = self.cursor;
        if let Some(plan) = self.plan.as_mut() {
            plan.splice_tail(cut, tail);
            self.cursor = self.cursor.min(plan.steps.len());
        }
        self.adaptation_count += 1;
        self.retries_for_cursor = 0;
    }

    pub(crate) fn pause(&mut self) {
        self.paused_from = Some(self.phase);
        self.status = TaskStatus::Paused;
    }

    /// Returns the phase execution resumes into.
    pub(crate) fn resume(&mut self) -> Phase {
        let prior = self.paused_from.take().unwrap_or(self.phase);
        self.phase = prior;
        self.status = match prior {
            Phase::Adapt => TaskStatus::Adapting,
            _ => TaskStatus::Running,
        };
        prior
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.status == TaskStatus::Paused
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, now_ms: u64, reason: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.phase = Phase::Done;
        self.end_ms = Some(now_ms);
        self.failure_reason = reason;
    }
}
