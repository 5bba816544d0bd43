// Author: BlackIce Project
// License: MIT

use crate::core::{
    effect::Effect,
    error::{EngineError, PlannerError, StepError, StepErrorKind},
    events::{EventKind, OrchEvent, StepOutcome, TerminalStatus},
    state::{Phase, TaskExec, TaskStatus},
};

use super::Orchestrator;

impl Orchestrator {
    pub fn handle_event(
        &self,
        exec: &mut TaskExec,
        event: OrchEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        let now_ms = event.now_ms();

        if exec.status().is_terminal() {
            // Late cancels, emergency observations, and violation reports
            // are deduplicated or absorbed, not errors; everything else
            // arriving after the terminal event is.
            return match event {
                OrchEvent::CancelRequested { .. }
                | OrchEvent::EmergencyStop { .. }
                | OrchEvent::ViolationObserved { .. } => Ok(vec![]),
                _ => Err(EngineError::TaskTerminal),
            };
        }

        if exec.is_paused() {
            return match event {
                OrchEvent::ResumeRequested { .. } => {
                    exec.resume();
                    Ok(vec![])
                }
                OrchEvent::CancelRequested { .. } => Ok(self.cancel(exec, now_ms, None)),
                OrchEvent::EmergencyStop { source, .. } => {
                    Ok(self.cancel(exec, now_ms, Some(format!("emergency_stop:{source:?}"))))
                }
                OrchEvent::ViolationObserved { .. } => {
                    exec.note_violation(now_ms);
                    Ok(vec![])
                }
                OrchEvent::PauseRequested { .. } => Err(EngineError::AlreadyPaused),
                _ => Err(EngineError::UnexpectedEvent("event while paused")),
            };
        }

        match event {
            OrchEvent::IntentAccepted { .. } => {
                if exec.phase() != Phase::Idle {
                    return Err(EngineError::UnexpectedEvent("intent delivered twice"));
                }
                exec.set_status(TaskStatus::Running);
                exec.set_phase(Phase::Planning);
                Ok(vec![Effect::Emit(EventKind::TaskStarted), Effect::RequestPlan])
            }

            OrchEvent::PlanReady { plan, .. } => {
                if exec.phase() != Phase::Planning {
                    return Err(EngineError::UnexpectedEvent("plan outside Planning"));
                }
                if let Err(e) = plan.validate() {
                    return Ok(self.fail(exec, now_ms, format!("planner_malformed: {e}")));
                }
                let steps = plan.steps.len();
                exec.set_plan(*plan);
                exec.set_phase(Phase::CaptureScreen);
                Ok(vec![
                    Effect::Emit(EventKind::PlanReady { steps }),
                    Effect::CaptureScreen,
                ])
            }

            OrchEvent::PlanFailed { error, .. } => {
                Ok(self.fail(exec, now_ms, planner_reason(&error)))
            }

            OrchEvent::ScreenCaptured { snapshot, .. } => {
                if exec.phase() != Phase::CaptureScreen {
                    return Err(EngineError::UnexpectedEvent("capture outside CaptureScreen"));
                }
                exec.set_screen(snapshot);
                Ok(self.route(exec, now_ms))
            }

            OrchEvent::ScreenCaptureFailed { detail, .. } => {
                if exec.phase() != Phase::CaptureScreen {
                    return Err(EngineError::UnexpectedEvent("capture outside CaptureScreen"));
                }
                let failures = exec.note_capture_failure();
                if failures <= self.limits.max_capture_failures {
                    return Ok(vec![Effect::CaptureScreen]);
                }
                exec.push_error(StepError::new(StepErrorKind::DisplayUnavailable, detail));
                Ok(self.fail(exec, now_ms, "display_unavailable".to_string()))
            }

            OrchEvent::StepFinished { index, outcome, .. } => {
                if exec.phase() != Phase::ExecuteStep || index != exec.cursor() {
                    return Err(EngineError::UnexpectedEvent("stale step result"));
                }
                Ok(self.after_step(exec, index, outcome, now_ms))
            }

            OrchEvent::AdaptReady { plan, .. } => {
                if exec.phase() != Phase::Adapt {
                    return Err(EngineError::UnexpectedEvent("adaptation outside Adapt"));
                }
                Ok(self.after_adapt(exec, *plan, now_ms))
            }

            OrchEvent::AdaptFailed { error, .. } => {
                if exec.phase() != Phase::Adapt {
                    return Err(EngineError::UnexpectedEvent("adaptation outside Adapt"));
                }
                Ok(self.fail(exec, now_ms, planner_reason(&error)))
            }

            OrchEvent::PauseRequested { .. } => {
                exec.pause();
                Ok(vec![])
            }

            OrchEvent::ResumeRequested { .. } => Err(EngineError::NotPaused),

            OrchEvent::CancelRequested { .. } => Ok(self.cancel(exec, now_ms, None)),

            OrchEvent::EmergencyStop { source, .. } => {
                Ok(self.cancel(exec, now_ms, Some(format!("emergency_stop:{source:?}"))))
            }

            OrchEvent::ViolationObserved { .. } => {
                exec.note_violation(now_ms);
                Ok(vec![])
            }
        }
    }

    // ---------------- routing ----------------

    /// RouteDecision: runs right after every successful screen capture.
    fn route(&self, exec: &mut TaskExec, now_ms: u64) -> Vec<Effect> {
        if let Some(reason) = exec.take_adapt_pending() {
            return self.begin_adapt(exec, now_ms, reason);
        }

        if exec.cursor() >= exec.steps_len() {
            return self.complete(exec, now_ms);
        }

        // "disrupt": isolation violation rate above the soft floor OR
        // unexpected UI elements on screen, AND the current step already
        // burned at least one retry.
        let screen_disrupted = exec
            .last_screen()
            .map(|s| !s.summary.unexpected_elements.is_empty())
            .unwrap_or(false);
        let violations_high = self.limits.disrupt_violation_floor > 0
            && exec.violations_in_window(now_ms) >= self.limits.disrupt_violation_floor;
        if (screen_disrupted || violations_high) && exec.retries_for_cursor() >= 1 {
            let reason = if violations_high {
                "isolation violations during execution"
            } else {
                "screen disruption"
            };
            return self.begin_adapt(exec, now_ms, reason.to_string());
        }

        let cursor = exec.cursor();
        exec.begin_step(now_ms);
        exec.set_phase(Phase::ExecuteStep);
        vec![
            Effect::Emit(EventKind::StepStarted { index: cursor }),
            Effect::ExecuteStep {
                index: cursor,
                delay_ms: 0,
            },
        ]
    }

    // ---------------- step results ----------------

    fn after_step(
        &self,
        exec: &mut TaskExec,
        index: usize,
        outcome: StepOutcome,
        now_ms: u64,
    ) -> Vec<Effect> {
        if outcome.ok {
            let mut effects = vec![Effect::Emit(EventKind::StepCompleted { index, ok: true })];

            // Verify: a step that promised a visible change but produced
            // none is stuck; anything else advances.
            let expected_change = exec
                .plan()
                .and_then(|p| p.steps.get(index))
                .map(|s| s.expected_screen_change.is_some())
                .unwrap_or(false);
            if expected_change && outcome.screen_changed == Some(false) {
                effects.extend(self.begin_adapt(
                    exec,
                    now_ms,
                    "expected screen change did not occur".to_string(),
                ));
                return effects;
            }

            exec.advance_cursor(now_ms);
            if exec.error_rate() > self.error_rate_ceiling {
                exec.force_adapt("high error rate");
            }
            exec.set_phase(Phase::CaptureScreen);
            effects.push(Effect::CaptureScreen);
            return effects;
        }

        let err = outcome
            .error
            .unwrap_or_else(|| StepError::new(StepErrorKind::Internal, "missing step error"));

        let mut effects = vec![Effect::Emit(EventKind::StepCompleted { index, ok: false })];

        if err.kind == StepErrorKind::Cancelled {
            effects.extend(self.cancel(exec, now_ms, Some(err.detail)));
            return effects;
        }

        exec.push_error(err.clone());

        // Immediate in-place retry, bounded by the step's own policy and
        // the global cap.
        let step_bound = exec
            .plan()
            .and_then(|p| p.steps.get(index))
            .map(|s| s.retry_policy.max_attempts())
            .unwrap_or(0);
        let retryable = err.retryable() || err.wants_adaptation();
        if retryable
            && exec.retries_for_cursor() < step_bound
            && exec.retries_for_cursor() < self.limits.max_retries
        {
            let attempt = exec.bump_retry();
            let delay_ms = exec
                .plan()
                .and_then(|p| p.steps.get(index))
                .map(|s| s.retry_policy.delay_for(attempt).as_millis() as u64)
                .unwrap_or(0);
            effects.push(Effect::Emit(EventKind::StepStarted { index }));
            effects.push(Effect::ExecuteStep { index, delay_ms });
            return effects;
        }

        effects.extend(self.handle_error(exec, err, now_ms));
        effects
    }

    /// HandleError: retry via a fresh capture, adapt, or fail.
    fn handle_error(&self, exec: &mut TaskExec, err: StepError, now_ms: u64) -> Vec<Effect> {
        match err.kind {
            // Blind retries cannot fix these; adaptation must not be used
            // to route around policy or user activity.
            StepErrorKind::PolicyDenied => self.fail(exec, now_ms, format!("policy_denied: {}", err.detail)),
            StepErrorKind::NotSafe => {
                if exec.retries_for_cursor() < self.limits.max_retries {
                    exec.bump_retry();
                    exec.set_phase(Phase::CaptureScreen);
                    return vec![Effect::CaptureScreen];
                }
                self.fail(exec, now_ms, "not_safe".to_string())
            }
            StepErrorKind::TemplateNotFound => {
                self.begin_adapt(exec, now_ms, format!("template not found: {}", err.detail))
            }
            StepErrorKind::Timeout => {
                if exec.retries_for_cursor() < self.limits.max_retries {
                    exec.bump_retry();
                    exec.set_phase(Phase::CaptureScreen);
                    return vec![Effect::CaptureScreen];
                }
                self.begin_adapt(exec, now_ms, "step kept timing out".to_string())
            }
            StepErrorKind::DisplayUnavailable => {
                self.fail(exec, now_ms, "display_unavailable".to_string())
            }
            StepErrorKind::Cancelled => self.cancel(exec, now_ms, Some(err.detail)),
            StepErrorKind::Internal => self.fail(exec, now_ms, format!("internal: {}", err.detail)),
        }
    }

    // ---------------- adaptation ----------------

    fn begin_adapt(&self, exec: &mut TaskExec, now_ms: u64, reason: String) -> Vec<Effect> {
        if exec.adaptation_count() >= self.limits.max_adaptations {
            return self.fail(exec, now_ms, "adaptation limit exceeded".to_string());
        }
        exec.set_status(TaskStatus::Adapting);
        exec.set_phase(Phase::Adapt);
        exec.set_adapt_reason(reason.clone());
        vec![Effect::RequestAdaptation { reason }]
    }

    fn after_adapt(&self, exec: &mut TaskExec, plan: crate::core::plan::Plan, now_ms: u64) -> Vec<Effect> {
        let reason = exec
            .take_adapt_reason()
            .unwrap_or_else(|| "adaptation".to_string());

        exec.apply_adaptation(plan.steps);

        // The splice may introduce id collisions with the completed prefix;
        // that is the planner's malformation, not ours.
        if let Some(plan) = exec.plan() {
            if let Err(e) = plan.validate() {
                return self.fail(exec, now_ms, format!("planner_malformed: {e}"));
            }
        }

        exec.set_status(TaskStatus::Running);
        exec.set_phase(Phase::CaptureScreen);
        vec![
            Effect::Emit(EventKind::PlanAdapted { reason }),
            Effect::CaptureScreen,
        ]
    }

    // ---------------- terminal transitions ----------------

    fn complete(&self, exec: &mut TaskExec, now_ms: u64) -> Vec<Effect> {
        exec.finish(TaskStatus::Completed, now_ms, None);
        vec![Effect::Emit(EventKind::TaskCompleted {
            status: TerminalStatus::Completed,
            reason: None,
        })]
    }

    fn fail(&self, exec: &mut TaskExec, now_ms: u64, reason: String) -> Vec<Effect> {
        exec.finish(TaskStatus::Failed, now_ms, Some(reason.clone()));
        vec![Effect::Emit(EventKind::TaskCompleted {
            status: TerminalStatus::Failed,
            reason: Some(reason),
        })]
    }

    fn cancel(&self, exec: &mut TaskExec, now_ms: u64, reason: Option<String>) -> Vec<Effect> {
        exec.finish(TaskStatus::Cancelled, now_ms, reason.clone());
        vec![Effect::Emit(EventKind::TaskCompleted {
            status: TerminalStatus::Cancelled,
            reason,
        })]
    }
}

fn planner_reason(error: &PlannerError) -> String {
    match error {
        PlannerError::Unavailable(d) => format!("planner_unavailable: {d}"),
        PlannerError::Malformed(d) => format!("planner_malformed: {d}"),
        PlannerError::Timeout => "planner_unavailable: timeout".to_string(),
        PlannerError::CannotRecover => "planner_cannot_recover".to_string(),
    }
}
