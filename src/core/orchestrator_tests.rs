// Author: BlackIce Project
// License: MIT

use chrono::Utc;

use crate::core::action::Action;
use crate::core::effect::Effect;
use crate::core::error::{EngineError, PlannerError, StepError, StepErrorKind};
use crate::core::events::{
    EventKind, OrchEvent, ScreenSnapshot, ScreenSummary, StepOutcome, TerminalStatus,
    ViolationKind,
};
use crate::core::orchestrator::{Limits, Orchestrator};
use crate::core::plan::{Plan, RetryPolicy, Step};
use crate::core::state::{TaskExec, TaskStatus};

fn step(id: &str, order: u32, action: Action, retry: RetryPolicy) -> Step {
    Step {
        id: id.to_string(),
        order,
        description: id.to_string(),
        action,
        pre_conditions: vec![],
        post_conditions: vec![],
        timeout_ms: 5_000,
        retry_policy: retry,
        fallback_step_id: None,
        expected_screen_change: None,
    }
}

fn plan_with(steps: Vec<Step>) -> Plan {
    Plan {
        task_id: "t-1".to_string(),
        intent: "test".to_string(),
        steps,
        contingencies: Default::default(),
        success_criterion: "done".to_string(),
        confidence: 0.9,
        created_at: Utc::now(),
    }
}

fn open_app(id: &str, order: u32) -> Step {
    step(
        id,
        order,
        Action::OpenApplication {
            alias: "calculator".to_string(),
        },
        RetryPolicy::None,
    )
}

fn snapshot(unexpected: Vec<&str>) -> ScreenSnapshot {
    ScreenSnapshot {
        path: "/tmp/shot.png".into(),
        taken_ms: 0,
        summary: ScreenSummary {
            unexpected_elements: unexpected.into_iter().map(String::from).collect(),
            confidence: 0.9,
        },
    }
}

fn fresh(orch: &Orchestrator) -> TaskExec {
    let mut exec = TaskExec::new("t-1".to_string(), "test".to_string(), 0);
    let fx = orch
        .handle_event(&mut exec, OrchEvent::IntentAccepted { now_ms: 0 })
        .unwrap();
    assert!(fx.contains(&Effect::RequestPlan));
    exec
}

fn deliver_plan(orch: &Orchestrator, exec: &mut TaskExec, plan: Plan) -> Vec<Effect> {
    orch.handle_event(
        exec,
        OrchEvent::PlanReady {
            plan: Box::new(plan),
            now_ms: 1,
        },
    )
    .unwrap()
}

fn captured(orch: &Orchestrator, exec: &mut TaskExec, now_ms: u64) -> Vec<Effect> {
    orch.handle_event(
        exec,
        OrchEvent::ScreenCaptured {
            snapshot: snapshot(vec![]),
            now_ms,
        },
    )
    .unwrap()
}

fn step_ok(orch: &Orchestrator, exec: &mut TaskExec, index: usize, now_ms: u64) -> Vec<Effect> {
    orch.handle_event(
        exec,
        OrchEvent::StepFinished {
            index,
            outcome: StepOutcome::success(None),
            now_ms,
        },
    )
    .unwrap()
}

fn step_err(
    orch: &Orchestrator,
    exec: &mut TaskExec,
    index: usize,
    kind: StepErrorKind,
    now_ms: u64,
) -> Vec<Effect> {
    orch.handle_event(
        exec,
        OrchEvent::StepFinished {
            index,
            outcome: StepOutcome::failure(StepError::new(kind, "boom")),
            now_ms,
        },
    )
    .unwrap()
}

fn emitted(effects: &[Effect]) -> Vec<&EventKind> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Emit(k) => Some(k),
            _ => None,
        })
        .collect()
}

fn terminal_of(effects: &[Effect]) -> Option<TerminalStatus> {
    emitted(effects).into_iter().find_map(|k| match k {
        EventKind::TaskCompleted { status, .. } => Some(*status),
        _ => None,
    })
}

#[test]
fn happy_path_single_step_completes() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);

    let fx = deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));
    assert!(fx.contains(&Effect::CaptureScreen));

    let fx = captured(&orch, &mut exec, 10);
    assert!(fx.contains(&Effect::ExecuteStep {
        index: 0,
        delay_ms: 0
    }));
    assert!(emitted(&fx)
        .iter()
        .any(|k| matches!(k, EventKind::StepStarted { index: 0 })));

    let fx = step_ok(&orch, &mut exec, 0, 20);
    assert!(fx.contains(&Effect::CaptureScreen));
    assert_eq!(exec.cursor(), 1);

    let fx = captured(&orch, &mut exec, 30);
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Completed));
    assert_eq!(exec.status(), TaskStatus::Completed);
    assert_eq!(exec.cursor(), exec.steps_len());
}

#[test]
fn plan_failure_is_terminal() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);

    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::PlanFailed {
                error: PlannerError::Unavailable("down".to_string()),
                now_ms: 1,
            },
        )
        .unwrap();
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert!(exec.failure_reason.as_deref().unwrap().starts_with("planner_unavailable"));
}

#[test]
fn structurally_invalid_plan_fails_at_ingestion() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);

    // Duplicate ids.
    let fx = deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("dup", 1), open_app("dup", 2)]),
    );
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
}

#[test]
fn policy_denial_fails_without_retry() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("s1", 1), open_app("s2", 2)]),
    );
    captured(&orch, &mut exec, 10);

    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::PolicyDenied, 20);
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert!(exec.failure_reason.as_deref().unwrap().starts_with("policy_denied"));
    // Executor is never asked again.
    assert!(!fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));
}

#[test]
fn not_safe_retries_then_fails_with_not_safe() {
    let limits = Limits {
        max_retries: 2,
        ..Limits::default()
    };
    let orch = Orchestrator::new(limits);
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));

    for attempt in 0..2u32 {
        captured(&orch, &mut exec, 10 + u64::from(attempt));
        let fx = step_err(&orch, &mut exec, 0, StepErrorKind::NotSafe, 20);
        assert!(fx.contains(&Effect::CaptureScreen), "retry via fresh capture");
        assert_eq!(exec.retries_for_cursor(), attempt + 1);
    }

    captured(&orch, &mut exec, 30);
    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::NotSafe, 40);
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert_eq!(exec.failure_reason.as_deref(), Some("not_safe"));
}

#[test]
fn template_not_found_retries_in_place_then_adapts() {
    let orch = Orchestrator::new(Limits {
        max_retries: 2,
        ..Limits::default()
    });
    let mut exec = fresh(&orch);
    let click = step(
        "s1",
        1,
        Action::Click {
            x: 10,
            y: 10,
            button: crate::core::action::MouseButton::Left,
        },
        RetryPolicy::Fixed { attempts: 2 },
    );
    deliver_plan(&orch, &mut exec, plan_with(vec![click]));
    captured(&orch, &mut exec, 10);

    // Two in-place retries per the step policy.
    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::TemplateNotFound, 20);
    assert!(fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));
    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::TemplateNotFound, 30);
    assert!(fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));

    // Third failure exhausts the bound and asks for adaptation.
    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::TemplateNotFound, 40);
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));
    assert_eq!(exec.status(), TaskStatus::Adapting);
}

#[test]
fn adaptation_splices_tail_and_emits_once() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("s1", 1), open_app("s2", 2)]),
    );
    captured(&orch, &mut exec, 10);
    step_ok(&orch, &mut exec, 0, 20);
    captured(&orch, &mut exec, 30);

    // Second step keeps missing its template.
    let fx = step_err(&orch, &mut exec, 1, StepErrorKind::TemplateNotFound, 40);
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));

    let tail = plan_with(vec![open_app("r1", 10), open_app("r2", 11), open_app("r3", 12)]);
    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::AdaptReady {
                plan: Box::new(tail),
                now_ms: 50,
            },
        )
        .unwrap();

    let adapted: Vec<_> = emitted(&fx)
        .into_iter()
        .filter(|k| matches!(k, EventKind::PlanAdapted { .. }))
        .collect();
    assert_eq!(adapted.len(), 1);
    assert_eq!(exec.adaptation_count(), 1);
    // Completed prefix kept, tail replaced, cursor untouched.
    assert_eq!(exec.steps_len(), 4);
    assert_eq!(exec.cursor(), 1);
    assert_eq!(exec.status(), TaskStatus::Running);
}

#[test]
fn adaptation_cap_fails_task() {
    let orch = Orchestrator::new(Limits {
        max_adaptations: 0,
        ..Limits::default()
    });
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));
    captured(&orch, &mut exec, 10);

    let fx = step_err(&orch, &mut exec, 0, StepErrorKind::TemplateNotFound, 20);
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert_eq!(
        exec.failure_reason.as_deref(),
        Some("adaptation limit exceeded")
    );
}

#[test]
fn cannot_recover_fails_task() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));
    captured(&orch, &mut exec, 10);
    step_err(&orch, &mut exec, 0, StepErrorKind::TemplateNotFound, 20);

    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::AdaptFailed {
                error: PlannerError::CannotRecover,
                now_ms: 30,
            },
        )
        .unwrap();
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert_eq!(exec.failure_reason.as_deref(), Some("planner_cannot_recover"));
}

#[test]
fn disruption_routes_to_adapt_only_after_a_retry() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));

    // First capture with a popup: no retries burned yet, still executes.
    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::ScreenCaptured {
                snapshot: snapshot(vec!["popup"]),
                now_ms: 10,
            },
        )
        .unwrap();
    assert!(fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));

    // Burn a retry, then a disrupted capture forces adaptation.
    step_err(&orch, &mut exec, 0, StepErrorKind::Timeout, 20);
    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::ScreenCaptured {
                snapshot: snapshot(vec!["popup"]),
                now_ms: 30,
            },
        )
        .unwrap();
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));
}

fn violation(orch: &Orchestrator, exec: &mut TaskExec, now_ms: u64) {
    let fx = orch
        .handle_event(
            exec,
            OrchEvent::ViolationObserved {
                kind: ViolationKind::Display,
                now_ms,
            },
        )
        .unwrap();
    assert!(fx.is_empty());
}

#[test]
fn violation_rate_routes_to_adapt_after_a_retry() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("s1", 1), open_app("s2", 2)]),
    );
    captured(&orch, &mut exec, 10);

    // Burn one retry, then watch the isolation window turn noisy.
    step_err(&orch, &mut exec, 0, StepErrorKind::Timeout, 20);
    violation(&orch, &mut exec, 30);
    violation(&orch, &mut exec, 31);
    assert_eq!(exec.violations_in_window(40), 2);

    let fx = captured(&orch, &mut exec, 40);
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));
}

#[test]
fn violations_without_a_retry_do_not_disrupt() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));

    for now in [5u64, 6, 7] {
        violation(&orch, &mut exec, now);
    }

    // First attempt has no retries burned, so execution proceeds.
    let fx = captured(&orch, &mut exec, 10);
    assert!(fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));
}

#[test]
fn stale_violations_fall_out_of_the_window() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));
    captured(&orch, &mut exec, 10);

    violation(&orch, &mut exec, 11);
    violation(&orch, &mut exec, 12);
    step_err(&orch, &mut exec, 0, StepErrorKind::Timeout, 20);

    // Half a minute later the window is clean again.
    let fx = captured(&orch, &mut exec, 40_000);
    assert_eq!(exec.violations_in_window(40_000), 0);
    assert!(fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));
}

#[test]
fn pause_resume_returns_to_same_state() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("s1", 1), open_app("s2", 2)]),
    );
    captured(&orch, &mut exec, 10);
    step_ok(&orch, &mut exec, 0, 20);

    let phase = exec.phase();
    let cursor = exec.cursor();
    let retries = exec.retries_for_cursor();

    let fx = orch
        .handle_event(&mut exec, OrchEvent::PauseRequested { now_ms: 30 })
        .unwrap();
    assert!(fx.is_empty());
    assert_eq!(exec.status(), TaskStatus::Paused);

    assert_eq!(
        orch.handle_event(&mut exec, OrchEvent::PauseRequested { now_ms: 31 }),
        Err(EngineError::AlreadyPaused)
    );

    orch.handle_event(&mut exec, OrchEvent::ResumeRequested { now_ms: 40 })
        .unwrap();
    assert_eq!(exec.phase(), phase);
    assert_eq!(exec.cursor(), cursor);
    assert_eq!(exec.retries_for_cursor(), retries);
    assert_eq!(exec.status(), TaskStatus::Running);
}

#[test]
fn resume_without_pause_is_rejected() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    assert_eq!(
        orch.handle_event(&mut exec, OrchEvent::ResumeRequested { now_ms: 1 }),
        Err(EngineError::NotPaused)
    );
}

#[test]
fn cancel_is_terminal_and_idempotent() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));

    let fx = orch
        .handle_event(&mut exec, OrchEvent::CancelRequested { now_ms: 10 })
        .unwrap();
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Cancelled));
    assert_eq!(exec.status(), TaskStatus::Cancelled);

    // Late cancels and emergency observations are absorbed.
    assert_eq!(
        orch.handle_event(&mut exec, OrchEvent::CancelRequested { now_ms: 11 }),
        Ok(vec![])
    );
    assert_eq!(
        orch.handle_event(
            &mut exec,
            OrchEvent::EmergencyStop {
                source: crate::core::events::StopSource::Hotkey,
                now_ms: 12
            }
        ),
        Ok(vec![])
    );
}

#[test]
fn emergency_stop_cancels_with_reason() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));
    captured(&orch, &mut exec, 10);

    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::StepFinished {
                index: 0,
                outcome: StepOutcome::failure(StepError::new(
                    StepErrorKind::Cancelled,
                    "stop requested",
                )),
                now_ms: 20,
            },
        )
        .unwrap();
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Cancelled));
    // No further steps are issued.
    assert!(!fx.iter().any(|e| matches!(e, Effect::ExecuteStep { .. })));
}

#[test]
fn capture_failures_escalate_to_display_unavailable() {
    let orch = Orchestrator::new(Limits {
        max_capture_failures: 2,
        ..Limits::default()
    });
    let mut exec = fresh(&orch);
    deliver_plan(&orch, &mut exec, plan_with(vec![open_app("s1", 1)]));

    for now in [10u64, 11] {
        let fx = orch
            .handle_event(
                &mut exec,
                OrchEvent::ScreenCaptureFailed {
                    detail: "scrot failed".to_string(),
                    now_ms: now,
                },
            )
            .unwrap();
        assert_eq!(fx, vec![Effect::CaptureScreen]);
    }

    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::ScreenCaptureFailed {
                detail: "scrot failed".to_string(),
                now_ms: 12,
            },
        )
        .unwrap();
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Failed));
    assert_eq!(exec.failure_reason.as_deref(), Some("display_unavailable"));
}

#[test]
fn high_error_rate_forces_adapt_on_next_route() {
    let orch = Orchestrator::new(Limits {
        max_retries: 10,
        ..Limits::default()
    });
    let mut exec = fresh(&orch);
    let steps = vec![
        step("s1", 1, Action::Wait { duration_ms: 1 }, RetryPolicy::Fixed { attempts: 5 }),
        open_app("s2", 2),
        open_app("s3", 3),
    ];
    deliver_plan(&orch, &mut exec, plan_with(steps));
    captured(&orch, &mut exec, 10);

    // Two failed attempts then a success: 2 errors over cursor=1 > 0.3.
    step_err(&orch, &mut exec, 0, StepErrorKind::Timeout, 20);
    step_err(&orch, &mut exec, 0, StepErrorKind::Timeout, 30);
    let fx = step_ok(&orch, &mut exec, 0, 40);
    assert!(fx.contains(&Effect::CaptureScreen));
    assert!(exec.adapt_pending().is_some());

    let fx = captured(&orch, &mut exec, 50);
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));
}

#[test]
fn stuck_verify_requests_adaptation() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    let mut s = open_app("s1", 1);
    s.expected_screen_change = Some("calculator window appears".to_string());
    deliver_plan(&orch, &mut exec, plan_with(vec![s, open_app("s2", 2)]));
    captured(&orch, &mut exec, 10);

    let fx = orch
        .handle_event(
            &mut exec,
            OrchEvent::StepFinished {
                index: 0,
                outcome: StepOutcome {
                    ok: true,
                    screen_changed: Some(false),
                    ..StepOutcome::default()
                },
                now_ms: 20,
            },
        )
        .unwrap();
    assert!(fx
        .iter()
        .any(|e| matches!(e, Effect::RequestAdaptation { .. })));
    // Cursor must not advance past a stuck step.
    assert_eq!(exec.cursor(), 0);
}

#[test]
fn cursor_monotonic_outside_adaptation() {
    let orch = Orchestrator::new(Limits::default());
    let mut exec = fresh(&orch);
    deliver_plan(
        &orch,
        &mut exec,
        plan_with(vec![open_app("s1", 1), open_app("s2", 2), open_app("s3", 3)]),
    );

    let mut last_cursor = 0;
    for i in 0..3 {
        captured(&orch, &mut exec, 10 + i);
        step_ok(&orch, &mut exec, i as usize, 20 + i);
        assert!(exec.cursor() >= last_cursor);
        last_cursor = exec.cursor();
    }
    let fx = captured(&orch, &mut exec, 100);
    assert_eq!(terminal_of(&fx), Some(TerminalStatus::Completed));
    assert_eq!(exec.timings_ms.len(), 3);
}
