// Author: BlackIce Project
// License: MIT

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::core::effect::Effect;
use crate::core::error::StepErrorKind;
use crate::core::events::{EventKind, OrchEvent, StopSource};
use crate::core::orchestrator::Orchestrator;
use crate::core::state::{TaskExec, TaskStatus};
use crate::exec::{ScreenSource, StepRunner};
use crate::monitor::ActivityMonitor;
use crate::planner::{ErrorContext, PlannerFacade, ScreenAnalysis, SystemContext};
use crate::safety::StopFlag;

/// Control surface the daemon has over a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Pause,
    Resume,
    Cancel,
}

/// Status view published after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub intent: String,
    pub status: TaskStatus,
    pub cursor: usize,
    pub steps: usize,
    pub retries_for_cursor: u32,
    pub adaptations: u32,
    pub errors: u32,
    pub waiting_for_safe: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub reason: Option<String>,
}

/// Thin effect runtime around the pure orchestrator: performs each effect
/// (planner call, capture, step execution), feeds the result back in, and
/// observes stop/control at every boundary.
pub struct TaskRuntime {
    orchestrator: Orchestrator,
    exec: TaskExec,
    planner: Arc<PlannerFacade>,
    runner: Arc<dyn StepRunner>,
    screen: Arc<dyn ScreenSource>,
    monitor: Arc<ActivityMonitor>,
    bus: Arc<EventBus>,
    stop: Arc<StopFlag>,
    control_rx: mpsc::Receiver<TaskControl>,
    /// Bus subscription carrying the verifier's ViolationDetected events;
    /// they become ViolationObserved inputs to the engine so the disrupt
    /// routing can see them.
    violations_rx: mpsc::Receiver<BusEvent>,
    snapshot_tx: watch::Sender<TaskSnapshot>,
    wait_safe_timeout: Duration,

    /// Control messages peeked at mid-effect, replayed in order at the
    /// next loop turn.
    stashed_control: VecDeque<TaskControl>,
    waiting_for_safe: bool,
    stop_observed: bool,
    last_error_kind: Option<StepErrorKind>,
}

impl TaskRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Orchestrator,
        exec: TaskExec,
        planner: Arc<PlannerFacade>,
        runner: Arc<dyn StepRunner>,
        screen: Arc<dyn ScreenSource>,
        monitor: Arc<ActivityMonitor>,
        bus: Arc<EventBus>,
        stop: Arc<StopFlag>,
        control_rx: mpsc::Receiver<TaskControl>,
        violations_rx: mpsc::Receiver<BusEvent>,
        snapshot_tx: watch::Sender<TaskSnapshot>,
        wait_safe_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            exec,
            planner,
            runner,
            screen,
            monitor,
            bus,
            stop,
            control_rx,
            violations_rx,
            snapshot_tx,
            wait_safe_timeout,
            stashed_control: VecDeque::new(),
            waiting_for_safe: false,
            stop_observed: false,
            last_error_kind: None,
        }
    }

    pub fn snapshot_of(exec: &TaskExec, waiting: bool) -> TaskSnapshot {
        TaskSnapshot {
            task_id: exec.task_id.clone(),
            intent: exec.intent.clone(),
            status: exec.status(),
            cursor: exec.cursor(),
            steps: exec.steps_len(),
            retries_for_cursor: exec.retries_for_cursor(),
            adaptations: exec.adaptation_count(),
            errors: exec.error_total(),
            waiting_for_safe: waiting,
            failure_reason: exec.failure_reason.clone(),
        }
    }

    pub async fn run(mut self) -> TaskResult {
        let mut queue: VecDeque<OrchEvent> = VecDeque::new();
        let mut backlog: VecDeque<OrchEvent> = VecDeque::new();
        queue.push_back(OrchEvent::IntentAccepted { now_ms: now_ms() });

        loop {
            self.drain_control(&mut queue);
            self.drain_violations(&mut queue);
            self.observe_stop(&mut queue);

            let Some(event) = queue.pop_front() else {
                if self.exec.status().is_terminal() {
                    break;
                }
                // Paused (or starved): block until the daemon says more.
                match self.control_rx.recv().await {
                    Some(ctrl) => {
                        self.enqueue_control(ctrl, &mut queue);
                        if matches!(ctrl, TaskControl::Resume) {
                            // Replay results that arrived while paused.
                            queue.extend(backlog.drain(..));
                        }
                        continue;
                    }
                    None => {
                        // Daemon gone; surrender.
                        queue.push_back(OrchEvent::CancelRequested { now_ms: now_ms() });
                        continue;
                    }
                }
            };

            if self.exec.is_paused() && !is_control_event(&event) {
                backlog.push_back(event);
                continue;
            }
            let resuming = matches!(event, OrchEvent::ResumeRequested { .. });

            let effects = match self.orchestrator.handle_event(&mut self.exec, event) {
                Ok(effects) => effects,
                Err(e) => {
                    debug!(task = %self.exec.task_id, error = %e, "engine rejected event");
                    continue;
                }
            };
            if resuming {
                queue.extend(backlog.drain(..));
            }

            for effect in effects {
                if let Some(result) = self.perform(effect).await {
                    queue.push_back(result);
                }
            }

            self.publish_snapshot();

            if self.exec.status().is_terminal() && queue.is_empty() {
                break;
            }
        }

        self.publish_snapshot();
        TaskResult {
            task_id: self.exec.task_id.clone(),
            status: self.exec.status(),
            reason: self.exec.failure_reason.clone(),
        }
    }

    // ---------------- effect performance ----------------

    async fn perform(&mut self, effect: Effect) -> Option<OrchEvent> {
        match effect {
            Effect::Emit(kind) => {
                self.bus.publish(Some(&self.exec.task_id), kind);
                None
            }

            Effect::RequestPlan => {
                let intent = self.exec.intent.clone();
                let screen = self.current_analysis();
                let call = self.planner.plan(&intent, screen, SystemContext::default());
                match self.bounded_by_stop(call).await {
                    Some(Ok(plan)) => Some(OrchEvent::PlanReady {
                        plan: Box::new(plan),
                        now_ms: now_ms(),
                    }),
                    Some(Err(e)) => Some(OrchEvent::PlanFailed {
                        error: e,
                        now_ms: now_ms(),
                    }),
                    None => Some(self.stop_event()),
                }
            }

            Effect::CaptureScreen => {
                let call = self.screen.capture();
                match self.bounded_by_stop(call).await {
                    Some(Ok(snapshot)) => Some(OrchEvent::ScreenCaptured {
                        snapshot,
                        now_ms: now_ms(),
                    }),
                    Some(Err(detail)) => Some(OrchEvent::ScreenCaptureFailed {
                        detail,
                        now_ms: now_ms(),
                    }),
                    None => Some(self.stop_event()),
                }
            }

            Effect::ExecuteStep { index, delay_ms } => {
                // A cancel that raced in behind the routing decision must
                // win: no new actions once it is in the channel.
                if self.abort_requested() {
                    return None;
                }

                if delay_ms > 0 && !self.sleep_unless_stopped(delay_ms).await {
                    return Some(self.stop_event());
                }

                // A NotSafe failure means the user is busy: hold here until
                // the monitor clears us (bounded), then attempt the step.
                if self.last_error_kind == Some(StepErrorKind::NotSafe) {
                    self.waiting_for_safe = true;
                    self.publish_snapshot();
                    let _ = self.monitor.wait_for_safe(self.wait_safe_timeout).await;
                    self.waiting_for_safe = false;
                    self.publish_snapshot();
                }

                let Some(step) = self.exec.plan().and_then(|p| p.steps.get(index)).cloned()
                else {
                    warn!(task = %self.exec.task_id, index, "step vanished under the runtime");
                    return Some(OrchEvent::CancelRequested { now_ms: now_ms() });
                };

                let outcome = self.runner.run_step(&step).await;
                self.last_error_kind = outcome.error.as_ref().map(|e| e.kind);
                Some(OrchEvent::StepFinished {
                    index,
                    outcome,
                    now_ms: now_ms(),
                })
            }

            Effect::RequestAdaptation { reason: _ } => {
                let Some(plan) = self.exec.plan().cloned() else {
                    return Some(OrchEvent::AdaptFailed {
                        error: crate::core::error::PlannerError::Malformed(
                            "no plan to adapt".to_string(),
                        ),
                        now_ms: now_ms(),
                    });
                };
                let context = self.error_context();
                let screen = self.current_analysis();
                let cursor = self.exec.cursor();
                let call = self.planner.adapt(&plan, cursor, context, screen);
                match self.bounded_by_stop(call).await {
                    Some(Ok(plan)) => Some(OrchEvent::AdaptReady {
                        plan: Box::new(plan),
                        now_ms: now_ms(),
                    }),
                    Some(Err(e)) => Some(OrchEvent::AdaptFailed {
                        error: e,
                        now_ms: now_ms(),
                    }),
                    None => Some(self.stop_event()),
                }
            }
        }
    }

    // ---------------- plumbing ----------------

    fn drain_control(&mut self, queue: &mut VecDeque<OrchEvent>) {
        while let Some(ctrl) = self.stashed_control.pop_front() {
            self.enqueue_control(ctrl, queue);
        }
        while let Ok(ctrl) = self.control_rx.try_recv() {
            self.enqueue_control(ctrl, queue);
        }
    }

    fn drain_violations(&mut self, queue: &mut VecDeque<OrchEvent>) {
        while let Ok(event) = self.violations_rx.try_recv() {
            if let EventKind::ViolationDetected { kind } = event.kind {
                queue.push_back(OrchEvent::ViolationObserved {
                    kind,
                    now_ms: now_ms(),
                });
            }
        }
    }

    /// Peek the control channel without losing messages. True when a
    /// cancel (or the global stop) should preempt the next action.
    fn abort_requested(&mut self) -> bool {
        while let Ok(ctrl) = self.control_rx.try_recv() {
            self.stashed_control.push_back(ctrl);
        }
        self.stop.is_set()
            || self
                .stashed_control
                .iter()
                .any(|c| matches!(c, TaskControl::Cancel))
    }

    fn enqueue_control(&self, ctrl: TaskControl, queue: &mut VecDeque<OrchEvent>) {
        let now_ms = now_ms();
        let event = match ctrl {
            TaskControl::Pause => OrchEvent::PauseRequested { now_ms },
            TaskControl::Resume => OrchEvent::ResumeRequested { now_ms },
            TaskControl::Cancel => OrchEvent::CancelRequested { now_ms },
        };
        queue.push_back(event);
    }

    fn observe_stop(&mut self, queue: &mut VecDeque<OrchEvent>) {
        if self.stop.is_set() && !self.stop_observed {
            self.stop_observed = true;
            queue.push_back(self.stop_event());
        }
    }

    fn stop_event(&mut self) -> OrchEvent {
        self.stop_observed = true;
        OrchEvent::EmergencyStop {
            source: StopSource::Internal,
            now_ms: now_ms(),
        }
    }

    /// Await `call`, abandoning it the moment a global stop lands.
    async fn bounded_by_stop<T>(
        &self,
        call: impl std::future::Future<Output = T>,
    ) -> Option<T> {
        let mut stop_rx = self.stop.watch();
        if self.stop.is_set() {
            return None;
        }
        tokio::select! {
            out = call => Some(out),
            _ = stop_rx.changed() => None,
        }
    }

    async fn sleep_unless_stopped(&self, ms: u64) -> bool {
        let mut stop_rx = self.stop.watch();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
            _ = stop_rx.changed() => !self.stop.is_set(),
        }
    }

    fn current_analysis(&self) -> ScreenAnalysis {
        self.exec
            .last_screen()
            .map(|snapshot| ScreenAnalysis {
                unexpected_elements: snapshot.summary.unexpected_elements.clone(),
                confidence: snapshot.summary.confidence,
                ..ScreenAnalysis::default()
            })
            .unwrap_or_default()
    }

    fn error_context(&self) -> ErrorContext {
        let last_errors: Vec<String> = self
            .exec
            .recent_errors()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(3)
            .rev()
            .collect();
        ErrorContext {
            current_step: self.exec.cursor(),
            completed_steps: self.exec.cursor(),
            last_errors,
            retry_count: self.exec.retries_for_cursor(),
            disruptions: self
                .exec
                .last_screen()
                .map(|s| s.summary.unexpected_elements.clone())
                .unwrap_or_default(),
        }
    }

    fn publish_snapshot(&self) {
        let _ = self
            .snapshot_tx
            .send(Self::snapshot_of(&self.exec, self.waiting_for_safe));
    }
}

fn is_control_event(event: &OrchEvent) -> bool {
    matches!(
        event,
        OrchEvent::PauseRequested { .. }
            | OrchEvent::ResumeRequested { .. }
            | OrchEvent::CancelRequested { .. }
            | OrchEvent::EmergencyStop { .. }
    )
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
