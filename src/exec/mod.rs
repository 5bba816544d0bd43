// Author: BlackIce Project
// License: MIT

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::ExecutorSettings;
use crate::core::action::Action;
use crate::core::error::{StepError, StepErrorKind};
use crate::core::events::{ScreenSnapshot, ScreenSummary, StepOutcome};
use crate::core::plan::Step;
use crate::display::{apply_display_env, DisplayManager};
use crate::guard::{PermissionGuard, Verdict};
use crate::monitor::ActivityMonitor;
use crate::safety::StopFlag;
use crate::templates::{TemplateLibrary, TemplateMatcher};

/// Quantum for interruptible sleeps; bounds how late a stop is observed.
const WAIT_QUANTUM: Duration = Duration::from_millis(100);
const INJECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam for the task runtime: the real executor needs a display server,
/// scenario tests script their own.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, step: &Step) -> StepOutcome;
}

/// Screen capture + analysis source for the orchestrator loop.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn capture(&self) -> Result<ScreenSnapshot, String>;
}

/// Performs one validated action on the AI display.
///
/// Every step passes the same gauntlet: stop flag, activity verdict,
/// permission guard, then dispatch under the step's deadline.
pub struct ActionExecutor {
    displays: Arc<DisplayManager>,
    guard: Arc<PermissionGuard>,
    monitor: Arc<ActivityMonitor>,
    templates: Arc<TemplateLibrary>,
    matcher: Arc<dyn TemplateMatcher>,
    stop: Arc<StopFlag>,
    cfg: ExecutorSettings,
    last_screen_hash: Mutex<Option<u64>>,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        displays: Arc<DisplayManager>,
        guard: Arc<PermissionGuard>,
        monitor: Arc<ActivityMonitor>,
        templates: Arc<TemplateLibrary>,
        matcher: Arc<dyn TemplateMatcher>,
        stop: Arc<StopFlag>,
        cfg: ExecutorSettings,
    ) -> Self {
        Self {
            displays,
            guard,
            monitor,
            templates,
            matcher,
            stop,
            cfg,
            last_screen_hash: Mutex::new(None),
        }
    }

    pub async fn execute(&self, step: &Step) -> StepOutcome {
        if self.stop.is_set() {
            return StepOutcome::failure(StepError::new(
                StepErrorKind::Cancelled,
                "stop requested",
            ));
        }

        let verdict = self.monitor.safety_verdict();
        if !verdict.is_safe() {
            return StepOutcome::failure(StepError::new(
                StepErrorKind::NotSafe,
                format!("{verdict:?}"),
            ));
        }

        match self.guard.validate(&step.action, "executor") {
            Verdict::Allowed { .. } => {}
            Verdict::Denied { reason, .. } => {
                return StepOutcome::failure(StepError::new(StepErrorKind::PolicyDenied, reason));
            }
        }

        // Wait is the one action that never touches the display.
        let display = if matches!(step.action, Action::Wait { .. }) {
            String::new()
        } else {
            match self.displays.ai_display() {
                Some(d) => d,
                None => {
                    return StepOutcome::failure(StepError::new(
                        StepErrorKind::DisplayUnavailable,
                        "no AI display",
                    ));
                }
            }
        };

        // Baseline for the screen-change observation, only when the step
        // promised one.
        let baseline = if step.expected_screen_change.is_some() && !display.is_empty() {
            self.screen_hash(&display).await
        } else {
            None
        };

        let deadline = Duration::from_millis(step.timeout_ms.max(1));
        let mut outcome =
            match tokio::time::timeout(deadline, self.dispatch(&display, &step.action)).await {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::failure(StepError::new(
                    StepErrorKind::Timeout,
                    format!("step exceeded {} ms", step.timeout_ms),
                )),
            };

        if outcome.ok {
            if let Some(before) = baseline {
                let after = self.screen_hash(&display).await;
                outcome.screen_changed = after.map(|a| a != before);
            }
        }
        outcome
    }

    async fn dispatch(&self, display: &str, action: &Action) -> StepOutcome {
        match action {
            Action::Click { x, y, button } => {
                self.inject(
                    display,
                    &[
                        "mousemove",
                        &x.to_string(),
                        &y.to_string(),
                        "click",
                        &button.x11_button().to_string(),
                    ],
                )
                .await
            }

            Action::Move { x, y } => {
                self.inject(display, &["mousemove", &x.to_string(), &y.to_string()])
                    .await
            }

            Action::Scroll { dx, dy } => self.scroll(display, *dx, *dy).await,

            Action::KeyPress { combo } => self.inject(display, &["key", combo]).await,

            Action::Type { text } => {
                let delay = self.cfg.type_delay_ms.to_string();
                self.inject(display, &["type", "--delay", &delay, "--", text])
                    .await
            }

            Action::Wait { duration_ms } => self.interruptible_wait(*duration_ms).await,

            Action::Screenshot { target_path } => {
                let path = target_path
                    .clone()
                    .unwrap_or_else(|| self.timestamped_shot_path());
                match self.displays.screenshot(display, &path).await {
                    Ok(()) => {
                        self.update_screen_hash(&path);
                        StepOutcome::success(Some(path.display().to_string()))
                    }
                    Err(e) => StepOutcome::failure(StepError::new(
                        StepErrorKind::DisplayUnavailable,
                        e.to_string(),
                    )),
                }
            }

            Action::FindElement {
                template_id,
                min_confidence,
            } => self.find_element(display, template_id, *min_confidence).await,

            Action::OpenApplication { alias } => {
                match self.displays.launch_on(display, alias, &[]).await {
                    Ok(info) => StepOutcome::success(Some(format!("pid {}", info.pid))),
                    Err(e) => StepOutcome::failure(StepError::new(
                        StepErrorKind::Internal,
                        e.to_string(),
                    )),
                }
            }

            Action::Verify { predicate } => self.verify(display, predicate).await,
        }
    }

    /// Input injection with one local retry for transient failures.
    async fn inject(&self, display: &str, args: &[&str]) -> StepOutcome {
        match self.xdotool(display, args).await {
            Ok(()) => StepOutcome::success(None),
            Err(first) => {
                debug!(error = %first, "injection failed once, retrying");
                match self.xdotool(display, args).await {
                    Ok(()) => StepOutcome::success(None),
                    Err(err) => StepOutcome::failure(err),
                }
            }
        }
    }

    async fn xdotool(&self, display: &str, args: &[&str]) -> Result<(), StepError> {
        let mut cmd = Command::new("xdotool");
        cmd.args(args);
        apply_display_env(&mut cmd, display);
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StepError::new(StepErrorKind::Internal, format!("xdotool: {e}")))?;

        let out = tokio::time::timeout(INJECT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| StepError::new(StepErrorKind::Timeout, "input injection stalled"))?
            .map_err(|e| StepError::new(StepErrorKind::Internal, e.to_string()))?;

        if out.status.success() {
            Ok(())
        } else {
            Err(StepError::new(
                StepErrorKind::Internal,
                format!("xdotool {} exited {:?}", args.first().unwrap_or(&""), out.status.code()),
            ))
        }
    }

    async fn scroll(&self, display: &str, dx: i32, dy: i32) -> StepOutcome {
        // X11 wheel semantics: 4/5 vertical, 6/7 horizontal; one click per
        // notch.
        let vertical = if dy >= 0 { "4" } else { "5" };
        for _ in 0..dy.unsigned_abs() {
            if let Err(e) = self.xdotool(display, &["click", vertical]).await {
                return StepOutcome::failure(e);
            }
        }
        let horizontal = if dx >= 0 { "7" } else { "6" };
        for _ in 0..dx.unsigned_abs() {
            if let Err(e) = self.xdotool(display, &["click", horizontal]).await {
                return StepOutcome::failure(e);
            }
        }
        StepOutcome::success(None)
    }

    async fn interruptible_wait(&self, duration_ms: u64) -> StepOutcome {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(duration_ms);
        let mut stop_rx = self.stop.watch();

        loop {
            if self.stop.is_set() {
                return StepOutcome::failure(StepError::new(
                    StepErrorKind::Cancelled,
                    "stop requested during wait",
                ));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return StepOutcome::success(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining.min(WAIT_QUANTUM)) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    async fn find_element(
        &self,
        display: &str,
        template_id: &str,
        min_confidence: f32,
    ) -> StepOutcome {
        let Some(template) = self.templates.get(template_id) else {
            return StepOutcome {
                ok: false,
                error: Some(StepError::new(
                    StepErrorKind::TemplateNotFound,
                    format!("unknown template: {template_id}"),
                )),
                adaptation_hint: Some(format!("template {template_id} is not in the library")),
                ..StepOutcome::default()
            };
        };

        let shot = self.timestamped_shot_path();
        if let Err(e) = self.displays.screenshot(display, &shot).await {
            return StepOutcome::failure(StepError::new(
                StepErrorKind::DisplayUnavailable,
                e.to_string(),
            ));
        }
        self.update_screen_hash(&shot);

        match self.matcher.find(template, &shot, min_confidence) {
            Ok(Some(hit)) => StepOutcome::success(Some(format!(
                "{{\"x\":{},\"y\":{},\"confidence\":{:.3}}}",
                hit.x, hit.y, hit.confidence
            ))),
            Ok(None) => StepOutcome {
                ok: false,
                error: Some(StepError::new(
                    StepErrorKind::TemplateNotFound,
                    format!("no match for {template_id} above {min_confidence:.2}"),
                )),
                adaptation_hint: Some(format!("element {template_id} not on screen")),
                ..StepOutcome::default()
            },
            Err(e) => StepOutcome::failure(StepError::new(StepErrorKind::Internal, e.to_string())),
        }
    }

    /// `template:<id>` re-runs a find at the default floor;
    /// `screen_changed` asserts the framebuffer hash moved since the last
    /// capture.
    async fn verify(&self, display: &str, predicate: &str) -> StepOutcome {
        if let Some(template_id) = predicate.strip_prefix("template:") {
            let mut outcome = self.find_element(display, template_id, 0.8).await;
            if !outcome.ok {
                outcome.error = Some(StepError::new(
                    StepErrorKind::TemplateNotFound,
                    format!("verification failed: {predicate}"),
                ));
            }
            return outcome;
        }

        if predicate == "screen_changed" {
            let before = self.last_screen_hash.lock().ok().and_then(|g| *g);
            let after = self.screen_hash(display).await;
            return match (before, after) {
                (Some(b), Some(a)) if a != b => {
                    let mut out = StepOutcome::success(None);
                    out.screen_changed = Some(true);
                    out
                }
                (_, Some(_)) => StepOutcome {
                    ok: false,
                    error: Some(StepError::new(
                        StepErrorKind::TemplateNotFound,
                        "verification failed: screen did not change",
                    )),
                    screen_changed: Some(false),
                    adaptation_hint: Some("expected a visible change".to_string()),
                    ..StepOutcome::default()
                },
                (_, None) => StepOutcome::failure(StepError::new(
                    StepErrorKind::DisplayUnavailable,
                    "could not capture for verification",
                )),
            };
        }

        StepOutcome::failure(StepError::new(
            StepErrorKind::Internal,
            format!("unknown verify predicate: {predicate}"),
        ))
    }

    // ---------------- screen hashing ----------------

    async fn screen_hash(&self, display: &str) -> Option<u64> {
        let path = self.timestamped_shot_path();
        if self.displays.screenshot(display, &path).await.is_err() {
            return None;
        }
        let hash = hash_file(&path);
        if let (Some(h), Ok(mut guard)) = (hash, self.last_screen_hash.lock()) {
            *guard = Some(h);
        }
        let _ = std::fs::remove_file(&path);
        hash
    }

    fn update_screen_hash(&self, path: &Path) {
        if let (Some(h), Ok(mut guard)) = (hash_file(path), self.last_screen_hash.lock()) {
            *guard = Some(h);
        }
    }

    fn timestamped_shot_path(&self) -> PathBuf {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.cfg.screenshot_dir.join(format!("shot-{ts}.png"))
    }
}

#[async_trait]
impl StepRunner for ActionExecutor {
    async fn run_step(&self, step: &Step) -> StepOutcome {
        self.execute(step).await
    }
}

/// Production screen source: capture via the display manager; vision-side
/// analysis is an external concern, so the summary starts empty.
pub struct DisplayScreenSource {
    displays: Arc<DisplayManager>,
    shot_dir: PathBuf,
}

impl DisplayScreenSource {
    pub fn new(displays: Arc<DisplayManager>, shot_dir: PathBuf) -> Self {
        Self { displays, shot_dir }
    }
}

#[async_trait]
impl ScreenSource for DisplayScreenSource {
    async fn capture(&self) -> Result<ScreenSnapshot, String> {
        let display = self
            .displays
            .ai_display()
            .ok_or_else(|| "no AI display".to_string())?;
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let path = self.shot_dir.join(format!("state-{ts}.png"));
        self.displays
            .screenshot(&display, &path)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ScreenSnapshot {
            path,
            taken_ms: now_ms(),
            summary: ScreenSummary::default(),
        })
    }
}

fn hash_file(path: &Path) -> Option<u64> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorSettings, Policy};
    use crate::core::action::MouseButton;
    use crate::core::plan::RetryPolicy;
    use crate::monitor::{ActivityMonitor, InputActivity, Sensors};
    use crate::templates::NullMatcher;

    struct CalmSensors;

    impl Sensors for CalmSensors {
        fn cpu_percent(&self) -> Option<f32> {
            Some(1.0)
        }
        fn memory_percent(&self) -> Option<f32> {
            Some(10.0)
        }
        fn process_lines(&self) -> Option<Vec<String>> {
            Some(vec![])
        }
    }

    fn executor(stop: Arc<StopFlag>) -> ActionExecutor {
        let displays = Arc::new(DisplayManager::new(":0"));
        let monitor = Arc::new(ActivityMonitor::new(
            Arc::new(InputActivity::new(0)),
            Box::new(CalmSensors),
            MonitorSettings::default(),
            vec![],
            Arc::clone(&stop),
        ));
        let dir = std::env::temp_dir().join("warden-exec-tests");
        ActionExecutor::new(
            displays,
            Arc::new(PermissionGuard::new(Policy::default())),
            monitor,
            Arc::new(TemplateLibrary::load(&dir).unwrap()),
            Arc::new(NullMatcher),
            stop,
            ExecutorSettings::default(),
        )
    }

    fn wait_step(duration_ms: u64) -> Step {
        Step {
            id: "w".to_string(),
            order: 1,
            description: "wait".to_string(),
            action: Action::Wait { duration_ms },
            pre_conditions: vec![],
            post_conditions: vec![],
            timeout_ms: 60_000,
            retry_policy: RetryPolicy::None,
            fallback_step_id: None,
            expected_screen_change: None,
        }
    }

    #[tokio::test]
    async fn stop_flag_short_circuits_before_anything_runs() {
        let stop = Arc::new(StopFlag::new());
        stop.set();
        let exec = executor(stop);

        let out = exec.execute(&wait_step(10)).await;
        assert!(!out.ok);
        assert_eq!(out.error.unwrap().kind, StepErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn denied_action_never_reaches_dispatch() {
        let stop = Arc::new(StopFlag::new());
        let exec = executor(stop);

        let mut step = wait_step(10);
        step.action = Action::Type {
            text: "rm -rf /".to_string(),
        };
        let out = exec.execute(&step).await;
        assert!(!out.ok);
        assert_eq!(out.error.unwrap().kind, StepErrorKind::PolicyDenied);
    }

    #[tokio::test]
    async fn missing_display_is_reported_as_unavailable() {
        let stop = Arc::new(StopFlag::new());
        let exec = executor(stop);

        let mut step = wait_step(10);
        step.action = Action::Click {
            x: 5,
            y: 5,
            button: MouseButton::Left,
        };
        let out = exec.execute(&step).await;
        assert!(!out.ok);
        assert_eq!(out.error.unwrap().kind, StepErrorKind::DisplayUnavailable);
    }

    #[tokio::test]
    async fn emergency_stop_interrupts_a_long_wait_quickly() {
        let stop = Arc::new(StopFlag::new());
        let exec = Arc::new(executor(Arc::clone(&stop)));

        // The wait would run 10 s; the stop must cut it within a quantum.
        let task = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.execute(&wait_step(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.set();

        let started = std::time::Instant::now();
        let out = task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!out.ok);
        assert_eq!(out.error.unwrap().kind, StepErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn short_wait_completes() {
        let stop = Arc::new(StopFlag::new());
        let exec = executor(stop);
        let out = exec.execute(&wait_step(20)).await;
        assert!(out.ok, "wait failed: {:?}", out.error);
    }
}
