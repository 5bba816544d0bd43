// Author: BlackIce Project
// License: MIT

mod tasks;

pub use tasks::{TaskControl, TaskResult, TaskRuntime, TaskSnapshot};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Settings;
use crate::core::events::{EventKind, StopSource};
use crate::core::orchestrator::{Limits, Orchestrator};
use crate::core::state::{TaskExec, TaskStatus};
use crate::display::DisplayManager;
use crate::exec::{ActionExecutor, DisplayScreenSource, ScreenSource, StepRunner};
use crate::guard::PermissionGuard;
use crate::isolation::IsolationVerifier;
use crate::monitor::{ActivityMonitor, InputActivity, ProcSensors};
use crate::planner::{Planner, PlannerFacade};
use crate::safety::{EmergencyStop, Notifier, StopFlag};
use crate::templates::{TemplateLibrary, TemplateMatcher};

/// Requests the IPC layer (and tests) send into the daemon loop.
pub enum DaemonMsg {
    RunIntent {
        intent: String,
        reply: oneshot::Sender<Result<RunStarted, String>>,
    },
    Status {
        task_id: Option<String>,
        reply: oneshot::Sender<Result<String, String>>,
    },
    Cancel {
        task_id: Option<String>,
        reply: oneshot::Sender<Result<String, String>>,
    },
    Pause {
        task_id: Option<String>,
        reply: oneshot::Sender<Result<String, String>>,
    },
    Resume {
        task_id: Option<String>,
        reply: oneshot::Sender<Result<String, String>>,
    },
    DumpAudit {
        path: PathBuf,
        reply: oneshot::Sender<Result<String, String>>,
    },
    Info {
        json: bool,
        reply: oneshot::Sender<Result<String, String>>,
    },
    ResetEmergency {
        reply: oneshot::Sender<Result<String, String>>,
    },
    TriggerEmergency {
        source: StopSource,
        reply: oneshot::Sender<Result<String, String>>,
    },
    StopDaemon {
        reply: oneshot::Sender<Result<String, String>>,
    },
}

/// Accepted intent: the task id plus a receiver resolving at the terminal
/// event.
pub struct RunStarted {
    pub task_id: String,
    pub done: oneshot::Receiver<TaskResult>,
}

struct TaskHandle {
    control: mpsc::Sender<TaskControl>,
    snapshot: watch::Receiver<TaskSnapshot>,
}

/// Composition root. Constructs every component once and hands references
/// down; nothing in the tree reaches for a global.
pub struct Daemon {
    settings: Settings,

    stop: Arc<StopFlag>,
    bus: Arc<EventBus>,
    guard: Arc<PermissionGuard>,
    displays: Arc<DisplayManager>,
    monitor: Arc<ActivityMonitor>,
    verifier: Arc<IsolationVerifier>,
    emergency: Arc<EmergencyStop>,
    planner: Arc<PlannerFacade>,
    runner: Arc<dyn StepRunner>,
    screen: Arc<dyn ScreenSource>,

    tasks: HashMap<String, TaskHandle>,
    running: Arc<AtomicUsize>,
    seq: u64,
}

impl Daemon {
    /// Wire the full component graph. The planner backend, template
    /// matcher, and notifier stay external collaborators.
    pub fn new(
        settings: Settings,
        planner_backend: Arc<dyn Planner>,
        matcher: Arc<dyn TemplateMatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> eyre::Result<Self> {
        let stop = Arc::new(StopFlag::new());
        let bus = Arc::new(EventBus::new());

        let guard = Arc::new(PermissionGuard::new(settings.policy.clone()));
        let displays = Arc::new(DisplayManager::new(settings.display.user_display.clone()));

        let input = Arc::new(InputActivity::new(now_ms()));
        let monitor = Arc::new(ActivityMonitor::new(
            input,
            Box::new(ProcSensors::new()),
            settings.monitor.clone(),
            settings.policy.critical_processes.clone(),
            Arc::clone(&stop),
        ));

        let verifier = Arc::new(IsolationVerifier::new(
            Arc::clone(&displays),
            Arc::clone(&bus),
            settings.isolation.clone(),
        ));

        let emergency = Arc::new(EmergencyStop::new(
            Arc::clone(&stop),
            Arc::clone(&bus),
            Arc::clone(&displays),
            notifier,
            settings.policy.emergency_auto_reset,
        ));
        emergency.arm(&settings.policy.emergency_hotkey)?;

        let templates = Arc::new(TemplateLibrary::load(&settings.templates.dir)?);

        let planner = Arc::new(PlannerFacade::new(
            planner_backend,
            Duration::from_secs(settings.executor.planner_timeout_secs),
        ));

        let runner: Arc<dyn StepRunner> = Arc::new(ActionExecutor::new(
            Arc::clone(&displays),
            Arc::clone(&guard),
            Arc::clone(&monitor),
            templates,
            matcher,
            Arc::clone(&stop),
            settings.executor.clone(),
        ));

        let screen: Arc<dyn ScreenSource> = Arc::new(DisplayScreenSource::new(
            Arc::clone(&displays),
            settings.executor.screenshot_dir.clone(),
        ));

        Ok(Self {
            settings,
            stop,
            bus,
            guard,
            displays,
            monitor,
            verifier,
            emergency,
            planner,
            runner,
            screen,
            tasks: HashMap::new(),
            running: Arc::new(AtomicUsize::new(0)),
            seq: 0,
        })
    }

    /// Test seam: replace the executor and screen source with scripted
    /// doubles after construction.
    pub fn with_collaborators(
        mut self,
        runner: Arc<dyn StepRunner>,
        screen: Arc<dyn ScreenSource>,
    ) -> Self {
        self.runner = runner;
        self.screen = screen;
        self
    }

    /// Test seam: swap the activity monitor for one with scripted sensors.
    pub fn with_monitor(mut self, monitor: Arc<ActivityMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn stop_flag(&self) -> Arc<StopFlag> {
        Arc::clone(&self.stop)
    }

    pub fn emergency(&self) -> Arc<EmergencyStop> {
        Arc::clone(&self.emergency)
    }

    pub fn monitor_input(&self) -> Arc<InputActivity> {
        self.monitor.input()
    }

    pub fn displays(&self) -> Arc<DisplayManager> {
        Arc::clone(&self.displays)
    }

    /// Main daemon loop: IPC requests, hotkey triggers, and the safety
    /// sweep all converge here.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<DaemonMsg>,
        shutdown_tx: watch::Sender<bool>,
    ) -> eyre::Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();

        // Hotkey presses come from the input listener thread.
        let (hotkey_tx, mut hotkey_rx) = mpsc::unbounded_channel::<StopSource>();
        crate::services::input::spawn_input_listener(
            self.monitor.input(),
            crate::safety::parse_hotkey(&self.settings.policy.emergency_hotkey),
            hotkey_tx,
            shutdown_tx.subscribe(),
        );

        crate::services::ticker::spawn_safety_sweep(
            Arc::clone(&self.verifier),
            Arc::clone(&self.monitor),
            Arc::clone(&self.emergency),
            Arc::clone(&self.running),
            shutdown_tx.subscribe(),
        );

        info!("warden daemon running");

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_msg(msg).await {
                                let _ = shutdown_tx.send(true);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(source) = hotkey_rx.recv() => {
                    warn!(?source, "emergency trigger received");
                    self.emergency.trigger(source).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("daemon shutting down");
        for (id, handle) in &self.tasks {
            if !handle.snapshot.borrow().status.is_terminal() {
                let _ = handle.control.try_send(TaskControl::Cancel);
                info!(task = %id, "cancelled on shutdown");
            }
        }
        self.displays.destroy_all().await;
    }

    /// Returns true when the daemon should exit.
    async fn handle_msg(&mut self, msg: DaemonMsg) -> bool {
        match msg {
            DaemonMsg::RunIntent { intent, reply } => {
                let _ = reply.send(self.start_task(intent).await);
            }

            DaemonMsg::Status { task_id, reply } => {
                let _ = reply.send(self.status_json(task_id.as_deref()));
            }

            DaemonMsg::Cancel { task_id, reply } => {
                let _ = reply.send(self.send_control(task_id.as_deref(), TaskControl::Cancel));
            }

            DaemonMsg::Pause { task_id, reply } => {
                let _ = reply.send(self.send_control(task_id.as_deref(), TaskControl::Pause));
            }

            DaemonMsg::Resume { task_id, reply } => {
                let _ = reply.send(self.send_control(task_id.as_deref(), TaskControl::Resume));
            }

            DaemonMsg::DumpAudit { path, reply } => {
                let result = self
                    .guard
                    .dump_audit(&path)
                    .map(|()| format!("audit written to {}", path.display()))
                    .map_err(|e| format!("audit dump failed: {e}"));
                let _ = reply.send(result);
            }

            DaemonMsg::Info { json, reply } => {
                let _ = reply.send(Ok(self.info_response(json)));
            }

            DaemonMsg::ResetEmergency { reply } => {
                self.emergency.reset();
                let _ = reply.send(Ok("emergency state reset".to_string()));
            }

            DaemonMsg::TriggerEmergency { source, reply } => {
                self.emergency.trigger(source).await;
                let _ = reply.send(Ok("emergency stop triggered".to_string()));
            }

            DaemonMsg::StopDaemon { reply } => {
                let _ = reply.send(Ok("stopping".to_string()));
                return true;
            }
        }
        false
    }

    // ---------------- task management ----------------

    async fn start_task(&mut self, intent: String) -> Result<RunStarted, String> {
        if self.emergency.is_latched() {
            return Err("emergency_stop: latched; run reset-emergency first".to_string());
        }

        self.ensure_display().await?;

        self.seq += 1;
        let task_id = format!("task-{:04}", self.seq);
        let exec = TaskExec::new(task_id.clone(), intent.clone(), now_ms());

        let limits = Limits {
            max_retries: self.settings.policy.max_retries,
            max_adaptations: self.settings.policy.max_adaptations,
            disrupt_violation_floor: self.settings.isolation.disrupt_violations,
            ..Limits::default()
        };

        // The runtime watches the verifier's violation reports so routing
        // can treat a noisy window as a disruption.
        let (violations_rx, _) = self.bus.subscribe(&format!("{task_id}-violations"), 64);

        let (control_tx, control_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(TaskRuntime::snapshot_of(&exec, false));
        let (done_tx, done_rx) = oneshot::channel();

        let runtime = TaskRuntime::new(
            Orchestrator::new(limits),
            exec,
            Arc::clone(&self.planner),
            Arc::clone(&self.runner),
            Arc::clone(&self.screen),
            Arc::clone(&self.monitor),
            Arc::clone(&self.bus),
            Arc::clone(&self.stop),
            control_rx,
            violations_rx,
            snapshot_tx,
            Duration::from_secs(self.settings.executor.wait_safe_timeout_secs),
        );

        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = runtime.run().await;
            running.fetch_sub(1, Ordering::SeqCst);
            let _ = done_tx.send(result);
        });

        self.tasks.insert(
            task_id.clone(),
            TaskHandle {
                control: control_tx,
                snapshot: snapshot_rx,
            },
        );

        info!(task = %task_id, intent = %intent, "task accepted");
        Ok(RunStarted {
            task_id,
            done: done_rx,
        })
    }

    async fn ensure_display(&self) -> Result<(), String> {
        if self.displays.ai_display().is_some() {
            return Ok(());
        }
        if let Some(external) = &self.settings.display.external_id {
            self.displays.use_external_display(external);
            self.bus.publish(
                None,
                EventKind::DisplayReady {
                    id: external.clone(),
                },
            );
            return Ok(());
        }
        let id = self
            .displays
            .create_ai_display(
                &self.settings.display.preferred_id,
                (self.settings.display.width, self.settings.display.height),
            )
            .await
            .map_err(|e| format!("display_unavailable: {e}"))?;
        self.bus.publish(None, EventKind::DisplayReady { id });
        Ok(())
    }

    /// Session overview for `info [--json]`.
    fn info_response(&self, json: bool) -> String {
        let mut active = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        for handle in self.tasks.values() {
            match handle.snapshot.borrow().status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
                _ => active += 1,
            }
        }

        let ai_display = self.displays.ai_display();

        if json {
            serde_json::json!({
                "running": true,
                "version": env!("CARGO_PKG_VERSION"),
                "ai_display": ai_display,
                "user_display": self.displays.user_display(),
                "emergency": {
                    "armed": self.emergency.is_armed(),
                    "latched": self.emergency.is_latched(),
                    "hotkey": self.emergency.hotkey(),
                },
                "tasks": {
                    "total": self.tasks.len(),
                    "active": active,
                    "completed": completed,
                    "failed": failed,
                    "cancelled": cancelled,
                },
                "audit_records": self.guard.audit_total(),
            })
            .to_string()
        } else {
            let mut out = String::new();
            out.push_str(&format!("warden {}\n", env!("CARGO_PKG_VERSION")));
            out.push_str(&format!(
                "AI display:     {}\n",
                ai_display.as_deref().unwrap_or("(none)")
            ));
            out.push_str(&format!("User display:   {}\n", self.displays.user_display()));
            out.push_str(&format!(
                "Emergency:      armed={} latched={} hotkey={}\n",
                self.emergency.is_armed(),
                self.emergency.is_latched(),
                self.emergency.hotkey()
            ));
            out.push_str(&format!(
                "Tasks:          {} total ({active} active, {completed} completed, {failed} failed, {cancelled} cancelled)\n",
                self.tasks.len()
            ));
            out.push_str(&format!("Audit records:  {}", self.guard.audit_total()));
            out
        }
    }

    fn status_json(&self, task_id: Option<&str>) -> Result<String, String> {
        match task_id {
            Some(id) => {
                let handle = self.tasks.get(id).ok_or_else(|| format!("no such task: {id}"))?;
                serde_json::to_string_pretty(&*handle.snapshot.borrow())
                    .map_err(|e| e.to_string())
            }
            None => {
                let all: Vec<TaskSnapshot> = self
                    .tasks
                    .values()
                    .map(|h| h.snapshot.borrow().clone())
                    .collect();
                serde_json::to_string_pretty(&all).map_err(|e| e.to_string())
            }
        }
    }

    fn send_control(
        &self,
        task_id: Option<&str>,
        control: TaskControl,
    ) -> Result<String, String> {
        let mut hit = 0;
        for (id, handle) in &self.tasks {
            let applies = task_id.map_or(true, |t| t == id.as_str());
            if applies && !handle.snapshot.borrow().status.is_terminal() {
                let _ = handle.control.try_send(control);
                hit += 1;
            }
        }
        if hit == 0 {
            if let Some(id) = task_id {
                return Err(format!("no active task: {id}"));
            }
        }
        Ok(format!("{control:?} sent to {hit} task(s)"))
    }

    /// Terminal status → CLI exit code mapping lives with the daemon so
    /// the client stays dumb.
    pub fn exit_code_for(result: &TaskResult) -> i32 {
        match result.status {
            TaskStatus::Completed => 0,
            TaskStatus::Cancelled => 3,
            _ => match result.reason.as_deref() {
                Some(r) if r.starts_with("policy_denied") => 2,
                Some(r) if r.starts_with("planner_") => 4,
                Some(r) if r.starts_with("display_unavailable") => 5,
                _ => 1,
            },
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
