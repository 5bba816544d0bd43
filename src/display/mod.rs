// Author: BlackIce Project
// License: MIT

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const READY_PROBE_ATTEMPTS: u32 = 10;
const READY_PROBE_SPACING: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const TERM_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("no available display id")]
    NoAvailableId,

    #[error("display {0} failed to become ready")]
    NotReady(String),

    #[error("refusing to target the user display {0}")]
    UserDisplay(String),

    #[error("screenshot failed for display {0}")]
    ScreenshotFailed(String),

    #[error("no AI display has been created")]
    NoAiDisplay,

    #[error("empty launch command")]
    EmptyCommand,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A child we spawned, tracked well enough to find and kill the whole
/// group later even if the leader re-execs.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub pgid: u32,
    pub command: String,
    pub expected_process_name: Option<String>,
}

struct OwnedDisplay {
    resolution: (u32, u32),
    server: Child,
}

/// Read-only view of an owned display for status surfaces and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayHandle {
    pub id: String,
    pub resolution: (u32, u32),
    pub created_by_us: bool,
}

/// Creates, owns, and tears down virtual X displays for automation.
///
/// The cardinal rule: a display this manager did not create is never torn
/// down by it. The `owned` map *is* the created-by-us set; every cleanup
/// path consults it and nothing else.
pub struct DisplayManager {
    user_display: String,
    /// Held only during spawn/teardown, never across a screenshot.
    owned: Mutex<HashMap<String, OwnedDisplay>>,
    ai_display: std::sync::Mutex<Option<String>>,
    children: std::sync::Mutex<Vec<ProcessInfo>>,
}

impl DisplayManager {
    pub fn new(user_display: impl Into<String>) -> Self {
        Self {
            user_display: user_display.into(),
            owned: Mutex::new(HashMap::new()),
            ai_display: std::sync::Mutex::new(None),
            children: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn user_display(&self) -> &str {
        &self.user_display
    }

    pub fn ai_display(&self) -> Option<String> {
        self.ai_display.lock().ok().and_then(|g| g.clone())
    }

    /// Adopt a pre-provisioned display (e.g. a system-managed Xvfb) as the
    /// AI display. It is not ours: teardown will never touch it.
    pub fn use_external_display(&self, id: &str) {
        if let Ok(mut ai) = self.ai_display.lock() {
            *ai = Some(id.to_string());
        }
        info!(display = %id, "using externally managed AI display");
    }

    pub fn ai_children(&self) -> Vec<ProcessInfo> {
        self.children.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub async fn handles(&self) -> Vec<DisplayHandle> {
        let owned = self.owned.lock().await;
        owned
            .iter()
            .map(|(id, d)| DisplayHandle {
                id: id.clone(),
                resolution: d.resolution,
                created_by_us: true,
            })
            .collect()
    }

    // ---------------- creation ----------------

    /// Create a virtual display for automation and return its id.
    pub async fn create_ai_display(
        &self,
        preferred: &str,
        resolution: (u32, u32),
    ) -> Result<String, DisplayError> {
        info!(preferred, ?resolution, "creating AI virtual display");

        for id in candidate_ids(preferred, &self.user_display) {
            if !is_display_available(&id).await {
                debug!(display = %id, "display already in use");
                continue;
            }
            match self.spawn_display(&id, resolution).await {
                Ok(()) => {
                    if let Ok(mut ai) = self.ai_display.lock() {
                        *ai = Some(id.clone());
                    }
                    info!(display = %id, "AI display ready");
                    return Ok(id);
                }
                Err(e) => {
                    warn!(display = %id, error = %e, "virtual display failed to start");
                }
            }
        }

        Err(DisplayError::NoAvailableId)
    }

    async fn spawn_display(&self, id: &str, resolution: (u32, u32)) -> Result<(), DisplayError> {
        let mut owned = self.owned.lock().await;

        // Re-creating an id we already own replaces the old server.
        if let Some(mut previous) = owned.remove(id) {
            info!(display = %id, "replacing our previous display");
            let _ = previous.server.start_kill();
            let _ = previous.server.wait().await;
        }

        // The probe said nothing is listening, so any lock files are stale.
        remove_lock_files(id);

        let (w, h) = resolution;
        let mut server = Command::new("Xvfb")
            .arg(id)
            .args(["-screen", "0"])
            .arg(format!("{w}x{h}x24"))
            .args(["-ac", "+extension", "GLX", "+render", "-noreset", "-nolisten", "tcp"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        for _ in 0..READY_PROBE_ATTEMPTS {
            tokio::time::sleep(READY_PROBE_SPACING).await;

            if let Ok(Some(status)) = server.try_wait() {
                remove_lock_files(id);
                return Err(DisplayError::NotReady(format!("{id} (Xvfb exit {status})")));
            }

            if display_answers(id).await {
                owned.insert(
                    id.to_string(),
                    OwnedDisplay {
                        resolution,
                        server,
                    },
                );
                drop(owned);
                self.setup_display_content(id).await;
                return Ok(());
            }
        }

        // Never leave a half-created server behind.
        let _ = server.start_kill();
        let _ = server.wait().await;
        remove_lock_files(id);
        Err(DisplayError::NotReady(id.to_string()))
    }

    /// Paint a background and start a lightweight window manager so apps
    /// have something to map onto. Best effort.
    async fn setup_display_content(&self, id: &str) {
        let _ = run_bounded(
            Command::new("xsetroot")
                .args(["-display", id, "-solid", "#2d2d2d"])
                .stdout(Stdio::null())
                .stderr(Stdio::null()),
            Duration::from_secs(5),
        )
        .await;

        let mut wm = Command::new("openbox");
        wm.arg("--replace");
        apply_display_env(&mut wm, id);
        match wm
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
        {
            Ok(child) => {
                if let Some(pid) = child.id() {
                    self.track_child(ProcessInfo {
                        pid,
                        pgid: pid,
                        command: "openbox --replace".to_string(),
                        expected_process_name: Some("openbox".to_string()),
                    });
                }
            }
            Err(e) => warn!(display = %id, error = %e, "could not start window manager"),
        }
    }

    // ---------------- screenshot ----------------

    /// Capture the framebuffer. Primary tool first, fallback second;
    /// success iff the output file exists and is non-empty.
    pub async fn screenshot(&self, display: &str, path: &Path) -> Result<(), DisplayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let ok = run_bounded(
            Command::new("scrot")
                .args(["--display", display])
                .arg(path)
                .stdout(Stdio::null())
                .stderr(Stdio::null()),
            SCREENSHOT_TIMEOUT,
        )
        .await;
        if ok && file_non_empty(path) {
            return Ok(());
        }

        let ok = run_bounded(
            Command::new("import")
                .args(["-display", display, "-window", "root"])
                .arg(path)
                .stdout(Stdio::null())
                .stderr(Stdio::null()),
            SCREENSHOT_TIMEOUT,
        )
        .await;
        if ok && file_non_empty(path) {
            return Ok(());
        }

        Err(DisplayError::ScreenshotFailed(display.to_string()))
    }

    // ---------------- launch ----------------

    /// Spawn an application onto `display`. Refuses the user display.
    pub async fn launch_on(
        &self,
        display: &str,
        alias: &str,
        extra_args: &[String],
    ) -> Result<ProcessInfo, DisplayError> {
        if display == self.user_display {
            return Err(DisplayError::UserDisplay(display.to_string()));
        }

        let mut argv = launch_command(alias);
        if argv.is_empty() {
            return Err(DisplayError::EmptyCommand);
        }
        argv.extend(extra_args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        apply_display_env(&mut cmd, display);

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("child exited before pid was read"))?;

        let info = ProcessInfo {
            pid,
            pgid: pid,
            command: argv.join(" "),
            expected_process_name: expected_process_name(&argv[0]),
        };
        self.track_child(info.clone());

        info!(display = %display, command = %info.command, pid, "launched application");
        Ok(info)
    }

    fn track_child(&self, info: ProcessInfo) {
        if let Ok(mut children) = self.children.lock() {
            children.push(info);
        }
    }

    // ---------------- liveness ----------------

    pub async fn is_alive(&self, id: &str) -> bool {
        {
            let mut owned = self.owned.lock().await;
            match owned.get_mut(id) {
                None => return false,
                Some(d) => {
                    if let Ok(Some(_)) = d.server.try_wait() {
                        return false;
                    }
                }
            }
        }
        display_answers(id).await
    }

    // ---------------- teardown ----------------

    /// Kill every automation-owned child process group. Used by the
    /// emergency stop before the displays themselves go away.
    pub async fn terminate_children(&self) {
        let children = {
            let Ok(mut guard) = self.children.lock() else {
                return;
            };
            std::mem::take(&mut *guard)
        };

        for info in children {
            kill_process_group(&info).await;
        }
    }

    /// Tear down every display we created. Displays we merely observed are
    /// left alone.
    pub async fn destroy_all(&self) {
        self.terminate_children().await;

        let mut owned = self.owned.lock().await;
        for (id, mut display) in owned.drain() {
            info!(display = %id, "terminating our display");

            if let Some(pid) = display.server.id() {
                let _ = run_bounded(
                    Command::new("kill").arg("-TERM").arg(format!("-{pid}")),
                    Duration::from_secs(1),
                )
                .await;
            }
            let still_running = tokio::time::timeout(TERM_GRACE, display.server.wait())
                .await
                .is_err();
            if still_running {
                warn!(display = %id, "graceful termination expired, killing group");
                let _ = display.server.start_kill();
                let _ = display.server.wait().await;
            }

            remove_lock_files(&id);
        }

        if let Ok(mut ai) = self.ai_display.lock() {
            *ai = None;
        }
    }
}

// ---------------- helpers ----------------

/// Candidate ids to try, alternatives first so the preferred id cannot
/// collide with a half-dead server, never the user's display number.
pub fn candidate_ids(preferred: &str, user_display: &str) -> Vec<String> {
    let user_num = display_number(user_display);
    let mut out = Vec::new();
    for id in [":10", ":20", ":30", ":99", ":1", preferred] {
        if display_number(id) == user_num || out.iter().any(|o| o == id) {
            continue;
        }
        out.push(id.to_string());
    }
    out
}

pub fn display_number(display: &str) -> String {
    display
        .split(':')
        .nth(1)
        .map(|rest| rest.split('.').next().unwrap_or("0").to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Sets the environment an automation child must see: the AI display and
/// no compositor overrides. The user display value never leaks through.
pub fn apply_display_env(cmd: &mut Command, display: &str) {
    cmd.env("DISPLAY", display);
    cmd.env_remove("WAYLAND_DISPLAY");
    cmd.env_remove("XDG_SESSION_TYPE");
}

/// The safer argument form for aliases that misbehave when launched bare.
pub fn launch_command(alias: &str) -> Vec<String> {
    match alias {
        "thunar" => vec!["thunar".into(), "--no-daemon".into()],
        "firefox-esr" => vec![
            "firefox-esr".into(),
            "--new-instance".into(),
            "--no-remote".into(),
        ],
        "firefox" => vec!["firefox".into(), "--new-instance".into(), "--no-remote".into()],
        other => vec![other.to_string()],
    }
}

fn expected_process_name(program: &str) -> Option<String> {
    Path::new(program)
        .file_name()
        .and_then(|s| s.to_str())
        .map(String::from)
}

/// A display is available iff a probe against it fails to connect.
async fn is_display_available(display: &str) -> bool {
    match probe_display(display).await {
        Some(answered) => !answered,
        None => true, // probe tool missing: assume available
    }
}

async fn display_answers(display: &str) -> bool {
    probe_display(display).await.unwrap_or(false)
}

async fn probe_display(display: &str) -> Option<bool> {
    let mut cmd = Command::new("xdpyinfo");
    cmd.args(["-display", display])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn().ok()?;
    match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(out)) => Some(out.status.success()),
        _ => Some(false),
    }
}

fn lock_files(display: &str) -> [PathBuf; 2] {
    let num = display_number(display);
    let tmp = std::env::temp_dir();
    [
        tmp.join(format!(".X{num}-lock")),
        tmp.join(".X11-unix").join(format!("X{num}")),
    ]
}

fn remove_lock_files(display: &str) {
    for lock in lock_files(display) {
        if lock.exists() {
            if let Err(e) = std::fs::remove_file(&lock) {
                debug!(path = %lock.display(), error = %e, "could not remove lock file");
            }
        }
    }
}

fn file_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

async fn run_bounded(cmd: &mut Command, limit: Duration) -> bool {
    let spawned = cmd.stdin(Stdio::null()).spawn();
    let Ok(child) = spawned else {
        return false;
    };
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(out)) => out.status.success(),
        _ => false,
    }
}

/// Teacher-style group kill: TERM the group, give it a moment, KILL what
/// is left.
pub async fn kill_process_group(info: &ProcessInfo) {
    let _ = run_bounded(
        Command::new("kill").arg("-TERM").arg(format!("-{}", info.pgid)),
        Duration::from_secs(1),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    if process_group_alive(info) {
        warn!(pgid = info.pgid, "process group survived TERM, sending KILL");
        let _ = run_bounded(
            Command::new("kill").arg("-KILL").arg(format!("-{}", info.pgid)),
            Duration::from_secs(1),
        )
        .await;
    }
}

fn process_group_alive(info: &ProcessInfo) -> bool {
    Path::new(&format!("/proc/{}", info.pid)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_skip_user_display_number() {
        let ids = candidate_ids(":1", ":0");
        assert!(!ids.iter().any(|id| display_number(id) == "0"));
        assert!(ids.contains(&":10".to_string()));
        // Preferred id appears exactly once even though it is also an
        // alternative.
        assert_eq!(ids.iter().filter(|id| *id == ":1").count(), 1);
    }

    #[test]
    fn candidates_exclude_preferred_when_it_is_the_user_display() {
        let ids = candidate_ids(":0", ":0");
        assert!(!ids.contains(&":0".to_string()));
        assert!(!ids.is_empty());
    }

    #[test]
    fn display_number_parses_screen_suffix() {
        assert_eq!(display_number(":1"), "1");
        assert_eq!(display_number(":10.0"), "10");
        assert_eq!(display_number("bogus"), "0");
    }

    #[test]
    fn alias_table_provides_safer_argument_forms() {
        assert_eq!(launch_command("thunar"), vec!["thunar", "--no-daemon"]);
        assert!(launch_command("firefox-esr").contains(&"--no-remote".to_string()));
        assert_eq!(launch_command("galculator"), vec!["galculator"]);
    }

    #[test]
    fn lock_file_paths_follow_x11_convention() {
        let [a, b] = lock_files(":42");
        assert!(a.ends_with(".X42-lock"));
        assert!(b.ends_with("X42"));
    }
}
