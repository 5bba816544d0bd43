// Author: BlackIce Project
// License: MIT

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::IsolationSettings;
use crate::core::events::{EventKind, ViolationKind};
use crate::display::{apply_display_env, DisplayManager};

const WINDOW_LIST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

/// Periodically checks that automation side-effects stay inside the AI
/// display. Violations feed a sliding budget; exhausting it is the
/// caller's cue to pull the emergency brake.
pub struct IsolationVerifier {
    displays: Arc<DisplayManager>,
    bus: Arc<EventBus>,
    cfg: IsolationSettings,
    violations: Mutex<VecDeque<u64>>,
    /// Per-pid (utime+stime ticks, sample ms) baseline for CPU deltas.
    cpu_baseline: Mutex<HashMap<u32, (u64, u64)>>,
}

impl IsolationVerifier {
    pub fn new(displays: Arc<DisplayManager>, bus: Arc<EventBus>, cfg: IsolationSettings) -> Self {
        Self {
            displays,
            bus,
            cfg,
            violations: Mutex::new(VecDeque::new()),
            cpu_baseline: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs.max(1))
    }

    /// Run all four checks once. Each violation is recorded against the
    /// budget and published on the bus.
    pub async fn run_checks(&self) -> Vec<Violation> {
        let Some(ai_display) = self.displays.ai_display() else {
            return Vec::new(); // nothing to isolate yet
        };
        let user_display = self.displays.user_display().to_string();

        let mut found = Vec::new();
        found.extend(self.check_display(&ai_display, &user_display));
        found.extend(self.check_process(&ai_display, &user_display));
        found.extend(self.check_window(&ai_display, &user_display).await);
        found.extend(self.check_resource());

        for violation in &found {
            warn!(kind = ?violation.kind, detail = %violation.detail, "isolation violation");
            self.record(violation.kind);
        }
        found
    }

    /// Whether the sliding window has more violations than the budget
    /// allows.
    pub fn over_budget(&self) -> bool {
        let Ok(mut window) = self.violations.lock() else {
            return true;
        };
        Self::evict(&mut window, now_ms(), self.cfg.violation_window_secs);
        window.len() as u32 > self.cfg.max_violations
    }

    pub fn violation_count(&self) -> u32 {
        self.violations.lock().map(|w| w.len() as u32).unwrap_or(0)
    }

    fn record(&self, kind: ViolationKind) {
        if let Ok(mut window) = self.violations.lock() {
            let now = now_ms();
            Self::evict(&mut window, now, self.cfg.violation_window_secs);
            window.push_back(now);
        }
        self.bus.publish(None, EventKind::ViolationDetected { kind });
    }

    fn evict(window: &mut VecDeque<u64>, now_ms: u64, window_secs: u64) {
        let horizon = window_secs.saturating_mul(1000);
        while let Some(&front) = window.front() {
            if now_ms.saturating_sub(front) > horizon {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    // ---------------- display check ----------------

    /// Our own process and every automation child must see the AI display.
    /// The local env var is self-healed; a child pointing at the user
    /// display is recorded (its environment is not ours to rewrite).
    fn check_display(&self, ai_display: &str, user_display: &str) -> Vec<Violation> {
        let mut out = Vec::new();

        let own = std::env::var("DISPLAY").unwrap_or_default();
        if own == user_display {
            out.push(Violation {
                kind: ViolationKind::Display,
                detail: format!("automation process on {own}, should be {ai_display}"),
            });
            std::env::set_var("DISPLAY", ai_display);
            debug!(display = ai_display, "self-healed DISPLAY");
        }

        for child in self.displays.ai_children() {
            match process_display(child.pid) {
                Some(display) if display == user_display => out.push(Violation {
                    kind: ViolationKind::Display,
                    detail: format!(
                        "child {} ({}) reports the user display",
                        child.pid, child.command
                    ),
                }),
                _ => {}
            }
        }

        out
    }

    // ---------------- process check ----------------

    fn check_process(&self, ai_display: &str, user_display: &str) -> Vec<Violation> {
        let Some(by_display) = process_names_by_display() else {
            return Vec::new();
        };
        let empty = HashSet::new();
        let ai = by_display.get(ai_display).unwrap_or(&empty);
        let user = by_display.get(user_display).unwrap_or(&empty);

        name_overlap(ai, user)
            .into_iter()
            .map(|name| Violation {
                kind: ViolationKind::Process,
                detail: format!("process on both displays: {name}"),
            })
            .collect()
    }

    // ---------------- window check ----------------

    async fn check_window(&self, ai_display: &str, user_display: &str) -> Vec<Violation> {
        let (ai_titles, user_titles) = tokio::join!(
            window_titles(ai_display),
            window_titles(user_display)
        );
        let (Some(ai_titles), Some(user_titles)) = (ai_titles, user_titles) else {
            return Vec::new(); // listing tool unavailable: no signal
        };

        titles_overlap(&ai_titles, &user_titles)
            .into_iter()
            .map(|title| Violation {
                kind: ViolationKind::Window,
                detail: format!("window title on both displays: {title}"),
            })
            .collect()
    }

    // ---------------- resource check ----------------

    fn check_resource(&self) -> Vec<Violation> {
        let children = self.displays.ai_children();
        if children.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let now = now_ms();
        let tick_hz = procfs::ticks_per_second() as f32;

        let mut total_rss_mb = 0u64;
        let mut total_cpu_percent = 0.0f32;

        let Ok(mut baseline) = self.cpu_baseline.lock() else {
            return Vec::new();
        };

        for child in &children {
            let Ok(proc) = procfs::process::Process::new(child.pid as i32) else {
                baseline.remove(&child.pid);
                continue;
            };
            let Ok(stat) = proc.stat() else { continue };

            total_rss_mb += stat.rss.max(0) as u64 * procfs::page_size() / (1024 * 1024);

            let ticks = stat.utime + stat.stime;
            if let Some((prev_ticks, prev_ms)) = baseline.get(&child.pid).copied() {
                let dt_ms = now.saturating_sub(prev_ms);
                if dt_ms > 0 {
                    let used = ticks.saturating_sub(prev_ticks) as f32 / tick_hz;
                    total_cpu_percent += used / (dt_ms as f32 / 1000.0) * 100.0;
                }
            }
            baseline.insert(child.pid, (ticks, now));
        }

        if total_cpu_percent > self.cfg.max_ai_cpu_percent {
            out.push(Violation {
                kind: ViolationKind::Resource,
                detail: format!("AI cpu usage {total_cpu_percent:.0}% over cap"),
            });
        }
        if total_rss_mb > self.cfg.max_ai_memory_mb {
            out.push(Violation {
                kind: ViolationKind::Resource,
                detail: format!("AI memory usage {total_rss_mb} MB over cap"),
            });
        }
        out
    }
}

// ---------------- probes ----------------

fn process_display(pid: u32) -> Option<String> {
    let proc = procfs::process::Process::new(pid as i32).ok()?;
    let environ = proc.environ().ok()?;
    environ
        .get(std::ffi::OsStr::new("DISPLAY"))
        .map(|v| v.to_string_lossy().into_owned())
}

fn process_names_by_display() -> Option<HashMap<String, HashSet<String>>> {
    let procs = procfs::process::all_processes().ok()?;
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for proc in procs.flatten() {
        let Ok(environ) = proc.environ() else { continue };
        let Some(display) = environ.get(std::ffi::OsStr::new("DISPLAY")) else {
            continue;
        };
        let Ok(stat) = proc.stat() else { continue };
        map.entry(display.to_string_lossy().into_owned())
            .or_default()
            .insert(stat.comm);
    }
    Some(map)
}

async fn window_titles(display: &str) -> Option<HashSet<String>> {
    let mut cmd = Command::new("wmctrl");
    cmd.arg("-l");
    apply_display_env(&mut cmd, display);
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let out = tokio::time::timeout(WINDOW_LIST_TIMEOUT, child.wait_with_output())
        .await
        .ok()?
        .ok()?;
    if !out.status.success() {
        return None;
    }

    // wmctrl -l: "<id> <desktop> <host> <title...>"
    let titles = String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line.splitn(4, char::is_whitespace).nth(3))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Some(titles)
}

/// Names present on both displays. The display servers themselves always
/// straddle, so they are exempt.
fn name_overlap(ai: &HashSet<String>, user: &HashSet<String>) -> Vec<String> {
    const EXEMPT: &[&str] = &["Xvfb", "Xorg", "X"];
    let mut names: Vec<String> = ai
        .intersection(user)
        .filter(|n| !EXEMPT.contains(&n.as_str()))
        .cloned()
        .collect();
    names.sort();
    names
}

fn titles_overlap(ai: &HashSet<String>, user: &HashSet<String>) -> Vec<String> {
    let mut titles: Vec<String> = ai.intersection(user).cloned().collect();
    titles.sort();
    titles
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

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn overlap_ignores_display_servers() {
        let ai = set(&["firefox", "Xvfb"]);
        let user = set(&["firefox", "Xvfb", "bash"]);
        assert_eq!(name_overlap(&ai, &user), vec!["firefox".to_string()]);
    }

    #[test]
    fn disjoint_sets_are_clean() {
        let ai = set(&["galculator"]);
        let user = set(&["thunderbird"]);
        assert!(name_overlap(&ai, &user).is_empty());
        assert!(titles_overlap(&ai, &user).is_empty());
    }

    #[test]
    fn violation_window_evicts_old_entries() {
        let mut window: VecDeque<u64> = VecDeque::from([0, 1_000, 50_000, 99_000]);
        IsolationVerifier::evict(&mut window, 100_000, 60);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn budget_counts_recorded_violations() {
        let displays = Arc::new(DisplayManager::new(":0"));
        let bus = Arc::new(EventBus::new());
        let (mut rx, _) = bus.subscribe("test", 32);
        let cfg = IsolationSettings {
            max_violations: 2,
            ..IsolationSettings::default()
        };
        let verifier = IsolationVerifier::new(displays, Arc::clone(&bus), cfg);

        for _ in 0..3 {
            verifier.record(ViolationKind::Display);
        }
        assert!(verifier.over_budget());

        let mut seen = 0;
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(
                ev.kind,
                EventKind::ViolationDetected {
                    kind: ViolationKind::Display
                }
            );
            seen += 1;
        }
        assert_eq!(seen, 3);
    }
}
