// Author: BlackIce Project
// License: MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::MonitorSettings;
use crate::core::events::{ActivityLevel, SafetyVerdict};
use crate::safety::StopFlag;

const WAIT_POLL: Duration = Duration::from_millis(500);

/// Host-input recency, fed by the input listener. Only timestamps are
/// retained; key contents never reach this process's state.
#[derive(Debug)]
pub struct InputActivity {
    last_mouse_ms: AtomicU64,
    last_key_ms: AtomicU64,
}

impl InputActivity {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_mouse_ms: AtomicU64::new(now_ms),
            last_key_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn touch_mouse(&self, now_ms: u64) {
        self.last_mouse_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn touch_key(&self, now_ms: u64) {
        self.last_key_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_mouse_ms(&self) -> u64 {
        self.last_mouse_ms.load(Ordering::Relaxed)
    }

    pub fn last_key_ms(&self) -> u64 {
        self.last_key_ms.load(Ordering::Relaxed)
    }
}

/// Host sensor readings. The real implementation samples procfs; tests
/// inject fixed values.
pub trait Sensors: Send + Sync {
    /// Aggregate non-idle CPU percent since the previous sample.
    fn cpu_percent(&self) -> Option<f32>;
    fn memory_percent(&self) -> Option<f32>;
    /// Lowercased "name cmdline" strings for every visible process.
    fn process_lines(&self) -> Option<Vec<String>>;
}

/// procfs-backed sensors. CPU percent is the busy-tick delta between two
/// consecutive calls; the first call primes the baseline.
pub struct ProcSensors {
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl Default for ProcSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSensors {
    pub fn new() -> Self {
        Self {
            last_cpu: Mutex::new(None),
        }
    }
}

impl Sensors for ProcSensors {
    fn cpu_percent(&self) -> Option<f32> {
        let stat = procfs::KernelStats::current().ok()?;
        let cpu = stat.total;
        let idle = cpu.idle + cpu.iowait.unwrap_or(0);
        let total = cpu.user
            + cpu.nice
            + cpu.system
            + idle
            + cpu.irq.unwrap_or(0)
            + cpu.softirq.unwrap_or(0)
            + cpu.steal.unwrap_or(0);
        let busy = total - idle;

        let mut last = self.last_cpu.lock().ok()?;
        let percent = match *last {
            Some((prev_busy, prev_total)) => {
                let dt = total.saturating_sub(prev_total);
                if dt == 0 {
                    0.0
                } else {
                    busy.saturating_sub(prev_busy) as f32 / dt as f32 * 100.0
                }
            }
            None => 0.0,
        };
        *last = Some((busy, total));
        Some(percent)
    }

    fn memory_percent(&self) -> Option<f32> {
        let mem = procfs::Meminfo::current().ok()?;
        let total = mem.mem_total as f32;
        if total <= 0.0 {
            return None;
        }
        let available = mem.mem_available.unwrap_or(mem.mem_free) as f32;
        Some((total - available) / total * 100.0)
    }

    fn process_lines(&self) -> Option<Vec<String>> {
        let procs = procfs::process::all_processes().ok()?;
        let mut lines = Vec::new();
        for proc in procs.flatten() {
            let name = proc
                .stat()
                .map(|s| s.comm)
                .unwrap_or_default()
                .to_lowercase();
            let cmdline = proc
                .cmdline()
                .map(|c| c.join(" "))
                .unwrap_or_default()
                .to_lowercase();
            if name.is_empty() && cmdline.is_empty() {
                continue;
            }
            lines.push(format!("{name} {cmdline}"));
        }
        Some(lines)
    }
}

type VerdictSubscriber = Box<dyn Fn(SafetyVerdict) + Send + Sync>;

/// Classifies user engagement and answers "is it safe to automate right
/// now". Fails toward Intensive/blocked whenever a sensor errors.
pub struct ActivityMonitor {
    input: Arc<InputActivity>,
    sensors: Box<dyn Sensors>,
    cfg: MonitorSettings,
    critical_processes: Vec<String>,
    stop: Arc<StopFlag>,
    subscribers: Mutex<Vec<VerdictSubscriber>>,
    last_notified: Mutex<Option<SafetyVerdict>>,
}

impl ActivityMonitor {
    pub fn new(
        input: Arc<InputActivity>,
        sensors: Box<dyn Sensors>,
        cfg: MonitorSettings,
        critical_processes: Vec<String>,
        stop: Arc<StopFlag>,
    ) -> Self {
        Self {
            input,
            sensors,
            cfg,
            critical_processes: critical_processes
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
            stop,
            subscribers: Mutex::new(Vec::new()),
            last_notified: Mutex::new(None),
        }
    }

    pub fn input(&self) -> Arc<InputActivity> {
        Arc::clone(&self.input)
    }

    pub fn subscribe(&self, f: VerdictSubscriber) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(f);
        }
    }

    pub fn current_level(&self) -> ActivityLevel {
        self.level_at(now_ms())
    }

    fn level_at(&self, now_ms: u64) -> ActivityLevel {
        let mouse_idle = now_ms.saturating_sub(self.input.last_mouse_ms()) / 1000;
        let key_idle = now_ms.saturating_sub(self.input.last_key_ms()) / 1000;

        let Some(cpu) = self.sensors.cpu_percent() else {
            warn!("cpu sensor failed, reporting Intensive");
            return ActivityLevel::Intensive;
        };

        if mouse_idle > self.cfg.idle_secs
            && key_idle > self.cfg.idle_secs
            && cpu < self.cfg.idle_cpu_floor
        {
            ActivityLevel::Idle
        } else if mouse_idle > self.cfg.light_secs
            || key_idle > self.cfg.light_secs
            || cpu < self.cfg.light_cpu_floor
        {
            ActivityLevel::Light
        } else {
            ActivityLevel::Intensive
        }
    }

    pub fn safety_verdict(&self) -> SafetyVerdict {
        let lines = match self.sensors.process_lines() {
            Some(lines) => lines,
            None => {
                warn!("process sensor failed, assuming a critical task");
                return SafetyVerdict::BlockedByCriticalApp;
            }
        };

        if let Some(hit) = self.match_any(&lines, &self.critical_processes) {
            debug!(process = %hit, "critical process active");
            return SafetyVerdict::BlockedByCriticalApp;
        }

        if let Some(hit) = self.match_any(&lines, &self.cfg.presentation_indicators) {
            debug!(indicator = %hit, "presentation mode active");
            return SafetyVerdict::BlockedByPresentation;
        }

        let cpu = self.sensors.cpu_percent();
        let mem = self.sensors.memory_percent();
        match (cpu, mem) {
            (Some(cpu), Some(mem)) => {
                if cpu > self.cfg.max_cpu_percent || mem > self.cfg.max_memory_percent {
                    return SafetyVerdict::BlockedByResources;
                }
            }
            _ => return SafetyVerdict::BlockedByResources,
        }

        match self.current_level() {
            ActivityLevel::Intensive => SafetyVerdict::BlockedByActivity,
            _ => SafetyVerdict::Safe,
        }
    }

    fn match_any<'a>(&self, lines: &[String], needles: &'a [String]) -> Option<&'a str> {
        needles.iter().find_map(|needle| {
            let n = needle.to_lowercase();
            lines
                .iter()
                .any(|line| line.contains(&n))
                .then_some(needle.as_str())
        })
    }

    /// Blocks until the verdict turns Safe, the timeout expires, or a stop
    /// is requested. True iff it became safe.
    pub async fn wait_for_safe(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stop_rx = self.stop.watch();

        loop {
            if self.stop.is_set() {
                return false;
            }
            if self.safety_verdict().is_safe() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining.min(WAIT_POLL)) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// Called on the safety sweep cadence; notifies subscribers when the
    /// verdict changes.
    pub fn poll_and_notify(&self) -> SafetyVerdict {
        let verdict = self.safety_verdict();
        let changed = {
            let Ok(mut last) = self.last_notified.lock() else {
                return verdict;
            };
            if *last == Some(verdict) {
                false
            } else {
                *last = Some(verdict);
                true
            }
        };
        if changed {
            if let Ok(subs) = self.subscribers.lock() {
                for sub in subs.iter() {
                    sub(verdict);
                }
            }
        }
        verdict
    }
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

    struct FakeSensors {
        cpu: Mutex<Option<f32>>,
        mem: Option<f32>,
        lines: Option<Vec<String>>,
    }

    impl FakeSensors {
        fn quiet() -> Self {
            Self {
                cpu: Mutex::new(Some(1.0)),
                mem: Some(20.0),
                lines: Some(vec!["bash ".to_string()]),
            }
        }
    }

    impl Sensors for FakeSensors {
        fn cpu_percent(&self) -> Option<f32> {
            *self.cpu.lock().unwrap()
        }
        fn memory_percent(&self) -> Option<f32> {
            self.mem
        }
        fn process_lines(&self) -> Option<Vec<String>> {
            self.lines.clone()
        }
    }

    fn monitor_with(sensors: FakeSensors, input_ms: u64) -> ActivityMonitor {
        ActivityMonitor::new(
            Arc::new(InputActivity::new(input_ms)),
            Box::new(sensors),
            MonitorSettings::default(),
            vec!["zoom".to_string()],
            Arc::new(StopFlag::new()),
        )
    }

    #[test]
    fn long_silence_and_low_cpu_is_idle() {
        let m = monitor_with(FakeSensors::quiet(), 0);
        assert_eq!(m.level_at(400_000), ActivityLevel::Idle);
    }

    #[test]
    fn recent_input_with_busy_cpu_is_intensive() {
        let sensors = FakeSensors {
            cpu: Mutex::new(Some(60.0)),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 100_000);
        assert_eq!(m.level_at(101_000), ActivityLevel::Intensive);
    }

    #[test]
    fn cpu_sensor_failure_is_intensive() {
        let sensors = FakeSensors {
            cpu: Mutex::new(None),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert_eq!(m.level_at(500_000), ActivityLevel::Intensive);
    }

    #[test]
    fn critical_process_blocks_before_anything_else() {
        let sensors = FakeSensors {
            lines: Some(vec!["zoom --meeting".to_string()]),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert_eq!(m.safety_verdict(), SafetyVerdict::BlockedByCriticalApp);
    }

    #[test]
    fn presentation_indicator_blocks() {
        let sensors = FakeSensors {
            lines: Some(vec!["soffice.bin soffice.bin --impress deck.odp".to_string()]),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert_eq!(m.safety_verdict(), SafetyVerdict::BlockedByPresentation);
    }

    #[test]
    fn overloaded_vm_blocks_by_resources() {
        let sensors = FakeSensors {
            cpu: Mutex::new(Some(95.0)),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert_eq!(m.safety_verdict(), SafetyVerdict::BlockedByResources);
    }

    #[test]
    fn quiet_host_is_safe() {
        let m = monitor_with(FakeSensors::quiet(), 0);
        assert_eq!(m.safety_verdict(), SafetyVerdict::Safe);
    }

    #[test]
    fn process_sensor_failure_fails_closed() {
        let sensors = FakeSensors {
            lines: None,
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert_eq!(m.safety_verdict(), SafetyVerdict::BlockedByCriticalApp);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_safe_times_out_while_blocked() {
        let sensors = FakeSensors {
            lines: Some(vec!["zoom --meeting".to_string()]),
            ..FakeSensors::quiet()
        };
        let m = monitor_with(sensors, 0);
        assert!(!m.wait_for_safe(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn wait_for_safe_returns_immediately_when_safe() {
        let m = monitor_with(FakeSensors::quiet(), 0);
        assert!(m.wait_for_safe(Duration::from_secs(1)).await);
    }

    #[test]
    fn verdict_change_notifies_subscribers_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let m = monitor_with(FakeSensors::quiet(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        m.subscribe(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        m.poll_and_notify();
        m.poll_and_notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
