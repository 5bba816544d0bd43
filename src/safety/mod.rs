// Author: BlackIce Project
// License: MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::core::events::{EventKind, StopSource};
use crate::display::DisplayManager;

/// How long duplicate triggers are latched before `reset` (or auto-reset)
/// re-arms the sequence.
const LATCH_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("invalid emergency hotkey: {0}")]
    InvalidHotkey(String),

    #[error("emergency stop already armed")]
    AlreadyArmed,
}

/// Global "stop requested" flag observed by the executor and every task
/// runtime. Cheap to poll, watchable for wakeups.
pub struct StopFlag {
    flag: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            flag: AtomicBool::new(false),
            tx,
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
        let _ = self.tx.send(false);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Best-effort user notification sink. The zbus implementation lives in
/// the services layer; tests plug in a recorder.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &str, body: &str, critical: bool);
}

/// A notifier for contexts where no desktop bus is reachable.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _summary: &str, _body: &str, _critical: bool) {}
}

type StopSubscriber = Box<dyn Fn(StopSource) + Send + Sync>;

/// Emergency stop: first trigger inside a latch window runs the full halt
/// sequence exactly once; later triggers are deduplicated until reset.
pub struct EmergencyStop {
    stop: Arc<StopFlag>,
    bus: Arc<EventBus>,
    displays: Arc<DisplayManager>,
    notifier: Arc<dyn Notifier>,

    armed: AtomicBool,
    hotkey: Mutex<String>,
    latched_at: Mutex<Option<Instant>>,
    auto_reset: bool,
    subscribers: Mutex<Vec<StopSubscriber>>,
}

impl EmergencyStop {
    pub fn new(
        stop: Arc<StopFlag>,
        bus: Arc<EventBus>,
        displays: Arc<DisplayManager>,
        notifier: Arc<dyn Notifier>,
        auto_reset: bool,
    ) -> Self {
        Self {
            stop,
            bus,
            displays,
            notifier,
            armed: AtomicBool::new(false),
            hotkey: Mutex::new(String::new()),
            latched_at: Mutex::new(None),
            auto_reset,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Validate and record the hotkey. The input service reads it back to
    /// know which key code to watch.
    pub fn arm(&self, hotkey: &str) -> Result<(), SafetyError> {
        if parse_hotkey(hotkey).is_none() {
            return Err(SafetyError::InvalidHotkey(hotkey.to_string()));
        }
        if let Ok(mut h) = self.hotkey.lock() {
            *h = hotkey.to_string();
        }
        self.armed.store(true, Ordering::SeqCst);
        info!(hotkey, "emergency stop armed");
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn hotkey(&self) -> String {
        self.hotkey.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn subscribe(&self, f: StopSubscriber) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(f);
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latched_at
            .lock()
            .map(|l| l.is_some())
            .unwrap_or(true)
    }

    /// Re-arm after an emergency has been handled.
    pub fn reset(&self) {
        if let Ok(mut latch) = self.latched_at.lock() {
            *latch = None;
        }
        self.stop.clear();
        info!("emergency state reset");
    }

    /// Run the halt sequence. Exactly-once per latch window.
    pub async fn trigger(&self, source: StopSource) {
        {
            let Ok(mut latch) = self.latched_at.lock() else {
                return;
            };
            match *latch {
                Some(at) if !self.auto_reset || at.elapsed() < LATCH_WINDOW => {
                    return; // deduplicated
                }
                _ => *latch = Some(Instant::now()),
            }
        }

        error!(?source, "EMERGENCY STOP TRIGGERED");

        // 1. Everyone observing the flag finishes its current action and
        //    surrenders.
        self.stop.set();

        // 2. Broadcast before the slow teardown work.
        self.bus.publish(None, EventKind::EmergencyStop { source });

        // 3. Subscribers run isolated; one failing must not abort the rest.
        if let Ok(subs) = self.subscribers.lock() {
            for sub in subs.iter() {
                let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sub(source)));
                if call.is_err() {
                    warn!("emergency subscriber panicked; continuing sequence");
                }
            }
        }

        // 4. Kill automation-owned children and mark displays for teardown.
        self.displays.destroy_all().await;
        if let Some(id) = self.displays.ai_display() {
            self.bus.publish(None, EventKind::DisplayLost { id });
        }

        // 5. Restore the environment of this process to the user display.
        restore_user_environment(self.displays.user_display());

        // 6. Tell the human.
        self.notifier.notify(
            "Emergency Stop",
            "Desktop automation has been stopped",
            true,
        );

        error!("emergency stop sequence completed");
    }
}

/// Environment variables scoped to automation; cleared on emergency.
const AUTOMATION_VARS: &[&str] = &["AI_DISPLAY", "AUTOMATION_ACTIVE", "TEMPLATE_DIR"];

fn restore_user_environment(user_display: &str) {
    std::env::set_var("DISPLAY", user_display);
    for var in AUTOMATION_VARS {
        std::env::remove_var(var);
    }
    info!(display = user_display, "environment restored to user desktop");
}

/// Parsed hotkey → evdev key code the input listener matches against.
pub fn parse_hotkey(key: &str) -> Option<u32> {
    let key = key.trim();
    let upper = key.to_uppercase();

    // Function keys F1..=F12: evdev KEY_F1..KEY_F10 are 59..68, F11/F12
    // are 87/88.
    if let Some(num) = upper.strip_prefix('F').and_then(|n| n.parse::<u32>().ok()) {
        return match num {
            1..=10 => Some(58 + num),
            11 => Some(87),
            12 => Some(88),
            _ => None,
        };
    }

    match upper.as_str() {
        "ESC" | "ESCAPE" => Some(1),
        "TAB" => Some(15),
        "SPACE" => Some(57),
        "ENTER" => Some(28),
        "DELETE" => Some(111),
        "BACKSPACE" => Some(14),
        "SCROLLLOCK" | "SCROLL_LOCK" => Some(70),
        "PAUSE" => Some(119),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotkey_parsing_covers_function_and_special_keys() {
        assert_eq!(parse_hotkey("F12"), Some(88));
        assert_eq!(parse_hotkey("f1"), Some(59));
        assert_eq!(parse_hotkey("F11"), Some(87));
        assert_eq!(parse_hotkey("esc"), Some(1));
        assert_eq!(parse_hotkey("F13"), None);
        assert_eq!(parse_hotkey("q"), None);
        assert_eq!(parse_hotkey(""), None);
    }

    fn harness() -> (Arc<StopFlag>, EmergencyStop) {
        let stop = Arc::new(StopFlag::new());
        let bus = Arc::new(EventBus::new());
        let displays = Arc::new(DisplayManager::new(":0"));
        let es = EmergencyStop::new(
            Arc::clone(&stop),
            bus,
            displays,
            Arc::new(NullNotifier),
            false,
        );
        (stop, es)
    }

    #[tokio::test]
    async fn trigger_is_exactly_once_until_reset() {
        let (stop, es) = harness();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&count);
        es.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        es.trigger(StopSource::Manual).await;
        es.trigger(StopSource::Hotkey).await;
        es.trigger(StopSource::Manual).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(stop.is_set());
        assert!(es.is_latched());

        es.reset();
        assert!(!stop.is_set());
        es.trigger(StopSource::Manual).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_abort_the_sequence() {
        let (stop, es) = harness();
        let reached = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reached);
        es.subscribe(Box::new(|_| panic!("bad subscriber")));
        es.subscribe(Box::new(move |_| {
            r.store(true, Ordering::SeqCst);
        }));

        es.trigger(StopSource::Internal).await;
        assert!(reached.load(Ordering::SeqCst));
        assert!(stop.is_set());
    }

    #[tokio::test]
    async fn arm_rejects_nonsense_keys() {
        let (_, es) = harness();
        assert!(es.arm("F12").is_ok());
        assert!(es.is_armed());
        assert!(matches!(
            es.arm("notakey"),
            Err(SafetyError::InvalidHotkey(_))
        ));
    }

    #[tokio::test]
    async fn emergency_broadcasts_on_the_bus() {
        let stop = Arc::new(StopFlag::new());
        let bus = Arc::new(EventBus::new());
        let (mut rx, _) = bus.subscribe("test", 8);
        let displays = Arc::new(DisplayManager::new(":0"));
        let es = EmergencyStop::new(
            stop,
            Arc::clone(&bus),
            displays,
            Arc::new(NullNotifier),
            false,
        );

        es.trigger(StopSource::IsolationBreach).await;
        let ev = rx.try_recv().unwrap();
        assert_eq!(
            ev.kind,
            EventKind::EmergencyStop {
                source: StopSource::IsolationBreach
            }
        );
    }
}
