// Author: BlackIce Project
// License: MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::events::EventKind;

pub const DEFAULT_QUEUE_BOUND: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub ts: DateTime<Utc>,
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

/// Single-producer-multiple-consumer fan-out with bounded per-subscriber
/// queues. A full queue drops the event for that subscriber only and bumps
/// its counter; the publisher never blocks. Events stay in-order per
/// subscriber. Closed receivers are pruned on the next publish, so
/// subscriber lifetimes never depend on the bus.
pub struct EventBus {
    subs: Mutex<Vec<Subscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. Returns its queue plus the drop counter.
    pub fn subscribe(
        &self,
        name: &str,
        bound: usize,
    ) -> (mpsc::Receiver<BusEvent>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(bound.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        if let Ok(mut subs) = self.subs.lock() {
            subs.push(Subscriber {
                name: name.to_string(),
                tx,
                dropped: Arc::clone(&dropped),
            });
        }
        (rx, dropped)
    }

    pub fn publish(&self, task_id: Option<&str>, kind: EventKind) {
        let event = BusEvent {
            ts: Utc::now(),
            task_id: task_id.map(String::from),
            kind,
        };

        let Ok(mut subs) = self.subs.lock() else {
            return;
        };
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = %sub.name, "pruning closed bus subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::TerminalStatus;

    #[test]
    fn events_arrive_in_order_per_subscriber() {
        let bus = EventBus::new();
        let (mut rx, _) = bus.subscribe("ui", 16);

        bus.publish(Some("t-1"), EventKind::TaskStarted);
        bus.publish(Some("t-1"), EventKind::StepStarted { index: 0 });
        bus.publish(
            Some("t-1"),
            EventKind::StepCompleted { index: 0, ok: true },
        );

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::TaskStarted);
        assert_eq!(
            rx.try_recv().unwrap().kind,
            EventKind::StepStarted { index: 0 }
        );
        assert_eq!(
            rx.try_recv().unwrap().kind,
            EventKind::StepCompleted { index: 0, ok: true }
        );
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let bus = EventBus::new();
        let (mut small_rx, small_dropped) = bus.subscribe("small", 1);
        let (mut big_rx, big_dropped) = bus.subscribe("big", 16);

        for i in 0..4 {
            bus.publish(None, EventKind::StepStarted { index: i });
        }

        assert_eq!(small_dropped.load(Ordering::Relaxed), 3);
        assert_eq!(big_dropped.load(Ordering::Relaxed), 0);

        // The slow subscriber still got the first event, in order.
        assert_eq!(
            small_rx.try_recv().unwrap().kind,
            EventKind::StepStarted { index: 0 }
        );
        let mut seen = 0;
        while big_rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let (rx, _) = bus.subscribe("gone", 4);
        drop(rx);

        bus.publish(
            Some("t-1"),
            EventKind::TaskCompleted {
                status: TerminalStatus::Completed,
                reason: None,
            },
        );
        assert_eq!(bus.subscriber_count(), 0);
    }
}
