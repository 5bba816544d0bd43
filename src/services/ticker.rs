// Author: BlackIce Project
// License: MIT

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::events::StopSource;
use crate::isolation::IsolationVerifier;
use crate::monitor::ActivityMonitor;
use crate::safety::EmergencyStop;

/// Periodic safety sweep: isolation checks while tasks are running, plus
/// the activity-verdict change notifications. Exhausting the violation
/// budget pulls the emergency brake with source=IsolationBreach.
pub fn spawn_safety_sweep(
    verifier: Arc<IsolationVerifier>,
    monitor: Arc<ActivityMonitor>,
    emergency: Arc<EmergencyStop>,
    running_tasks: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!("safety sweep started");
        let mut tick = tokio::time::interval(verifier.interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("safety sweep stopping");
                        return;
                    }
                }
            }

            monitor.poll_and_notify();

            if running_tasks.load(Ordering::SeqCst) == 0 {
                continue;
            }

            let violations = verifier.run_checks().await;
            if !violations.is_empty() && verifier.over_budget() {
                warn!(
                    count = verifier.violation_count(),
                    "isolation violation budget exhausted"
                );
                emergency.trigger(StopSource::IsolationBreach).await;
            }
        }
    });
}
