// Author: BlackIce Project
// License: MIT

pub mod audit;
pub mod patterns;

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::config::Policy;
use crate::core::action::{Action, ActionKind};

use audit::{ActionRecord, AuditRing, ThreatLevel, VerdictRecord};

const MINUTE_MS: u64 = 60_000;
const SECOND_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allowed {
        reason: String,
    },
    Denied {
        reason: String,
        threat: ThreatLevel,
    },
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Allowed { reason } | Verdict::Denied { reason, .. } => reason,
        }
    }

    fn allow(reason: impl Into<String>) -> Self {
        Verdict::Allowed {
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>, threat: ThreatLevel) -> Self {
        Verdict::Denied {
            reason: reason.into(),
            threat,
        }
    }
}

/// Callbacks observe `(action, allowed)` after every recorded decision.
///
/// The list is ordered and invoked outside the guard's internal lock; a
/// callback must not call `validate` on the same guard.
type GuardCallback = Box<dyn Fn(&Action, bool) + Send + Sync>;

struct Inner {
    /// Timestamps (ms) of *allowed* actions; denials never consume quota.
    rate: std::collections::VecDeque<u64>,
    ring: AuditRing,
}

/// Validates every action against the policy before it reaches the OS.
///
/// Idempotent, side effects limited to logging and the audit ring, and
/// fail-closed: an internal fault denies rather than allows.
pub struct PermissionGuard {
    policy: Policy,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<GuardCallback>>,
}

impl PermissionGuard {
    pub fn new(policy: Policy) -> Self {
        let ring = AuditRing::new(policy.audit_ring_size);
        Self {
            policy,
            inner: Mutex::new(Inner {
                rate: std::collections::VecDeque::new(),
                ring,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn subscribe(&self, cb: GuardCallback) {
        if let Ok(mut cbs) = self.callbacks.lock() {
            cbs.push(cb);
        }
    }

    pub fn validate(&self, action: &Action, requester: &str) -> Verdict {
        self.validate_at(action, requester, now_ms())
    }

    /// Clock-injected variant; the public path always uses the real clock.
    pub(crate) fn validate_at(&self, action: &Action, requester: &str, now_ms: u64) -> Verdict {
        if !self.policy.enabled {
            return Verdict::allow("permissions disabled");
        }

        let kind = action.kind();

        let verdict = {
            let Ok(mut inner) = self.inner.lock() else {
                // Poisoned lock: deny, never allow on internal faults.
                return Verdict::deny("guard internal error", ThreatLevel::Suspicious);
            };

            let verdict = if !self.policy.action_allowed(kind) {
                Verdict::deny(
                    format!("action kind not allowed: {kind}"),
                    ThreatLevel::Suspicious,
                )
            } else if let Some(denied) = Self::rate_exceeded(&mut inner, &self.policy, now_ms) {
                denied
            } else {
                self.check_content(action)
            };

            inner.ring.push(ActionRecord {
                ts: Utc::now(),
                action_kind: kind,
                requester: requester.to_string(),
                verdict: match &verdict {
                    Verdict::Allowed { reason } => VerdictRecord::Allowed {
                        reason: reason.clone(),
                    },
                    Verdict::Denied { reason, .. } => VerdictRecord::Denied {
                        reason: reason.clone(),
                    },
                },
                threat: match &verdict {
                    Verdict::Allowed { .. } => ThreatLevel::Benign,
                    Verdict::Denied { threat, .. } => *threat,
                },
            });

            if verdict.allowed() {
                inner.rate.push_back(now_ms);
            }

            verdict
        };

        if let Ok(cbs) = self.callbacks.lock() {
            for cb in cbs.iter() {
                cb(action, verdict.allowed());
            }
        }

        verdict
    }

    /// Sliding-window rate check over allowed actions only. The minute
    /// window is evicted here, which keeps the steady-state cost O(1).
    fn rate_exceeded(inner: &mut Inner, policy: &Policy, now_ms: u64) -> Option<Verdict> {
        while let Some(&front) = inner.rate.front() {
            if now_ms.saturating_sub(front) >= MINUTE_MS {
                inner.rate.pop_front();
            } else {
                break;
            }
        }

        if inner.rate.len() >= policy.rate_limits.per_minute {
            return Some(Verdict::deny(
                "rate limited: per-minute window full",
                ThreatLevel::Suspicious,
            ));
        }

        let last_second = inner
            .rate
            .iter()
            .rev()
            .take_while(|&&ts| now_ms.saturating_sub(ts) < SECOND_MS)
            .count();
        if last_second >= policy.rate_limits.per_second {
            return Some(Verdict::deny(
                "rate limited: per-second window full",
                ThreatLevel::Suspicious,
            ));
        }

        None
    }

    fn check_content(&self, action: &Action) -> Verdict {
        match action {
            Action::OpenApplication { alias } => {
                if alias.trim().is_empty() {
                    return Verdict::deny("application alias missing", ThreatLevel::Suspicious);
                }
                match self.policy.application_category(alias) {
                    Some(cat) => Verdict::allow(format!("application allowed ({cat})")),
                    None if self.policy.strict_mode => Verdict::deny(
                        format!("application not in allowed list: {alias}"),
                        ThreatLevel::Suspicious,
                    ),
                    None => {
                        warn!(alias, "unknown application allowed (non-strict mode)");
                        Verdict::allow("application allowed (non-strict mode)")
                    }
                }
            }

            Action::Type { text } => {
                if text.is_empty() {
                    return Verdict::allow("empty text");
                }
                if let Some(hit) = patterns::blocked_command_hit(text) {
                    return Verdict::deny(
                        format!("blocked pattern detected: {}", hit.label),
                        hit.threat,
                    );
                }
                for raw in &self.policy.blocked_patterns {
                    if let Ok(re) = regex::RegexBuilder::new(raw).case_insensitive(true).build() {
                        if re.is_match(text) {
                            return Verdict::deny(
                                format!("blocked pattern detected: {raw}"),
                                ThreatLevel::Dangerous,
                            );
                        }
                    }
                }
                if patterns::suspicious_script_hit(text) {
                    return Verdict::deny(
                        "suspicious script content detected",
                        ThreatLevel::Suspicious,
                    );
                }
                if let Some(path) = patterns::protected_path_hit(text, &self.policy.protected_paths)
                {
                    return Verdict::deny(
                        format!("protected path operation: {path}"),
                        ThreatLevel::Dangerous,
                    );
                }
                Verdict::allow("text content validated")
            }

            Action::Click { x, y, .. } | Action::Move { x, y } => {
                if *x >= self.policy.coord_max_w || *y >= self.policy.coord_max_h {
                    return Verdict::deny(
                        format!("coordinates out of bounds: ({x}, {y})"),
                        ThreatLevel::Suspicious,
                    );
                }
                Verdict::allow("coordinates validated")
            }

            Action::KeyPress { combo } => {
                let normalized = combo.trim().to_lowercase();
                if normalized.is_empty() {
                    return Verdict::deny("key specification missing", ThreatLevel::Suspicious);
                }
                if patterns::DANGEROUS_COMBOS.contains(&normalized.as_str()) {
                    return Verdict::deny(
                        format!("dangerous key combination: {normalized}"),
                        ThreatLevel::Dangerous,
                    );
                }
                Verdict::allow("key action validated")
            }

            Action::Scroll { .. }
            | Action::Wait { .. }
            | Action::Screenshot { .. }
            | Action::FindElement { .. }
            | Action::Verify { .. } => Verdict::allow(format!("{} allowed", action.kind())),
        }
    }

    // ---------------- audit surface ----------------

    pub fn audit_snapshot(&self) -> Vec<ActionRecord> {
        self.inner
            .lock()
            .map(|i| i.ring.snapshot())
            .unwrap_or_default()
    }

    pub fn audit_total(&self) -> u64 {
        self.inner.lock().map(|i| i.ring.total()).unwrap_or(0)
    }

    pub fn dump_audit(&self, path: &Path) -> std::io::Result<()> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "guard lock poisoned"))?;
        inner.ring.dump_to(path)
    }

    #[cfg(test)]
    fn rate_len(&self) -> usize {
        self.inner.lock().unwrap().rate.len()
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
    use crate::core::action::MouseButton;

    fn guard() -> PermissionGuard {
        PermissionGuard::new(Policy::default())
    }

    fn click(x: u32, y: u32) -> Action {
        Action::Click {
            x,
            y,
            button: MouseButton::Left,
        }
    }

    #[test]
    fn click_bounds_are_inclusive_exclusive() {
        let g = guard();
        let max_w = g.policy().coord_max_w;
        let max_h = g.policy().coord_max_h;

        assert!(g.validate(&click(0, 0), "test").allowed());
        assert!(g.validate(&click(max_w - 1, max_h - 1), "test").allowed());
        assert!(!g.validate(&click(max_w, 0), "test").allowed());
        assert!(!g.validate(&click(0, max_h), "test").allowed());
    }

    #[test]
    fn empty_type_allowed_wipe_denied_as_dangerous() {
        let g = guard();
        assert!(g
            .validate(
                &Action::Type {
                    text: String::new()
                },
                "test"
            )
            .allowed());

        let v = g.validate(
            &Action::Type {
                text: "rm -rf /".to_string(),
            },
            "test",
        );
        match v {
            Verdict::Denied { threat, .. } => assert_eq!(threat, ThreatLevel::Dangerous),
            Verdict::Allowed { .. } => panic!("rm -rf must be denied"),
        }
    }

    #[test]
    fn unknown_app_strict_vs_non_strict() {
        let g = guard();
        assert!(!g
            .validate(
                &Action::OpenApplication {
                    alias: "unknownapp".to_string()
                },
                "test"
            )
            .allowed());

        let mut policy = Policy::default();
        policy.strict_mode = false;
        let g = PermissionGuard::new(policy);
        assert!(g
            .validate(
                &Action::OpenApplication {
                    alias: "unknownapp".to_string()
                },
                "test"
            )
            .allowed());
    }

    #[test]
    fn dangerous_combo_denied_case_insensitive() {
        let g = guard();
        let v = g.validate(
            &Action::KeyPress {
                combo: "Ctrl+Alt+Del".to_string(),
            },
            "test",
        );
        assert!(!v.allowed());
    }

    #[test]
    fn per_second_window_denies_the_overflow_action() {
        let g = guard();
        let per_sec = g.policy().rate_limits.per_second;
        let base = 1_000_000;

        for i in 0..per_sec {
            let v = g.validate_at(&click(1, 1), "test", base + i as u64);
            assert!(v.allowed(), "action {i} within the window must pass");
        }
        let v = g.validate_at(&click(1, 1), "test", base + 500);
        assert!(!v.allowed());
        assert!(v.reason().contains("rate limited"));

        // One second later the window has rolled over.
        let v = g.validate_at(&click(1, 1), "test", base + SECOND_MS + 600);
        assert!(v.allowed());
    }

    #[test]
    fn per_minute_window_is_enforced_and_denials_consume_no_quota() {
        let mut policy = Policy::default();
        policy.rate_limits.per_minute = 5;
        policy.rate_limits.per_second = 5;
        let g = PermissionGuard::new(policy);

        let base = 2_000_000;
        for i in 0..5u64 {
            // Spread across seconds so only the minute window binds.
            assert!(g.validate_at(&click(1, 1), "test", base + i * 2_000).allowed());
        }
        assert!(!g.validate_at(&click(1, 1), "test", base + 20_000).allowed());

        // A denial for content must not consume quota either.
        assert_eq!(g.rate_len(), 5);
        let _ = g.validate_at(
            &Action::Type {
                text: "rm -rf /".to_string(),
            },
            "test",
            base + 61_000,
        );
        // Window rolled, wipe denial recorded but not counted.
        assert!(g.validate_at(&click(1, 1), "test", base + 62_000).allowed());
    }

    #[test]
    fn validate_twice_records_twice_and_counts_twice() {
        let g = guard();
        let before = g.audit_total();
        assert!(g.validate_at(&click(5, 5), "test", 3_000_000).allowed());
        assert!(g.validate_at(&click(5, 5), "test", 3_000_100).allowed());
        assert_eq!(g.audit_total() - before, 2);
        assert_eq!(g.rate_len(), 2);
    }

    #[test]
    fn denied_actions_are_recorded_with_reason() {
        let g = guard();
        let _ = g.validate(
            &Action::Type {
                text: "sudo rm -rf /".to_string(),
            },
            "executor",
        );
        let snap = g.audit_snapshot();
        let last = snap.last().unwrap();
        assert!(matches!(last.verdict, VerdictRecord::Denied { .. }));
        assert!(last.threat >= ThreatLevel::Dangerous);
    }

    #[test]
    fn callbacks_see_the_decision() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let g = guard();
        let denials = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&denials);
        g.subscribe(Box::new(move |_, allowed| {
            if !allowed {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let _ = g.validate(
            &Action::Type {
                text: "rm -rf /".to_string(),
            },
            "test",
        );
        assert_eq!(denials.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_guard_allows_everything() {
        let mut policy = Policy::default();
        policy.enabled = false;
        let g = PermissionGuard::new(policy);
        assert!(g
            .validate(
                &Action::Type {
                    text: "rm -rf /".to_string()
                },
                "test"
            )
            .allowed());
    }
}
