// Author: BlackIce Project
// License: MIT

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Benign,
    Suspicious,
    Dangerous,
    Malicious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum VerdictRecord {
    Allowed { reason: String },
    Denied { reason: String },
}

/// One guard decision. Payload-free: the kind is retained, the content
/// is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub ts: DateTime<Utc>,
    pub action_kind: ActionKind,
    pub requester: String,
    #[serde(flatten)]
    pub verdict: VerdictRecord,
    pub threat: ThreatLevel,
}

/// Append-only bounded ring of guard decisions. Oldest entries fall off;
/// nothing is persisted unless dumped.
#[derive(Debug)]
pub struct AuditRing {
    cap: usize,
    buf: VecDeque<ActionRecord>,
    total: u64,
}

impl AuditRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buf: VecDeque::with_capacity(cap.min(1024)),
            total: 0,
        }
    }

    pub fn push(&mut self, record: ActionRecord) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(record);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decisions ever recorded, including ones the ring has evicted.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionRecord> {
        self.buf.iter()
    }

    pub fn snapshot(&self) -> Vec<ActionRecord> {
        self.buf.iter().cloned().collect()
    }

    pub fn dump_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: ActionKind, ok: bool) -> ActionRecord {
        ActionRecord {
            ts: Utc::now(),
            action_kind: kind,
            requester: "test".to_string(),
            verdict: if ok {
                VerdictRecord::Allowed {
                    reason: "ok".to_string(),
                }
            } else {
                VerdictRecord::Denied {
                    reason: "no".to_string(),
                }
            },
            threat: ThreatLevel::Benign,
        }
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let mut ring = AuditRing::new(3);
        for _ in 0..5 {
            ring.push(record(ActionKind::Click, true));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.total(), 5);
    }

    #[test]
    fn dump_writes_json_array() {
        let mut ring = AuditRing::new(8);
        ring.push(record(ActionKind::Type, false));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        ring.dump_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let back: Vec<ActionRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].action_kind, ActionKind::Type);
    }
}
