// Author: BlackIce Project
// License: MIT

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::action::Action;

/// Retry policy attached to a step by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    None,
    Fixed { attempts: u32 },
    Backoff { attempts: u32, base_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::None
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { attempts } | RetryPolicy::Backoff { attempts, .. } => *attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None | RetryPolicy::Fixed { .. } => Duration::from_millis(0),
            RetryPolicy::Backoff { base_ms, .. } => {
                let shift = attempt.saturating_sub(1).min(10);
                Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub order: u32,
    pub description: String,
    pub action: Action,
    #[serde(default)]
    pub pre_conditions: Vec<String>,
    #[serde(default)]
    pub post_conditions: Vec<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_screen_change: Option<String>,
}

/// An ordered sequence of steps plus contingency branches, produced by the
/// external planner and validated at ingestion. After validation the
/// orchestrator can rely on every structural invariant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub intent: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub contingencies: BTreeMap<String, Vec<Step>>,
    pub success_criterion: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    EmptySteps,
    DuplicateStepId(String),
    NonMonotonicOrder(String),
    UnresolvedFallback(String),
    ConfidenceOutOfRange,
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::EmptySteps => write!(f, "plan has no steps"),
            PlanError::DuplicateStepId(id) => write!(f, "duplicate step id: {id}"),
            PlanError::NonMonotonicOrder(id) => {
                write!(f, "step order not strictly increasing at: {id}")
            }
            PlanError::UnresolvedFallback(id) => {
                write!(f, "fallback step id does not resolve: {id}")
            }
            PlanError::ConfidenceOutOfRange => write!(f, "confidence outside [0, 1]"),
        }
    }
}

impl std::error::Error for PlanError {}

impl Plan {
    /// Structural validation. Steps non-empty, unique ids, strictly
    /// increasing order, fallbacks resolving within steps or contingencies,
    /// confidence within [0, 1].
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptySteps);
        }
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(PlanError::ConfidenceOutOfRange);
        }

        let mut ids = HashSet::new();
        for step in self.all_steps() {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
        }

        let mut last_order: Option<u32> = None;
        for step in &self.steps {
            if let Some(prev) = last_order {
                if step.order <= prev {
                    return Err(PlanError::NonMonotonicOrder(step.id.clone()));
                }
            }
            last_order = Some(step.order);
        }

        for step in self.all_steps() {
            if let Some(fb) = &step.fallback_step_id {
                if !ids.contains(fb.as_str()) {
                    return Err(PlanError::UnresolvedFallback(fb.clone()));
                }
            }
        }

        Ok(())
    }

    /// Steps in the main sequence plus every contingency branch.
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .chain(self.contingencies.values().flatten())
    }

    /// Replace everything from `cursor` onward with the adapted tail.
    ///
    /// The caller re-validates the spliced plan; a bad splice must surface
    /// as CannotRecover, never as a panic inside the engine.
    pub fn splice_tail(&mut self, cursor: usize, tail: Vec<Step>) {
        let cut = cursor.min(self.steps.len());
        self.steps.truncate(cut);
        self.steps.extend(tail);
    }
}
