// Author: BlackIce Project
// License: MIT

use crate::core::events::EventKind;

/// Outputs of the pure engine. The daemon's task runtime performs each
/// effect and feeds the result back as the next [`OrchEvent`].
///
/// [`OrchEvent`]: crate::core::events::OrchEvent
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Call the planner façade with the task intent and current screen.
    RequestPlan,

    /// Capture and analyze the AI display.
    CaptureScreen,

    /// Execute the step at `index`, optionally after a retry delay.
    ExecuteStep { index: usize, delay_ms: u64 },

    /// Ask the façade to adapt the plan around the current error context.
    RequestAdaptation { reason: String },

    /// Publish a lifecycle event on the bus.
    Emit(EventKind),
}
