// Author: BlackIce Project
// License: MIT

use serde::{Deserialize, Serialize};

use crate::core::plan::Plan;

/// What the vision side saw on the AI display. Free-form element payloads
/// stay as JSON; the core only routes on `unexpected_elements`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenAnalysis {
    pub applications: Vec<String>,
    pub ui_elements: Vec<serde_json::Value>,
    pub text_content: Vec<String>,
    pub clickable_elements: Vec<serde_json::Value>,
    pub unexpected_elements: Vec<String>,
    pub confidence: f32,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemContext {
    pub os: String,
    pub display_server: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            display_server: "x11".to_string(),
            capabilities: vec![
                "click".to_string(),
                "type".to_string(),
                "key_press".to_string(),
                "screenshot".to_string(),
                "open_application".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub intent: String,
    pub screen: ScreenAnalysis,
    pub system: SystemContext,
}

/// Error context shipped with every adaptation call. Only the last few
/// errors travel; the full backlog stays local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub current_step: usize,
    pub completed_steps: usize,
    pub last_errors: Vec<String>,
    pub retry_count: u32,
    #[serde(default)]
    pub disruptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptRequest {
    pub plan: Plan,
    pub cursor: usize,
    pub error_context: ErrorContext,
    pub screen: ScreenAnalysis,
}

/// Intent triage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentTags {
    pub intent_kind: String,
    pub estimated_steps: u32,
    pub confidence: f32,
    pub requires_confirmation: bool,
}
