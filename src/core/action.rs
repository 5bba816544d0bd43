// Author: BlackIce Project
// License: MIT

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// X11 button number as understood by the injection tool.
    pub fn x11_button(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MouseButton::Left => write!(f, "left"),
            MouseButton::Right => write!(f, "right"),
            MouseButton::Middle => write!(f, "middle"),
        }
    }
}

/// One primitive interaction with the AI display.
///
/// Coordinates are always in the AI display's framebuffer space. Content
/// constraints (blocklists, alias resolution, coordinate bounds) are
/// enforced by the permission guard, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: u32,
        y: u32,
        #[serde(default = "default_button")]
        button: MouseButton,
    },
    Type {
        text: String,
    },
    KeyPress {
        combo: String,
    },
    Move {
        x: u32,
        y: u32,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
    Wait {
        duration_ms: u64,
    },
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_path: Option<PathBuf>,
    },
    FindElement {
        template_id: String,
        min_confidence: f32,
    },
    OpenApplication {
        alias: String,
    },
    Verify {
        predicate: String,
    },
}

fn default_button() -> MouseButton {
    MouseButton::Left
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::KeyPress { .. } => ActionKind::KeyPress,
            Action::Move { .. } => ActionKind::Move,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Screenshot { .. } => ActionKind::Screenshot,
            Action::FindElement { .. } => ActionKind::FindElement,
            Action::OpenApplication { .. } => ActionKind::OpenApplication,
            Action::Verify { .. } => ActionKind::Verify,
        }
    }
}

/// Discriminant-only view of [`Action`], used by policy checks and audit
/// records where the payload must not be retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    KeyPress,
    Move,
    Scroll,
    Wait,
    Screenshot,
    FindElement,
    OpenApplication,
    Verify,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::KeyPress,
        ActionKind::Move,
        ActionKind::Scroll,
        ActionKind::Wait,
        ActionKind::Screenshot,
        ActionKind::FindElement,
        ActionKind::OpenApplication,
        ActionKind::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::KeyPress => "key_press",
            ActionKind::Move => "move",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
            ActionKind::FindElement => "find_element",
            ActionKind::OpenApplication => "open_application",
            ActionKind::Verify => "verify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
