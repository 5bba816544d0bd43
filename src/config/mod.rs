// Author: BlackIce Project
// License: MIT

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionKind;

/// Immutable rules consulted by the permission guard. Loaded once at
/// startup; hot reload is deliberately not supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Policy {
    pub enabled: bool,
    pub strict_mode: bool,

    /// category -> allowed application aliases.
    pub allowed_applications: BTreeMap<String, Vec<String>>,

    /// Extra blocked patterns on top of the built-in set (regex).
    pub blocked_patterns: Vec<String>,

    /// Path prefixes no typed text may operate on.
    pub protected_paths: Vec<String>,

    /// Process names that must never be interrupted.
    pub critical_processes: Vec<String>,

    /// Action kinds the guard will consider at all.
    pub allowed_actions: Vec<ActionKind>,

    pub rate_limits: RateLimits,

    pub max_retries: u32,
    pub max_adaptations: u32,

    pub emergency_hotkey: String,
    /// Manual reset is the default; flipping this auto-clears the latch.
    pub emergency_auto_reset: bool,

    pub coord_max_w: u32,
    pub coord_max_h: u32,

    pub audit_ring_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimits {
    pub per_second: usize,
    pub per_minute: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 100,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        let mut allowed_applications = BTreeMap::new();
        allowed_applications.insert(
            "security_tools".to_string(),
            svec(&["burpsuite", "wireshark", "nmap", "metasploit", "sqlmap", "nikto", "gobuster", "ffuf"]),
        );
        allowed_applications.insert(
            "system_tools".to_string(),
            svec(&["gnome-terminal", "x-terminal-emulator", "xterm", "konsole", "lxterminal"]),
        );
        allowed_applications.insert(
            "browsers".to_string(),
            svec(&["firefox", "firefox-esr", "chromium", "google-chrome", "brave-browser"]),
        );
        allowed_applications.insert(
            "utilities".to_string(),
            svec(&["galculator", "calculator", "mousepad", "thunar", "nautilus", "pcmanfm", "gedit"]),
        );
        allowed_applications.insert(
            "analysis_tools".to_string(),
            svec(&["binwalk", "strings", "hexdump", "xxd", "objdump", "readelf"]),
        );

        Self {
            enabled: true,
            strict_mode: true,
            allowed_applications,
            blocked_patterns: Vec::new(),
            protected_paths: svec(&[
                "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/dev", "/proc",
                "/sys", "/root",
            ]),
            critical_processes: svec(&[
                "zoom",
                "teams",
                "skype",
                "discord",
                "obs-studio",
                "libreoffice-impress",
            ]),
            allowed_actions: ActionKind::ALL.to_vec(),
            rate_limits: RateLimits::default(),
            max_retries: 3,
            max_adaptations: 3,
            emergency_hotkey: "F12".to_string(),
            emergency_auto_reset: false,
            coord_max_w: 3840,
            coord_max_h: 2160,
            audit_ring_size: 10_000,
        }
    }
}

impl Policy {
    pub fn action_allowed(&self, kind: ActionKind) -> bool {
        self.allowed_actions.contains(&kind)
    }

    /// Category the alias is allowed under, if any. Substring match follows
    /// the alias table semantics ("firefox-esr" matches "firefox").
    pub fn application_category(&self, alias: &str) -> Option<&str> {
        let alias = alias.to_lowercase();
        self.allowed_applications.iter().find_map(|(cat, apps)| {
            apps.iter()
                .any(|a| alias.contains(a.as_str()))
                .then_some(cat.as_str())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplaySettings {
    pub preferred_id: String,
    pub width: u32,
    pub height: u32,
    pub user_display: String,
    /// Adopt this pre-provisioned display instead of spawning one. It is
    /// never torn down by the daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            preferred_id: ":1".to_string(),
            width: 1920,
            height: 1080,
            user_display: ":0".to_string(),
            external_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    pub idle_secs: u64,
    pub light_secs: u64,
    pub intensive_secs: u64,
    /// User-process CPU (percent) below which silence counts as idle.
    pub idle_cpu_floor: f32,
    pub light_cpu_floor: f32,
    pub max_cpu_percent: f32,
    pub max_memory_percent: f32,
    pub presentation_indicators: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            idle_secs: 300,
            light_secs: 60,
            intensive_secs: 10,
            idle_cpu_floor: 5.0,
            light_cpu_floor: 20.0,
            max_cpu_percent: 80.0,
            max_memory_percent: 90.0,
            presentation_indicators: svec(&[
                "libreoffice-impress",
                "soffice.bin --impress",
                "zoom --fullscreen",
                "teams --presentation",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationSettings {
    pub interval_secs: u64,
    pub max_violations: u32,
    /// Sliding window the violation budget is counted over.
    pub violation_window_secs: u64,
    /// Observed violations at which a running plan counts as disrupted
    /// and gets routed to adaptation. Softer than `max_violations`.
    pub disrupt_violations: u32,
    pub max_ai_cpu_percent: f32,
    pub max_ai_memory_mb: u64,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            max_violations: 5,
            violation_window_secs: 60,
            disrupt_violations: 2,
            max_ai_cpu_percent: 80.0,
            max_ai_memory_mb: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    pub type_delay_ms: u64,
    pub screenshot_dir: PathBuf,
    pub planner_timeout_secs: u64,
    /// How long a retry holds out for the user to go quiet.
    pub wait_safe_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            type_delay_ms: 12,
            screenshot_dir: std::env::temp_dir().join("warden-shots"),
            planner_timeout_secs: 60,
            wait_safe_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateSettings {
    pub dir: PathBuf,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("templates"),
        }
    }
}

/// Full daemon configuration: `warden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub policy: Policy,
    pub display: DisplaySettings,
    pub monitor: MonitorSettings,
    pub isolation: IsolationSettings,
    pub executor: ExecutorSettings,
    pub templates: TemplateSettings,
}

pub fn resolve_default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
        .join("warden.toml")
}

/// Load settings, falling back to built-in defaults when the file does not
/// exist. A present-but-broken file is an error, not a silent default.
pub fn load_from_path(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config: {}", path.display()))?;
    let settings: Settings = toml::from_str(&raw)
        .wrap_err_with(|| format!("failed to parse config: {}", path.display()))?;
    Ok(settings)
}

fn svec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
