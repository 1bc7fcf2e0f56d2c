// Scanner configuration: one JSON document at a fixed path.
//
// Unrecognized keys are ignored, absent keys take defaults, and legacy
// `capture_backend` spellings are migrated at deserialize time
// ("screen"/"auto" → monitor, "wgc" → window). A document that loads,
// saves, and loads again yields an equal in-memory config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Capture source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Capture a single window (handle-, title-, or process-resolved).
    #[default]
    #[serde(alias = "wgc")]
    Window,
    /// Capture a whole monitor.
    #[serde(alias = "screen", alias = "auto")]
    Monitor,
}

/// Click dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMethod {
    /// Non-activating window messages (the only mode that never moves
    /// the pointer or steals focus).
    #[default]
    Message,
    /// Accepted for compatibility; coerced to `Message` at dispatch.
    Simulate,
}

/// Region of interest within a captured frame. Zero width or height
/// means the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub w: u32,
    #[serde(default)]
    pub h: u32,
}

impl Roi {
    pub fn is_full_frame(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

fn default_window_title_partial_match() -> bool {
    true
}
fn default_monitor_index() -> u32 {
    1
}
fn default_interval_ms() -> u64 {
    800
}
fn default_active_scan_interval_ms() -> u64 {
    120
}
fn default_idle_scan_interval_ms() -> u64 {
    2000
}
fn default_miss_backoff_ms_max() -> u64 {
    5000
}
fn default_hit_cooldown_ms() -> u64 {
    4000
}
fn default_threshold() -> f32 {
    0.88
}
fn default_grayscale() -> bool {
    true
}
fn default_scales() -> Vec<f32> {
    vec![1.0]
}
fn default_min_detections() -> u32 {
    1
}
fn default_cooldown_s() -> f32 {
    5.0
}
fn default_verify_window_before_click() -> bool {
    true
}
fn default_fps_max() -> u32 {
    30
}
fn default_capture_timeout_ms() -> u64 {
    5000
}
fn default_restore_minimized_noactivate() -> bool {
    true
}

/// Processes treated as "active" by the adaptive scheduler when they
/// own the foreground window. AI-assisted IDEs by default.
fn default_process_whitelist() -> Vec<String> {
    [
        "Code.exe",
        "Code - Insiders.exe",
        "Cursor.exe",
        "Windsurf.exe",
        "devenv.exe",
        "Trae.exe",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Scanner configuration document. See the field defaults for the
/// recognized key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Single template path (legacy; overridden by `template_paths`).
    #[serde(default)]
    pub template_path: Option<String>,
    /// Templates, loaded and matched in order.
    #[serde(default)]
    pub template_paths: Vec<String>,

    #[serde(default)]
    pub capture_backend: CaptureBackend,
    /// Explicit window handle (0 = unset).
    #[serde(default)]
    pub target_hwnd: isize,
    #[serde(default)]
    pub target_window_title: String,
    #[serde(default = "default_window_title_partial_match")]
    pub window_title_partial_match: bool,
    #[serde(default)]
    pub target_process: String,
    /// 1-based monitor index for `capture_backend = "monitor"`.
    #[serde(default = "default_monitor_index")]
    pub monitor_index: u32,

    #[serde(default)]
    pub roi: Roi,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_active_scan_interval_ms")]
    pub active_scan_interval_ms: u64,
    #[serde(default = "default_idle_scan_interval_ms")]
    pub idle_scan_interval_ms: u64,
    #[serde(default = "default_miss_backoff_ms_max")]
    pub miss_backoff_ms_max: u64,
    #[serde(default = "default_hit_cooldown_ms")]
    pub hit_cooldown_ms: u64,

    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_grayscale")]
    pub grayscale: bool,
    #[serde(default)]
    pub multi_scale: bool,
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,
    #[serde(default = "default_min_detections")]
    pub min_detections: u32,

    /// Offset from the match center, applied to the click point.
    #[serde(default)]
    pub click_offset: [i32; 2],
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: f32,
    #[serde(default)]
    pub click_method: ClickMethod,
    #[serde(default = "default_verify_window_before_click")]
    pub verify_window_before_click: bool,

    #[serde(default = "default_fps_max")]
    pub fps_max: u32,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default)]
    pub include_cursor: bool,
    #[serde(default)]
    pub border_required: bool,
    #[serde(default = "default_restore_minimized_noactivate")]
    pub restore_minimized_noactivate: bool,

    #[serde(default = "default_process_whitelist")]
    pub process_whitelist: Vec<String>,
    /// Re-resolve the handle by process name periodically.
    #[serde(default)]
    pub auto_update_hwnd_by_process: bool,

    /// Optional log file (ISO-8601 timestamps).
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Optional directory for match debug images.
    #[serde(default)]
    pub debug_image_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        // An empty JSON object is the canonical all-defaults document.
        serde_json::from_str("{}").expect("default config must deserialize")
    }
}

impl Config {
    /// Load and migrate a config document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the config as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Templates in match order: `template_paths` when non-empty,
    /// otherwise the legacy single `template_path`.
    pub fn effective_template_paths(&self) -> Vec<String> {
        if !self.template_paths.is_empty() {
            return self.template_paths.clone();
        }
        self.template_path.iter().cloned().collect()
    }

    /// Scales the matcher actually evaluates. Multi-scale off or an
    /// empty list both collapse to the single native scale.
    pub fn effective_scales(&self) -> Vec<f32> {
        if !self.multi_scale || self.scales.is_empty() {
            return vec![1.0];
        }
        self.scales.clone()
    }

    /// Boot-time validation. Failure is fatal: the scanner refuses to
    /// start on an invalid config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.effective_template_paths().is_empty() {
            return Err(ConfigError::Invalid(
                "no template configured (template_path / template_paths)".into(),
            ));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.min_detections == 0 {
            return Err(ConfigError::Invalid("min_detections must be >= 1".into()));
        }
        for &ms in &[
            self.interval_ms,
            self.active_scan_interval_ms,
            self.idle_scan_interval_ms,
            self.miss_backoff_ms_max,
            self.hit_cooldown_ms,
            self.capture_timeout_ms,
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid("scan intervals must be > 0 ms".into()));
            }
        }
        if self.fps_max == 0 {
            return Err(ConfigError::Invalid("fps_max must be > 0".into()));
        }
        if self.cooldown_s < 0.0 {
            return Err(ConfigError::Invalid("cooldown_s must be >= 0".into()));
        }
        if self.multi_scale && self.scales.iter().any(|&s| s <= 0.0) {
            return Err(ConfigError::Invalid("scales must all be > 0".into()));
        }
        if self.capture_backend == CaptureBackend::Monitor && self.monitor_index == 0 {
            return Err(ConfigError::Invalid(
                "monitor_index is 1-based; 0 is invalid".into(),
            ));
        }
        if self.capture_backend == CaptureBackend::Window
            && self.target_hwnd == 0
            && self.target_window_title.is_empty()
            && self.target_process.is_empty()
        {
            return Err(ConfigError::Invalid(
                "window capture needs target_hwnd, target_window_title, or target_process".into(),
            ));
        }
        if self.click_method == ClickMethod::Simulate {
            warn!("click_method \"simulate\" is not supported; using message dispatch");
        }
        Ok(())
    }
}
