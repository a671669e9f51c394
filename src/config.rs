//! Persisted tunable parameters.
//! One JSON settings file covers the detector thresholds, the noise state
//! machine, and the session cooldowns, so a single parameterized pipeline can
//! be re-tuned without touching code. Missing file or missing fields fall back
//! to defaults; the file is treated as immutable for the duration of a session.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SETTINGS_FILE: &str = "boardwatch_settings.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    // --- Gaussian background model ---
    /// Mean z-score above which a square counts as changed.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f32,
    /// Learning rate for the exponential background update.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Variance seeded into a freshly calibrated square.
    #[serde(default = "default_initial_variance")]
    pub initial_variance: f32,
    /// Sigma of the gaussian blur applied before any per-pixel statistics.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    // --- Noise state machine ---
    /// More than this many simultaneously changed squares means a hand.
    #[serde(default = "default_noise_square_threshold")]
    pub noise_square_threshold: usize,
    /// Consecutive identical frames required before a pending set is stable.
    #[serde(default = "default_stability_frames")]
    pub stability_frames: u32,
    /// Consecutive quiet frames required to leave NOISE_ACTIVE.
    #[serde(default = "default_cooldown_frames")]
    pub cooldown_frames: u32,

    // --- Session ---
    /// Wall-clock pause after a committed move before another may be processed.
    #[serde(default = "default_move_cooldown_secs")]
    pub move_cooldown_secs: f32,
    /// Every Nth frame runs an unrestricted scan regardless of the focus set.
    #[serde(default = "default_full_scan_interval")]
    pub full_scan_interval: u64,

    // --- Piece presence ---
    /// Number of recent presence decisions kept per square.
    #[serde(default = "default_presence_history")]
    pub presence_history: usize,
    /// Fraction of recent frames that must agree before "present" is declared.
    #[serde(default = "default_presence_majority")]
    pub presence_majority: f32,
    /// Mean absolute pixel difference against the visual reference that counts
    /// as a visual change (delta caching).
    #[serde(default = "default_presence_change_threshold")]
    pub presence_change_threshold: f32,
    /// Center-vs-border intensity gap that indicates a piece.
    #[serde(default = "default_center_contrast_threshold")]
    pub center_contrast_threshold: f32,
}

fn default_z_threshold() -> f32 {
    2.5
}
fn default_alpha() -> f32 {
    0.15
}
fn default_initial_variance() -> f32 {
    400.0
}
fn default_blur_sigma() -> f32 {
    1.2
}
fn default_noise_square_threshold() -> usize {
    3
}
fn default_stability_frames() -> u32 {
    12
}
fn default_cooldown_frames() -> u32 {
    5
}
fn default_move_cooldown_secs() -> f32 {
    2.0
}
fn default_full_scan_interval() -> u64 {
    30
}
fn default_presence_history() -> usize {
    5
}
fn default_presence_majority() -> f32 {
    0.6
}
fn default_presence_change_threshold() -> f32 {
    25.0
}
fn default_center_contrast_threshold() -> f32 {
    40.0
}

impl Default for Settings {
    fn default() -> Self {
        // serde fills every field from its default fn
        serde_json::from_str("{}").expect("empty settings object must deserialize")
    }
}

impl Settings {
    /// Loads settings from a JSON file. A missing file yields defaults;
    /// a present but unreadable file is an error (a half-applied tuning run
    /// should not silently revert to defaults).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write settings file {}", path.display()))
    }
}
