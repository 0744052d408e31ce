//! Player configuration with validation and TOML loading.

use crate::dsp::NormalizationConfig;
use crate::error::{PlayerError, Result};
use crate::host::SessionOptions;
use lull_common::{FadeCurve, LoopMode, RepeatMode};
use serde::{Deserialize, Serialize};

/// How the engine relates to the process-wide audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// The engine configures and activates the session
    Managed,
    /// Someone else owns the session; the engine only validates it
    External,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Managed
    }
}

/// Overlay layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub loop_mode: LoopMode,
    /// Pause between loop iterations, seconds
    pub loop_delay: f64,
    pub volume: f32,
    pub fade_in_duration: f64,
    pub fade_out_duration: f64,
    pub fade_curve: FadeCurve,
    /// Loudness-normalize overlay buffers at load time
    pub normalized: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Infinite,
            loop_delay: 0.0,
            volume: 1.0,
            fade_in_duration: 0.0,
            fade_out_duration: 0.0,
            fade_curve: FadeCurve::default(),
            normalized: false,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.loop_delay < 0.0 {
            return Err(PlayerError::InvalidConfiguration {
                reason: format!("overlay loop_delay must be >= 0, got {}", self.loop_delay),
            });
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PlayerError::InvalidConfiguration {
                reason: format!("overlay volume must be in [0, 1], got {}", self.volume),
            });
        }
        if self.fade_in_duration < 0.0 || self.fade_out_duration < 0.0 {
            return Err(PlayerError::InvalidConfiguration {
                reason: "overlay fade durations must be >= 0".to_string(),
            });
        }
        if let LoopMode::Count(0) = self.loop_mode {
            return Err(PlayerError::InvalidConfiguration {
                reason: "overlay loop count must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Crossfade length in seconds, 1–30
    pub crossfade_duration: f64,
    pub fade_curve: FadeCurve,
    pub repeat_mode: RepeatMode,
    /// Loop count for SingleTrack repeat; 0 means infinite
    pub repeat_count: u32,
    pub volume: f32,
    pub session_mode: SessionMode,
    pub session_options: SessionOptions,
    pub overlay: OverlayConfig,
    /// Normalize main-layer buffers at load time when set
    pub normalization: Option<NormalizationConfig>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            crossfade_duration: 5.0,
            fade_curve: FadeCurve::default(),
            repeat_mode: RepeatMode::default(),
            repeat_count: 0,
            volume: 1.0,
            session_mode: SessionMode::default(),
            session_options: SessionOptions::default(),
            overlay: OverlayConfig::default(),
            normalization: None,
        }
    }
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1.0..=30.0).contains(&self.crossfade_duration) {
            return Err(PlayerError::InvalidConfiguration {
                reason: format!(
                    "crossfade_duration must be in [1, 30] seconds, got {}",
                    self.crossfade_duration
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PlayerError::InvalidConfiguration {
                reason: format!("volume must be in [0, 1], got {}", self.volume),
            });
        }
        self.overlay.validate()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PlayerConfig =
            toml::from_str(s).map_err(|e| PlayerError::InvalidConfiguration {
                reason: format!("toml parse error: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }
}
