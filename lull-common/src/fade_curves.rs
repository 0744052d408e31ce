//! Fade curve shapes for crossfades and volume ramps.
//!
//! Each curve provides a different perceptual quality:
//! - Linear: constant rate of change (precise, predictable)
//! - EasePower: quadratic ramp, gentle start on the way in
//! - EaseIn: cubic ramp, very soft onset for long ambient fades
//! - EaseOut: cubic ramp mirrored, soft landing
//! - EqualPower: constant perceived loudness through a crossfade

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Fade curve types.
///
/// Fade-in curves map progress 0.0 → 1.0 onto gain 0.0 → 1.0; fade-out
/// curves map the same progress onto gain 1.0 → 0.0. For every curve,
/// `fade_out(p)` is the gain the outgoing side of a crossfade holds while
/// the incoming side holds `fade_in(p)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,

    /// v(t) = t² — slow start, fast finish
    EasePower,

    /// v(t) = t³ — softest possible onset
    EaseIn,

    /// v(t) = 1 − (1−t)³ — fast start, soft landing
    EaseOut,

    /// v(t) = sin(t·π/2) — fade_in² + fade_out² = 1 at every point
    EqualPower,
}

impl FadeCurve {
    /// Gain multiplier for the incoming side at `progress` ∈ [0, 1].
    pub fn fade_in(&self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,
            FadeCurve::EasePower => t * t,
            FadeCurve::EaseIn => t * t * t,
            FadeCurve::EaseOut => {
                let inv = 1.0 - t;
                1.0 - inv * inv * inv
            }
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Gain multiplier for the outgoing side at `progress` ∈ [0, 1].
    ///
    /// This is the complementary shape of [`fade_in`](Self::fade_in): at
    /// progress 0 the outgoing side is at full gain, at 1 it is silent.
    pub fn fade_out(&self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::EasePower => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::EaseIn => {
                let inv = 1.0 - t;
                inv * inv * inv
            }
            FadeCurve::EaseOut => 1.0 - t * t * t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// Interpolate a volume ramp from `from` to `to` at `progress`.
    ///
    /// Uses the fade-in shape of the curve; works for both rising and
    /// falling ramps since the endpoints are explicit.
    pub fn interpolate(&self, from: f32, to: f32, progress: f32) -> f32 {
        from + (to - from) * self.fade_in(progress)
    }

    /// Parse curve from its configuration string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(FadeCurve::Linear),
            "ease_power" | "easepower" | "power" => Some(FadeCurve::EasePower),
            "ease_in" | "easein" => Some(FadeCurve::EaseIn),
            "ease_out" | "easeout" => Some(FadeCurve::EaseOut),
            "equal_power" | "equalpower" => Some(FadeCurve::EqualPower),
            _ => None,
        }
    }

    /// Configuration string representation.
    pub fn as_name(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::EasePower => "ease_power",
            FadeCurve::EaseIn => "ease_in",
            FadeCurve::EaseOut => "ease_out",
            FadeCurve::EqualPower => "equal_power",
        }
    }
}

impl Default for FadeCurve {
    /// Equal-power is the default: crossfades hold perceived loudness steady.
    fn default() -> Self {
        FadeCurve::EqualPower
    }
}
