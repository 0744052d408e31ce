//! Iterative loudness normalization.
//!
//! Gain to target, limit true peaks, re-measure; the limiter eats into
//! loudness when it engages, so up to three passes converge on a result
//! that satisfies both the LUFS target and the peak ceiling. Atmospheric
//! material rarely needs more than one.

use super::limiter::limit_true_peak;
use super::loudness::measure_integrated_lufs;
use super::resample::{resample_buffer, TARGET_SAMPLE_RATE};
use super::true_peak::true_peak_db;
use crate::audio::types::DecodedBuffer;
use crate::error::DspError;
use lull_common::timing::db_to_linear;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Normalization targets and iteration limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Integrated loudness target in LUFS
    pub target_lufs: f64,
    /// True-peak ceiling in dBTP
    pub max_true_peak_db: f64,
    /// Maximum measure→gain→limit passes
    pub max_iterations: u32,
    /// Acceptable loudness miss in LU
    pub tolerance_lu: f64,
    /// Oversampling factor for peak metering and limiting
    pub oversample_factor: usize,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            target_lufs: -16.0,
            max_true_peak_db: -1.0,
            max_iterations: 3,
            tolerance_lu: 0.1,
            oversample_factor: 4,
        }
    }
}

fn apply_gain(buffer: &mut DecodedBuffer, gain_db: f64) {
    let gain = db_to_linear(gain_db) as f32;
    for channel in &mut buffer.channels {
        for s in channel.iter_mut() {
            *s *= gain;
        }
    }
}

/// Normalize a decoded buffer to the configured integrated loudness while
/// keeping true peaks at or below the ceiling.
///
/// The output is always at [`TARGET_SAMPLE_RATE`]. Silent input (measured
/// −∞) is returned resampled but otherwise untouched: there is no gain
/// that makes silence reach a loudness target.
pub fn normalize_buffer(
    buffer: &DecodedBuffer,
    config: &NormalizationConfig,
) -> Result<DecodedBuffer, DspError> {
    if buffer.is_empty() {
        return Err(DspError::EmptyBuffer);
    }
    if buffer
        .channels
        .iter()
        .any(|c| c.len() != buffer.frames())
    {
        return Err(DspError::UnsupportedFormat(
            "channels hold differing frame counts".to_string(),
        ));
    }

    let mut work = resample_buffer(buffer, TARGET_SAMPLE_RATE)?;
    let factor = config.oversample_factor.max(1);

    for iteration in 0..config.max_iterations.max(1) {
        let measured = measure_integrated_lufs(&work);
        if measured == f64::NEG_INFINITY {
            warn!("buffer measures -inf LUFS, skipping normalization");
            return Ok(work);
        }

        let gain_db = config.target_lufs - measured;
        apply_gain(&mut work, gain_db);
        work = limit_true_peak(&work, config.max_true_peak_db, factor)?;

        let remeasured = measure_integrated_lufs(&work);
        let peak = true_peak_db(&work, factor);
        debug!(
            iteration,
            measured, gain_db, remeasured, peak, "normalization pass"
        );

        if (remeasured - config.target_lufs).abs() <= config.tolerance_lu
            && peak <= config.max_true_peak_db + config.tolerance_lu
        {
            break;
        }
    }

    Ok(work)
}
