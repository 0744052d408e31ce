//! Timing and gain conversion helpers.
//!
//! Frame arithmetic is done in `u64` at the owning sample rate; seconds are
//! `f64` at API boundaries. Gain conversions use the 20·log10 convention.

use std::time::Duration;

/// Convert seconds to a frame count at the given sample rate.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}

/// Convert a frame count to seconds at the given sample rate.
pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 / sample_rate as f64
}

/// Convert seconds to a `Duration`, clamping negatives to zero.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(seconds)
    }
}

/// Decibels to linear amplitude.
pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Linear amplitude to decibels; silence floors at −120 dB.
pub fn linear_to_db(linear: f64) -> f64 {
    20.0 * linear.max(1e-6).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_frames_round_trip() {
        let frames = seconds_to_frames(2.5, 44100);
        assert_eq!(frames, 110250);
        assert!((frames_to_seconds(frames, 44100) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_negative_seconds_clamp() {
        assert_eq!(seconds_to_frames(-1.0, 44100), 0);
        assert_eq!(seconds_to_duration(-1.0), Duration::ZERO);
    }

    #[test]
    fn test_db_linear_round_trip() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-9);
        assert!((db_to_linear(-6.0) - 0.501187).abs() < 1e-4);
        assert!((linear_to_db(db_to_linear(-14.0)) - (-14.0)).abs() < 1e-6);
    }

    #[test]
    fn test_silence_floor() {
        assert!(linear_to_db(0.0) <= -120.0 + 1e-6);
    }
}
