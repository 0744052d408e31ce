//! Offline resampling to the normalization rate using rubato.
//!
//! Whole buffers are converted in one shot: the chunk size is the input
//! length, so no filter state survives between calls and no seams appear.

use crate::audio::types::DecodedBuffer;
use crate::error::DspError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Measurement and playback reference rate.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// Resample a buffer to `target_rate`.
///
/// Already-matching input is returned as a cheap clone. Uses `FastFixedIn`
/// with a septic polynomial, the quality/cost tradeoff used for playback
/// conversion as well.
pub fn resample_buffer(buffer: &DecodedBuffer, target_rate: u32) -> Result<DecodedBuffer, DspError> {
    if buffer.is_empty() {
        return Err(DspError::EmptyBuffer);
    }
    if buffer.sample_rate == target_rate {
        return Ok(buffer.clone());
    }

    let input_frames = buffer.frames();
    debug!(
        from = buffer.sample_rate,
        to = target_rate,
        frames = input_frames,
        "resampling buffer"
    );

    let mut resampler = FastFixedIn::<f32>::new(
        target_rate as f64 / buffer.sample_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        buffer.channel_count(),
    )
    .map_err(|e| DspError::ConverterInitFailed(e.to_string()))?;

    let output = resampler
        .process(&buffer.channels, None)
        .map_err(|e| DspError::ConversionFailed(e.to_string()))?;

    Ok(DecodedBuffer::new(output, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine(sample_rate: u32, seconds: f64) -> DecodedBuffer {
        let frames = (seconds * sample_rate as f64) as usize;
        let channel: Vec<f32> = (0..frames)
            .map(|i| (0.5 * (2.0 * PI * 440.0 * i as f64 / sample_rate as f64).sin()) as f32)
            .collect();
        DecodedBuffer::new(vec![channel.clone(), channel], sample_rate)
    }

    #[test]
    fn test_pass_through_when_rates_match() {
        let buf = sine(44_100, 0.5);
        let out = resample_buffer(&buf, 44_100).unwrap();
        assert_eq!(out.frames(), buf.frames());
        assert_eq!(out.channels[0], buf.channels[0]);
    }

    #[test]
    fn test_48k_to_44k_length() {
        let buf = sine(48_000, 1.0);
        let out = resample_buffer(&buf, 44_100).unwrap();
        assert_eq!(out.sample_rate, 44_100);

        // Within 1% of the ideal output length
        let ideal = 44_100.0;
        let got = out.frames() as f64;
        assert!((got - ideal).abs() / ideal < 0.01, "got {got} frames");
    }

    #[test]
    fn test_amplitude_preserved() {
        let buf = sine(48_000, 1.0);
        let out = resample_buffer(&buf, 44_100).unwrap();

        let rms = |ch: &[f32]| {
            let mid = &ch[ch.len() / 4..ch.len() * 3 / 4];
            (mid.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / mid.len() as f64).sqrt()
        };
        let before = rms(&buf.channels[0]);
        let after = rms(&out.channels[0]);
        assert!((before - after).abs() / before < 0.05, "{before} -> {after}");
    }

    #[test]
    fn test_empty_rejected() {
        let buf = DecodedBuffer::new(vec![vec![]], 48_000);
        assert!(matches!(
            resample_buffer(&buf, 44_100),
            Err(DspError::EmptyBuffer)
        ));
    }
}
