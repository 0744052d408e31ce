//! Oversampled true-peak measurement.
//!
//! Sample peaks miss inter-sample overshoot introduced by the
//! reconstruction filter of a DAC. Interpolating 4× with a windowed-sinc
//! polyphase filter approximates the reconstructed waveform closely enough
//! for the ±0.1 dB accuracy this engine needs.

use crate::audio::types::DecodedBuffer;

/// Default oversampling factor.
pub const OVERSAMPLE_FACTOR: usize = 4;

/// Taps per polyphase phase.
const TAPS_PER_PHASE: usize = 12;

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Polyphase windowed-sinc interpolator taps.
///
/// `phases[p][k]` multiplies `x[m + half - k]` to produce output sample
/// `y[m·L + p]`. Each phase is normalized to unit DC gain so a constant
/// input reproduces exactly.
pub(crate) struct PolyphaseTaps {
    pub factor: usize,
    pub phases: Vec<Vec<f64>>,
}

impl PolyphaseTaps {
    pub fn new(factor: usize) -> Self {
        let total = factor * TAPS_PER_PHASE;
        let center = (total - 1) as f64 / 2.0;

        // Blackman-windowed sinc prototype
        let mut prototype = Vec::with_capacity(total);
        for n in 0..total {
            let x = (n as f64 - center) / factor as f64;
            let w = 0.42
                - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / (total - 1) as f64).cos()
                + 0.08 * (4.0 * std::f64::consts::PI * n as f64 / (total - 1) as f64).cos();
            prototype.push(sinc(x) * w);
        }

        let mut phases = Vec::with_capacity(factor);
        for p in 0..factor {
            let mut taps: Vec<f64> = (0..TAPS_PER_PHASE)
                .map(|k| prototype[k * factor + p])
                .collect();
            let sum: f64 = taps.iter().sum();
            if sum.abs() > 1e-9 {
                for t in &mut taps {
                    *t /= sum;
                }
            }
            taps.reverse(); // store in convolution order
            phases.push(taps);
        }

        Self { factor, phases }
    }

    /// Interpolate one channel by the oversampling factor.
    pub fn oversample(&self, input: &[f32]) -> Vec<f32> {
        let n = input.len();
        let mut output = Vec::with_capacity(n * self.factor);
        let half = TAPS_PER_PHASE / 2;

        let sample = |idx: i64| -> f64 {
            if idx < 0 || idx >= n as i64 {
                0.0
            } else {
                input[idx as usize] as f64
            }
        };

        for m in 0..n as i64 {
            for taps in &self.phases {
                let mut acc = 0.0;
                for (k, &tap) in taps.iter().enumerate() {
                    acc += tap * sample(m + half as i64 - k as i64);
                }
                output.push(acc as f32);
            }
        }
        output
    }

    /// Low-pass and decimate one channel back down by the factor.
    pub fn decimate(&self, input: &[f32]) -> Vec<f32> {
        let out_len = input.len() / self.factor;
        let total = self.factor * TAPS_PER_PHASE;
        let half = (total / 2) as i64;
        let mut output = Vec::with_capacity(out_len);

        // Flat prototype reassembled from the phases, scaled for unit
        // passband gain after decimation
        let mut flat = vec![0.0; total];
        for (p, taps) in self.phases.iter().enumerate() {
            for (k, &tap) in taps.iter().enumerate() {
                let n = (TAPS_PER_PHASE - 1 - k) * self.factor + p;
                flat[n] = tap / self.factor as f64;
            }
        }

        let sample = |idx: i64| -> f64 {
            if idx < 0 || idx >= input.len() as i64 {
                0.0
            } else {
                input[idx as usize] as f64
            }
        };

        for m in 0..out_len {
            let center = (m * self.factor) as i64;
            let mut acc = 0.0;
            for (n, &tap) in flat.iter().enumerate() {
                acc += tap * sample(center + n as i64 - half);
            }
            output.push(acc as f32);
        }
        output
    }
}

/// Largest absolute value of the oversampled signal, linear scale.
///
/// Always at least the plain sample peak, so quantized-but-exact peaks are
/// never under-reported.
pub fn true_peak_linear(buffer: &DecodedBuffer, factor: usize) -> f64 {
    let taps = PolyphaseTaps::new(factor.max(1));
    let mut peak = buffer.sample_peak() as f64;
    for channel in &buffer.channels {
        for s in taps.oversample(channel) {
            let a = s.abs() as f64;
            if a > peak {
                peak = a;
            }
        }
    }
    peak
}

/// True peak in dBTP. Silence floors at −120 dBTP.
pub fn true_peak_db(buffer: &DecodedBuffer, factor: usize) -> f64 {
    lull_common::timing::linear_to_db(true_peak_linear(buffer, factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_constant_signal_reproduced() {
        let taps = PolyphaseTaps::new(4);
        let input = vec![0.5_f32; 64];
        let output = taps.oversample(&input);
        assert_eq!(output.len(), 256);
        // Away from the edges every output sample equals the input level
        for &s in &output[48..208] {
            assert!((s - 0.5).abs() < 1e-3, "got {s}");
        }
    }

    #[test]
    fn test_oversample_decimate_round_trip() {
        let taps = PolyphaseTaps::new(4);
        let input: Vec<f32> = (0..512)
            .map(|i| (2.0 * PI * 440.0 * i as f64 / 44_100.0).sin() as f32 * 0.5)
            .collect();
        let up = taps.oversample(&input);
        let down = taps.decimate(&up);
        assert_eq!(down.len(), input.len());

        // Compare away from filter edges
        let mut max_err = 0.0_f32;
        for i in 32..480 {
            max_err = max_err.max((down[i] - input[i]).abs());
        }
        assert!(max_err < 0.02, "round-trip error {max_err}");
    }

    /// The classic inter-sample peak case: a sine sampled so its crests
    /// fall between samples. Sample peak under-reads; true peak must not.
    #[test]
    fn test_inter_sample_peak_detected() {
        let sample_rate = 44_100;
        // fs/4 with a 45° phase offset puts every crest between samples
        let channel: Vec<f32> = (0..4096)
            .map(|i| (PI / 2.0 * i as f64 + PI / 4.0).sin() as f32 * 0.99)
            .collect();
        let buf = DecodedBuffer::new(vec![channel], sample_rate);

        let sample_peak = buf.sample_peak() as f64;
        let true_peak = true_peak_linear(&buf, 4);

        // Samples sit at ±0.99/√2 ≈ 0.700; reconstruction reaches ≈ 0.99
        assert!(sample_peak < 0.75, "sample peak {sample_peak}");
        assert!(true_peak > 0.93, "true peak {true_peak}");
    }

    #[test]
    fn test_true_peak_not_below_sample_peak() {
        let channel: Vec<f32> = (0..1000)
            .map(|i| if i == 500 { 0.9 } else { 0.0 })
            .collect();
        let buf = DecodedBuffer::new(vec![channel], 44_100);
        assert!(true_peak_linear(&buf, 4) >= 0.9 - 1e-6);
    }

    #[test]
    fn test_silence_floor_db() {
        let buf = DecodedBuffer::silence(1024, 44_100);
        assert!(true_peak_db(&buf, 4) <= -119.0);
    }
}
