//! K-weighting pre-filter per ITU-R BS.1770.
//!
//! Two cascaded biquads: a high-shelf boost (~+4 dB) modeling the acoustic
//! effect of the head, and the RLB high-pass removing inaudible rumble.
//! Coefficients are designed at the actual input sample rate by bilinear
//! prewarping (`K = tan(π·f0/fs)`), so measurement is correct for any rate,
//! not just the 48 kHz the reference tables assume.

use std::f64::consts::PI;

/// Shelf stage center frequency (Hz).
const SHELF_F0: f64 = 1681.974450955533;
/// Shelf gain (dB).
const SHELF_GAIN_DB: f64 = 3.999843853973347;
/// Shelf quality factor.
const SHELF_Q: f64 = 0.7071752369554196;
/// Exponent splitting the shelf gain between numerator terms.
const SHELF_VB_EXP: f64 = 0.4996667741545416;

/// RLB high-pass corner frequency (Hz).
const HIGHPASS_F0: f64 = 38.13547087602444;
/// RLB high-pass quality factor.
const HIGHPASS_Q: f64 = 0.5003270373238773;

/// One biquad section, direct form II transposed, f64 state.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// The full two-stage K-weighting filter for one channel.
#[derive(Debug, Clone)]
pub struct KWeighting {
    shelf: Biquad,
    highpass: Biquad,
}

impl KWeighting {
    /// Design the filter for the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        let fs = sample_rate as f64;

        // Stage 1: high shelf
        let k = (PI * SHELF_F0 / fs).tan();
        let vh = 10.0_f64.powf(SHELF_GAIN_DB / 20.0);
        let vb = vh.powf(SHELF_VB_EXP);
        let a0 = 1.0 + k / SHELF_Q + k * k;
        let shelf = Biquad::new(
            (vh + vb * k / SHELF_Q + k * k) / a0,
            2.0 * (k * k - vh) / a0,
            (vh - vb * k / SHELF_Q + k * k) / a0,
            2.0 * (k * k - 1.0) / a0,
            (1.0 - k / SHELF_Q + k * k) / a0,
        );

        // Stage 2: RLB high-pass; numerator stays [1, -2, 1] per the
        // reference realization
        let k = (PI * HIGHPASS_F0 / fs).tan();
        let a0 = 1.0 + k / HIGHPASS_Q + k * k;
        let highpass = Biquad::new(
            1.0,
            -2.0,
            1.0,
            2.0 * (k * k - 1.0) / a0,
            (1.0 - k / HIGHPASS_Q + k * k) / a0,
        );

        Self { shelf, highpass }
    }

    /// Filter one sample.
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        self.highpass.process(self.shelf.process(input))
    }

    /// Filter a whole channel into a new vector.
    pub fn process_channel(&mut self, input: &[f32]) -> Vec<f64> {
        input.iter().map(|&s| self.process(s as f64)).collect()
    }

    pub fn reset(&mut self) {
        self.shelf.reset();
        self.highpass.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// At 48 kHz the prewarped design must reproduce the published
    /// BS.1770 coefficient table.
    #[test]
    fn test_matches_reference_table_at_48k() {
        let filter = KWeighting::new(48_000);

        assert!((filter.shelf.b0 - 1.53512485958697).abs() < 1e-6);
        assert!((filter.shelf.b1 - (-2.69169618940638)).abs() < 1e-6);
        assert!((filter.shelf.b2 - 1.19839281085285).abs() < 1e-6);
        assert!((filter.shelf.a1 - (-1.69065929318241)).abs() < 1e-6);
        assert!((filter.shelf.a2 - 0.73248077421585).abs() < 1e-6);

        assert!((filter.highpass.a1 - (-1.99004745483398)).abs() < 1e-6);
        assert!((filter.highpass.a2 - 0.99007225036621).abs() < 1e-6);
    }

    #[test]
    fn test_output_is_finite() {
        let mut filter = KWeighting::new(44_100);
        for i in 0..10_000 {
            let input = (2.0 * PI * 1000.0 * i as f64 / 44_100.0).sin();
            assert!(filter.process(input).is_finite());
        }
    }

    /// A 1 kHz tone sits in the flat region of the K-weighting curve:
    /// gain should be close to unity.
    #[test]
    fn test_1khz_near_unity_gain() {
        let mut filter = KWeighting::new(48_000);
        let mut in_power = 0.0;
        let mut out_power = 0.0;

        // Skip the first 4800 samples of transient
        for i in 0..48_000 {
            let input = (2.0 * PI * 1000.0 * i as f64 / 48_000.0).sin();
            let output = filter.process(input);
            if i >= 4_800 {
                in_power += input * input;
                out_power += output * output;
            }
        }

        let gain_db = 10.0 * (out_power / in_power).log10();
        assert!(gain_db.abs() < 0.2, "1 kHz gain was {gain_db} dB");
    }

    /// Low-frequency rumble is strongly attenuated by the RLB stage.
    #[test]
    fn test_rumble_attenuated() {
        let mut filter = KWeighting::new(48_000);
        let mut in_power = 0.0;
        let mut out_power = 0.0;

        for i in 0..96_000 {
            let input = (2.0 * PI * 20.0 * i as f64 / 48_000.0).sin();
            let output = filter.process(input);
            if i >= 48_000 {
                in_power += input * input;
                out_power += output * output;
            }
        }

        let gain_db = 10.0 * (out_power / in_power).log10();
        assert!(gain_db < -10.0, "20 Hz gain was {gain_db} dB");
    }

    /// High frequencies get the ~+4 dB shelf boost.
    #[test]
    fn test_shelf_boost_at_high_frequency() {
        let mut filter = KWeighting::new(48_000);
        let mut in_power = 0.0;
        let mut out_power = 0.0;

        for i in 0..48_000 {
            let input = (2.0 * PI * 10_000.0 * i as f64 / 48_000.0).sin();
            let output = filter.process(input);
            if i >= 4_800 {
                in_power += input * input;
                out_power += output * output;
            }
        }

        let gain_db = 10.0 * (out_power / in_power).log10();
        assert!(gain_db > 3.0 && gain_db < 5.0, "10 kHz gain was {gain_db} dB");
    }
}
