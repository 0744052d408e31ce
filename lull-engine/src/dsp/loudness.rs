//! Gated integrated loudness measurement per ITU-R BS.1770.
//!
//! The signal is K-weighted, cut into 400 ms blocks at a 100 ms step
//! (75% overlap), and block energies are averaged through two gates: an
//! absolute gate at −70 LUFS and a relative gate 10 LU below the mean of
//! the absolutely-gated blocks. Signals shorter than one block fall back to
//! an ungated whole-signal mean.

use super::kweighting::KWeighting;
use crate::audio::types::DecodedBuffer;

/// Energy → LUFS offset from the BS.1770 channel summation.
const LUFS_OFFSET: f64 = -0.691;

/// Absolute gate threshold.
const ABSOLUTE_GATE_LUFS: f64 = -70.0;

/// Relative gate depth below the ungated mean.
const RELATIVE_GATE_LU: f64 = 10.0;

/// Gating block length in seconds.
const BLOCK_SECONDS: f64 = 0.4;

/// Gating block step in seconds (75% overlap).
const STEP_SECONDS: f64 = 0.1;

/// Per-channel weights for the energy summation.
///
/// Orderings follow the usual layouts: mono/stereo/3.0 are all unity;
/// quad puts the surrounds last; 5.x is L R C LFE Ls Rs. Channels past the
/// known layouts weigh 1.0.
pub fn channel_weights(channel_count: usize) -> Vec<f64> {
    match channel_count {
        0 => Vec::new(),
        1 | 2 | 3 => vec![1.0; channel_count],
        4 => vec![1.0, 1.0, 1.41, 1.41],
        _ => {
            let mut weights = vec![1.0; channel_count];
            weights[3] = 0.0; // LFE
            weights[4] = 1.41;
            if channel_count > 5 {
                weights[5] = 1.41;
            }
            weights
        }
    }
}

fn energy_to_lufs(energy: f64) -> f64 {
    if energy > 0.0 {
        LUFS_OFFSET + 10.0 * energy.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// Measure integrated loudness in LUFS.
///
/// Returns `f64::NEG_INFINITY` for silence and for signals where no block
/// survives gating.
pub fn measure_integrated_lufs(buffer: &DecodedBuffer) -> f64 {
    let frames = buffer.frames();
    if frames == 0 || buffer.channel_count() == 0 {
        return f64::NEG_INFINITY;
    }

    let weights = channel_weights(buffer.channel_count());

    // K-weight each channel, then build prefix sums of squared samples so
    // every block energy is two lookups instead of a window scan.
    let mut prefix: Vec<Vec<f64>> = Vec::with_capacity(buffer.channel_count());
    for channel in &buffer.channels {
        let mut filter = KWeighting::new(buffer.sample_rate);
        let filtered = filter.process_channel(channel);
        let mut sums = Vec::with_capacity(frames + 1);
        let mut acc = 0.0;
        sums.push(0.0);
        for s in filtered {
            acc += s * s;
            sums.push(acc);
        }
        prefix.push(sums);
    }

    let window = (BLOCK_SECONDS * buffer.sample_rate as f64).round() as usize;
    let step = (STEP_SECONDS * buffer.sample_rate as f64).round() as usize;

    let weighted_energy = |start: usize, len: usize| -> f64 {
        let mut energy = 0.0;
        for (ch, sums) in prefix.iter().enumerate() {
            energy += weights[ch] * (sums[start + len] - sums[start]) / len as f64;
        }
        energy
    };

    // Too short for one gating block: ungated whole-signal mean
    if frames < window {
        return energy_to_lufs(weighted_energy(0, frames));
    }

    let mut block_energies = Vec::new();
    let mut start = 0;
    while start + window <= frames {
        block_energies.push(weighted_energy(start, window));
        start += step;
    }

    // Absolute gate
    let absolute: Vec<f64> = block_energies
        .into_iter()
        .filter(|&e| energy_to_lufs(e) > ABSOLUTE_GATE_LUFS)
        .collect();
    if absolute.is_empty() {
        return f64::NEG_INFINITY;
    }

    // Relative gate, 10 LU below the mean of the surviving blocks
    let ungated_mean = absolute.iter().sum::<f64>() / absolute.len() as f64;
    let relative_threshold = energy_to_lufs(ungated_mean) - RELATIVE_GATE_LU;

    let gated: Vec<f64> = absolute
        .into_iter()
        .filter(|&e| energy_to_lufs(e) > relative_threshold)
        .collect();
    if gated.is_empty() {
        return f64::NEG_INFINITY;
    }

    energy_to_lufs(gated.iter().sum::<f64>() / gated.len() as f64)
}
