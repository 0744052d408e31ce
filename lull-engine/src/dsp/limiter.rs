//! Look-ahead true-peak limiter for the normalization pipeline.
//!
//! Operates offline on the 4×-oversampled signal: a forward-looking maximum
//! over a 1 ms window (monotonic deque, O(n)) yields the gain each sample
//! will need *before* the peak arrives, a one-pole smoother shapes the gain
//! with 0.5 ms attack / 50 ms release, and a final clamp `g ≤ desired`
//! guarantees the ceiling regardless of smoothing. Gain reduction is linked
//! across channels to avoid image shift.

use super::true_peak::{true_peak_linear, PolyphaseTaps};
use crate::audio::types::DecodedBuffer;
use crate::error::DspError;
use lull_common::timing::db_to_linear;
use std::collections::VecDeque;

/// Forward-look window.
const LOOKAHEAD_SECONDS: f64 = 0.001;

/// Attack time constant for the gain smoother.
const ATTACK_SECONDS: f64 = 0.0005;

/// Release time constant for the gain smoother.
const RELEASE_SECONDS: f64 = 0.05;

/// Guard against division by vanishing peaks.
const PEAK_EPSILON: f64 = 1e-12;

/// `out[i] = max(values[i .. i+window])`, clipped at the end of the slice.
///
/// Monotonic deque over indices, O(n): computed as a trailing sliding
/// maximum over the reversed sequence.
fn forward_max(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![0.0; n];
    let mut deque: VecDeque<usize> = VecDeque::new();

    // Iterate right-to-left; the deque holds candidate indices of the
    // window [i, i+window), front = position of the maximum.
    for i in (0..n).rev() {
        while let Some(&back) = deque.back() {
            if values[back] <= values[i] {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(i);
        while let Some(&front) = deque.front() {
            if front >= i + window {
                deque.pop_front();
            } else {
                break;
            }
        }
        out[i] = values[*deque.front().expect("deque holds current index")];
    }
    out
}

fn limit_pass(
    buffer: &DecodedBuffer,
    ceiling_linear: f64,
    factor: usize,
) -> Result<DecodedBuffer, DspError> {
    let taps = PolyphaseTaps::new(factor);
    let oversampled: Vec<Vec<f32>> = buffer
        .channels
        .iter()
        .map(|ch| taps.oversample(ch))
        .collect();
    let os_len = oversampled.first().map(|c| c.len()).unwrap_or(0);
    if os_len == 0 {
        return Err(DspError::EmptyBuffer);
    }

    let os_rate = buffer.sample_rate as f64 * factor as f64;

    // Per-sample peak linked across channels
    let mut linked_peak = vec![0.0_f64; os_len];
    for channel in &oversampled {
        for (i, &s) in channel.iter().enumerate() {
            let a = s.abs() as f64;
            if a > linked_peak[i] {
                linked_peak[i] = a;
            }
        }
    }

    let window = (LOOKAHEAD_SECONDS * os_rate).round().max(1.0) as usize;
    let future_peak = forward_max(&linked_peak, window);

    let attack_coeff = (-1.0 / (ATTACK_SECONDS * os_rate)).exp();
    let release_coeff = (-1.0 / (RELEASE_SECONDS * os_rate)).exp();

    let mut gain = vec![0.0_f64; os_len];
    let mut g = 1.0_f64;
    for i in 0..os_len {
        let desired = (ceiling_linear / future_peak[i].max(PEAK_EPSILON)).min(1.0);
        // Attack pulls down fast, release recovers slowly
        g = if desired < g {
            attack_coeff * g + (1.0 - attack_coeff) * desired
        } else {
            release_coeff * g + (1.0 - release_coeff) * desired
        };
        // Smoothing must never let a peak through
        g = g.min(desired);
        gain[i] = g;
    }

    let limited: Vec<Vec<f32>> = oversampled
        .into_iter()
        .map(|mut channel| {
            for (i, s) in channel.iter_mut().enumerate() {
                *s = (*s as f64 * gain[i]) as f32;
            }
            taps.decimate(&channel)
        })
        .collect();

    Ok(DecodedBuffer::new(limited, buffer.sample_rate))
}

/// Limit the buffer so its true peak stays at or below `ceiling_db` (dBTP).
///
/// The decimation filter can reintroduce a hair of overshoot; when the
/// round trip lands above the ceiling the pass runs once more on its own
/// output.
pub fn limit_true_peak(
    buffer: &DecodedBuffer,
    ceiling_db: f64,
    factor: usize,
) -> Result<DecodedBuffer, DspError> {
    if buffer.is_empty() {
        return Err(DspError::EmptyBuffer);
    }
    let factor = factor.max(1);
    let ceiling_linear = db_to_linear(ceiling_db);

    // Nothing to do when the signal already sits under the ceiling
    if true_peak_linear(buffer, factor) <= ceiling_linear {
        return Ok(buffer.clone());
    }

    let once = limit_pass(buffer, ceiling_linear, factor)?;
    if true_peak_linear(&once, factor) > ceiling_linear * 1.001 {
        return limit_pass(&once, ceiling_linear, factor);
    }
    Ok(once)
}
