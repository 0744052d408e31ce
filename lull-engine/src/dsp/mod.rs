//! Offline loudness-normalization kernel.
//!
//! The pipeline runs once per decoded buffer, at load time:
//! resample → measure integrated loudness → gain → true-peak limit →
//! re-measure, iterating until the result lands inside tolerance.
//!
//! All measurement follows ITU-R BS.1770 (K-weighting + two-stage gating);
//! peaks are measured on a 4× oversampled signal to approximate inter-sample
//! peaks.

pub mod kweighting;
pub mod limiter;
pub mod loudness;
pub mod normalize;
pub mod resample;
pub mod true_peak;

pub use kweighting::KWeighting;
pub use limiter::limit_true_peak;
pub use loudness::measure_integrated_lufs;
pub use normalize::{normalize_buffer, NormalizationConfig};
pub use resample::{resample_buffer, TARGET_SAMPLE_RATE};
pub use true_peak::{true_peak_db, true_peak_linear};
