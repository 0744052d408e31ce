//! Shared test fixtures: a synthetic PCM reader and a fully wired player
//! over the simulated host.

#![allow(dead_code)]

use lull_engine::audio::decode::PcmReader;
use lull_engine::audio::types::{DecodedBuffer, Track};
use lull_engine::error::DecodeError;
use lull_engine::host::sim::{SimGraph, SimSession};
use lull_engine::{AmbientPlayer, PlayerConfig};
use std::f64::consts::PI;
use std::sync::Arc;

/// Synthesizes a stereo 440 Hz sine for URIs shaped like `sine-<seconds>s`,
/// e.g. `sine-10s.test` or `sine-2.5s.test`. Unknown URIs fail like a
/// missing file.
pub struct SineReader;

impl SineReader {
    fn parse_seconds(uri: &str) -> Option<f64> {
        let rest = uri.split("sine-").nth(1)?;
        let digits = rest.split('s').next()?;
        digits.parse::<f64>().ok()
    }
}

impl PcmReader for SineReader {
    fn read(&self, uri: &str) -> Result<DecodedBuffer, DecodeError> {
        let seconds = Self::parse_seconds(uri).ok_or_else(|| DecodeError::FileNotFound {
            uri: uri.to_string(),
        })?;
        let sample_rate = 44_100u32;
        let frames = (seconds * sample_rate as f64) as usize;
        let channel: Vec<f32> = (0..frames)
            .map(|i| (0.4 * (2.0 * PI * 440.0 * i as f64 / sample_rate as f64).sin()) as f32)
            .collect();
        Ok(DecodedBuffer::new(vec![channel.clone(), channel], sample_rate))
    }
}

/// A track whose decoded duration will be `seconds`.
pub fn sine_track(seconds: f64) -> Track {
    Track::new(format!("sine-{seconds}s.test"))
}

/// Player wired to the simulated graph and session.
pub fn make_player(
    config: PlayerConfig,
) -> (Arc<AmbientPlayer>, Arc<SimGraph>, Arc<SimSession>) {
    let graph = Arc::new(SimGraph::new());
    let session = Arc::new(SimSession::new());
    let player = AmbientPlayer::new(
        Arc::clone(&graph) as _,
        Arc::clone(&session) as _,
        Arc::new(SineReader),
        config,
    )
    .expect("player construction");
    (player, graph, session)
}
