//! Core audio data types.
//!
//! Decoded audio is stored planar (one `Vec<f32>` per channel) because the
//! DSP kernel filters channels independently. Hosts that need interleaved
//! frames convert at the graph boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Immutable track identity plus load-time metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Stable identity for subjects/events
    pub id: Uuid,
    /// Source URI (file path or file:// URI the host can open)
    pub uri: String,
    /// Optional user-supplied metadata (title, artist, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Format details, populated on first load
    #[serde(default)]
    pub info: Option<TrackInfo>,
}

impl Track {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            metadata: HashMap::new(),
            info: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Duration in seconds, if the track has been loaded.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.info.as_ref().map(|i| i.duration_seconds)
    }
}

/// Format details gained when a track's buffer is first decoded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Whether the source was stored interleaved; decoded buffers are
    /// always planar regardless.
    pub interleaved: bool,
}

/// Decoded PCM audio: float32, non-interleaved, shared read-only.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
    /// Sample rate of the stored samples
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        debug_assert!(
            channels.windows(2).all(|w| w[0].len() == w[1].len()),
            "all channels must hold the same frame count"
        );
        Self {
            channels,
            sample_rate,
        }
    }

    /// A stereo buffer of silence, mostly useful in tests.
    pub fn silence(frames: usize, sample_rate: u32) -> Self {
        Self::new(vec![vec![0.0; frames]; 2], sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Largest absolute sample value across all channels.
    pub fn sample_peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0_f32, |peak, &s| peak.max(s.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_starts_without_info() {
        let track = Track::new("file:///music/rain.flac");
        assert!(track.info.is_none());
        assert!(track.duration_seconds().is_none());
    }

    #[test]
    fn test_track_metadata_builder() {
        let track = Track::new("a.wav").with_metadata("title", "Dawn");
        assert_eq!(track.metadata.get("title").map(String::as_str), Some("Dawn"));
    }

    #[test]
    fn test_buffer_duration() {
        let buf = DecodedBuffer::silence(44100, 44100);
        assert_eq!(buf.frames(), 44100);
        assert_eq!(buf.channel_count(), 2);
        assert!((buf.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_peak() {
        let mut buf = DecodedBuffer::silence(16, 44100);
        buf.channels[1][7] = -0.75;
        assert!((buf.sample_peak() - 0.75).abs() < 1e-6);
    }
}
