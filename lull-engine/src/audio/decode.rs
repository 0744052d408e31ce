//! Whole-file PCM decoding behind the `PcmReader` seam.
//!
//! The cache only needs "URI in, decoded buffer out"; hosts with their own
//! decode stack implement [`PcmReader`] and hand it to the cache. The
//! default implementation uses symphonia and supports whatever the enabled
//! container/codec features cover (wav/flac/vorbis plus mp3/aac/mp4).

use crate::audio::types::DecodedBuffer;
use crate::error::DecodeError;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{SampleBuffer, Signal};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Blocking whole-file PCM reader.
///
/// Called from `spawn_blocking` inside the cache; implementations may take
/// their time but must not assume a tokio context.
pub trait PcmReader: Send + Sync {
    fn read(&self, uri: &str) -> Result<DecodedBuffer, DecodeError>;
}

/// Default reader backed by symphonia.
pub struct SymphoniaReader;

impl SymphoniaReader {
    /// Accept both plain paths and `file://` URIs.
    fn uri_to_path(uri: &str) -> &Path {
        Path::new(uri.strip_prefix("file://").unwrap_or(uri))
    }
}

impl PcmReader for SymphoniaReader {
    fn read(&self, uri: &str) -> Result<DecodedBuffer, DecodeError> {
        let path = Self::uri_to_path(uri);
        let file = File::open(path).map_err(|_| DecodeError::FileNotFound {
            uri: uri.to_string(),
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::ProbeFailed {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| DecodeError::NoAudioTracks {
                uri: uri.to_string(),
            })?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat {
                uri: uri.to_string(),
                format: e.to_string(),
            })?;

        let mut channels: Vec<Vec<f32>> = Vec::new();
        let mut sample_rate = codec_params.sample_rate.unwrap_or(44_100);
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => {
                    return Err(DecodeError::DecodeFailed {
                        uri: uri.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A corrupt packet is recoverable; log and keep going
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(uri, error = e, "skipping corrupt packet");
                    continue;
                }
                Err(e) => {
                    return Err(DecodeError::DecodeFailed {
                        uri: uri.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            let spec = *decoded.spec();
            if sample_buf.is_none() {
                sample_rate = spec.rate;
                channels = vec![Vec::new(); spec.channels.count()];
            }
            // Packet capacity can grow mid-stream; size the copy buffer to
            // the largest packet seen
            let needed = decoded.capacity() * spec.channels.count();
            if sample_buf
                .as_ref()
                .map(|sb| sb.capacity() < needed)
                .unwrap_or(true)
            {
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }

            let sb = sample_buf.as_mut().expect("sample buffer initialized");
            sb.copy_interleaved_ref(decoded);

            let channel_count = channels.len();
            for frame in sb.samples().chunks_exact(channel_count) {
                for (ch, &sample) in frame.iter().enumerate() {
                    channels[ch].push(sample);
                }
            }
        }

        if channels.is_empty() || channels[0].is_empty() {
            return Err(DecodeError::NoAudioTracks {
                uri: uri.to_string(),
            });
        }

        let buffer = DecodedBuffer::new(channels, sample_rate);
        debug!(
            uri,
            frames = buffer.frames(),
            sample_rate,
            channels = buffer.channel_count(),
            "decoded file"
        );
        Ok(buffer)
    }
}
