//! Audio data types, decoding, and the shared buffer cache.

pub mod cache;
pub mod decode;
pub mod types;

pub use cache::{BufferCache, LoadPriority};
pub use decode::{PcmReader, SymphoniaReader};
pub use types::{DecodedBuffer, Track, TrackInfo};
