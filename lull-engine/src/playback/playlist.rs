//! Ordered track sequence with a cursor and repeat-mode semantics.

use crate::audio::types::Track;
use lull_common::RepeatMode;

/// The main-layer playlist. Peeks are pure; advances honor the repeat mode.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    tracks: Vec<Track>,
    cursor: usize,
}

impl Playlist {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self { tracks, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.cursor)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Replace the sequence and reset the cursor.
    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks;
        self.cursor = 0;
    }

    /// Store format info discovered at load time on the current track.
    pub fn update_current(&mut self, track: Track) {
        if let Some(slot) = self.tracks.get_mut(self.cursor) {
            if slot.id == track.id {
                *slot = track;
            }
        }
    }

    /// The track an advance would land on, without moving the cursor.
    pub fn peek_next(&self, repeat: RepeatMode) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current(),
            RepeatMode::Off => self.tracks.get(self.cursor + 1),
            RepeatMode::Playlist => {
                let next = (self.cursor + 1) % self.tracks.len();
                self.tracks.get(next)
            }
        }
    }

    /// The track a backwards advance would land on, without moving the
    /// cursor.
    pub fn peek_previous(&self, repeat: RepeatMode) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current(),
            RepeatMode::Off => self.cursor.checked_sub(1).and_then(|i| self.tracks.get(i)),
            RepeatMode::Playlist => {
                let previous = (self.cursor + self.tracks.len() - 1) % self.tracks.len();
                self.tracks.get(previous)
            }
        }
    }

    /// Move the cursor forward per the repeat mode and return the new
    /// current track. `None` means the sequence is exhausted (Off at end).
    pub fn advance_next(&mut self, repeat: RepeatMode) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current().cloned(),
            RepeatMode::Off => {
                if self.cursor + 1 < self.tracks.len() {
                    self.cursor += 1;
                    self.current().cloned()
                } else {
                    None
                }
            }
            RepeatMode::Playlist => {
                self.cursor = (self.cursor + 1) % self.tracks.len();
                self.current().cloned()
            }
        }
    }

    /// Move the cursor backward per the repeat mode.
    pub fn advance_previous(&mut self, repeat: RepeatMode) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current().cloned(),
            RepeatMode::Off => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.current().cloned()
                } else {
                    None
                }
            }
            RepeatMode::Playlist => {
                self.cursor = (self.cursor + self.tracks.len() - 1) % self.tracks.len();
                self.current().cloned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(n: usize) -> Playlist {
        Playlist::new((0..n).map(|i| Track::new(format!("track-{i}.flac"))).collect())
    }

    #[test]
    fn test_peek_does_not_move_cursor() {
        let list = playlist(3);
        assert_eq!(list.peek_next(RepeatMode::Off).unwrap().uri, "track-1.flac");
        assert_eq!(list.cursor(), 0);
    }

    #[test]
    fn test_off_stops_at_end() {
        let mut list = playlist(2);
        assert!(list.advance_next(RepeatMode::Off).is_some());
        assert!(list.advance_next(RepeatMode::Off).is_none());
        // Cursor stays on the last track
        assert_eq!(list.current().unwrap().uri, "track-1.flac");
    }

    #[test]
    fn test_playlist_wraps() {
        let mut list = playlist(2);
        assert_eq!(
            list.advance_next(RepeatMode::Playlist).unwrap().uri,
            "track-1.flac"
        );
        assert_eq!(
            list.advance_next(RepeatMode::Playlist).unwrap().uri,
            "track-0.flac"
        );
    }

    #[test]
    fn test_single_track_repeats() {
        let mut list = playlist(3);
        assert_eq!(
            list.advance_next(RepeatMode::SingleTrack).unwrap().uri,
            "track-0.flac"
        );
        assert_eq!(list.cursor(), 0);
    }

    #[test]
    fn test_previous_semantics() {
        let mut list = playlist(3);
        assert!(list.peek_previous(RepeatMode::Off).is_none());
        assert!(list.advance_previous(RepeatMode::Off).is_none());

        assert_eq!(
            list.peek_previous(RepeatMode::Playlist).unwrap().uri,
            "track-2.flac"
        );
        assert_eq!(
            list.advance_previous(RepeatMode::Playlist).unwrap().uri,
            "track-2.flac"
        );
    }

    #[test]
    fn test_empty_playlist() {
        let mut list = playlist(0);
        assert!(list.current().is_none());
        assert!(list.peek_next(RepeatMode::Playlist).is_none());
        assert!(list.advance_next(RepeatMode::Playlist).is_none());
    }

    #[test]
    fn test_replace_resets_cursor() {
        let mut list = playlist(3);
        list.advance_next(RepeatMode::Off);
        assert_eq!(list.cursor(), 1);
        list.replace(vec![Track::new("other.flac")]);
        assert_eq!(list.cursor(), 0);
        assert_eq!(list.current().unwrap().uri, "other.flac");
    }
}
