//! What the transport controls show.

use tonearm_core::TrackMetadata;

/// Maps a 0-100 volume slider onto linear gain with a squared curve, which
/// sounds closer to even steps than a straight line.
pub fn slider_to_gain(percent: f64) -> f32 {
    let p = (percent / 100.0).clamp(0.0, 1.0);
    (p * p) as f32
}

/// Inverse of [`slider_to_gain`], for displaying the current volume.
pub fn gain_to_slider(gain: f32) -> f64 {
    f64::from(gain.clamp(0.0, 1.0)).sqrt() * 100.0
}

/// Control panel state.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlsState {
    /// Controls stay locked until a track loads.
    pub locked: bool,
    pub title: String,
    pub artist: String,
}

impl ControlsState {
    pub fn new() -> Self {
        Self {
            locked: true,
            title: String::new(),
            artist: String::new(),
        }
    }

    /// A track loaded: unlock and show its tags.
    pub fn set_track(&mut self, track: &TrackMetadata) {
        self.locked = false;
        self.title = track.title.clone();
        self.artist = track.artist.clone().unwrap_or_default();
    }
}

impl Default for ControlsState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use tonearm_core::SampleFormat;

    #[test]
    fn test_slider_curve() {
        assert_eq!(slider_to_gain(0.0), 0.0);
        assert_eq!(slider_to_gain(50.0), 0.25);
        assert_eq!(slider_to_gain(100.0), 1.0);
        assert_eq!(slider_to_gain(150.0), 1.0);
        assert!((gain_to_slider(0.25) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_controls_unlock_on_load() {
        let mut controls = ControlsState::new();
        assert!(controls.locked);

        let mut track = TrackMetadata::new("/music/song.flac", 120.0, SampleFormat::new(2, 44100));
        track.artist = Some("Someone".to_string());
        controls.set_track(&track);
        assert!(!controls.locked);
        assert_eq!(controls.title, "song");
        assert_eq!(controls.artist, "Someone");

        // A tagless track replaces the previous artist
        controls.set_track(&TrackMetadata::new("/music/other.wav", 5.0, SampleFormat::new(1, 8000)));
        assert_eq!(controls.title, "other");
        assert!(controls.artist.is_empty());
    }
}
