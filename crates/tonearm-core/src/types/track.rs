//! Track metadata produced by a successful load.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Decoded sample layout of a track.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleFormat {
    /// Number of interleaved channels.
    pub channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
    /// Bits per sample of the source encoding, when the container reports it.
    pub bits_per_sample: Option<u32>,
}

impl SampleFormat {
    pub const fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample: None,
        }
    }
}

/// Embedded cover image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artwork {
    /// MIME type reported by the container, e.g. `image/jpeg`.
    pub media_type: String,
    pub data: Bytes,
}

/// Immutable description of a loaded track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    /// Path the track was loaded from.
    pub path: PathBuf,
    /// Title tag, or the file stem when the file carries no tag.
    pub title: String,
    /// Artist tag (if available).
    pub artist: Option<String>,
    /// Total duration in seconds.
    pub duration: f64,
    /// Sample layout of the decoded stream.
    pub format: SampleFormat,
    /// Front cover (if embedded).
    pub artwork: Option<Artwork>,
}

impl TrackMetadata {
    pub fn new(path: impl Into<PathBuf>, duration: f64, format: SampleFormat) -> Self {
        let path = path.into();
        let title = title_from_path(&path);
        Self {
            path,
            title,
            artist: None,
            duration: duration.max(0.0),
            format,
            artwork: None,
        }
    }

    /// Title and artist joined the way a "now playing" label shows them.
    pub fn display_name(&self) -> String {
        match &self.artist {
            Some(artist) if !artist.is_empty() => format!("{artist} - {}", self.title),
            _ => self.title.clone(),
        }
    }

    /// Clamp a position in seconds to `[0, duration]`.
    pub fn clamp_position(&self, seconds: f64) -> f64 {
        if seconds.is_nan() {
            return 0.0;
        }
        seconds.clamp(0.0, self.duration)
    }
}

/// Derive a display title from a file name.
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
