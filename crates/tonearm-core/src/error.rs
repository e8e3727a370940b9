//! Error types for Tonearm.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using Tonearm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tonearm.
#[derive(Error, Debug)]
pub enum Error {
    // Loading errors
    #[error(transparent)]
    Load(#[from] LoadError),

    // Audio errors
    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    // Lifecycle errors
    #[error("Playback engine is closed")]
    EngineClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while opening a source for playback.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

impl LoadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl Error {
    /// Returns true if the error came from an unreadable source file.
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Load(LoadError::Io { .. }))
    }

    /// Returns true if the source could be read but not decoded.
    pub const fn is_unsupported_format(&self) -> bool {
        matches!(self, Self::Load(LoadError::UnsupportedFormat(_)))
    }

    /// Returns true if the output device could not be acquired or was lost.
    pub const fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_))
    }
}
