//! Core domain types for Tonearm.

pub mod track;
pub mod transport;
pub mod volume;

pub use track::{Artwork, SampleFormat, TrackMetadata};
pub use transport::TransportState;
pub use volume::VolumeControl;
