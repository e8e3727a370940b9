//! # tonearm-audio
//!
//! Audio playback engine for Tonearm.
//!
//! Features:
//! - Lock-free ring buffer for decode→output communication
//! - Symphonia decoding with sample-accurate seeking
//! - Rubato resampling to the device rate
//! - cpal output, or a manually clocked virtual device for headless runs

pub mod buffer;
pub mod config;
pub mod decode;
pub mod engine;
pub mod output;
mod pipeline;
pub mod resample;
mod transport;

pub use config::EngineConfig;
pub use engine::{EngineEvent, PlaybackEngine, EVENT_CAPACITY, NO_PROGRESS};
pub use output::{CpalBackend, DeviceId, OutputBackend, OutputSpec, OutputStream, VirtualBackend};
