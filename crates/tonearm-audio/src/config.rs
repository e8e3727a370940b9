//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`PlaybackEngine`](crate::PlaybackEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer size in samples (rounded up to a power of two).
    pub buffer_samples: usize,
    /// Upper bound on how long the pipeline worker sleeps between command checks.
    pub poll_interval_ms: u64,
    /// How long a blocking stop waits for the output device to be released.
    pub teardown_timeout_ms: u64,
    /// Volume a new engine starts with.
    pub initial_volume: f32,
}

impl EngineConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // About one second at 48kHz stereo.
            buffer_samples: 48000 * 2,
            poll_interval_ms: 5,
            teardown_timeout_ms: 1000,
            // Slightly below max for headroom
            initial_volume: 0.85,
        }
    }
}
