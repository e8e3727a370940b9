//! Host settings, read from a JSON file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tonearm_audio::EngineConfig;
use tracing::{debug, info};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    /// Output device name; the system default when unset.
    pub output_device: Option<String>,
    /// Step for fast-forward and rewind, in seconds.
    pub skip_seconds: f64,
    /// Width of the progress bar in characters.
    pub progress_width: usize,
    pub frame_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            output_device: None,
            skip_seconds: 10.0,
            progress_width: 40,
            // Roughly 30 frames per second
            frame_interval_ms: 33,
        }
    }
}

impl Settings {
    /// Default settings location in the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tonearm", "Tonearm")
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Load from `path`, or the default location. A missing file means
    /// defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            debug!("No config directory; using default settings");
            return Ok(Self::default());
        };

        if !path.exists() {
            debug!("No settings at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}
