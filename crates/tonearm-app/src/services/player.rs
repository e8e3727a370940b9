//! Player service connecting the terminal front-end to the playback engine.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tonearm_audio::{CpalBackend, EngineEvent, PlaybackEngine};
use tracing::{debug, error, info, warn};

use crate::settings::Settings;
use crate::state::controls::{gain_to_slider, slider_to_gain};
use crate::state::ControlsState;

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(String),
    Play,
    Pause,
    Toggle,
    Stop,
    Seek(f64),
    FastForward,
    Rewind,
    Volume(f64),
    Mute,
    Status,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, arg) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, a)| (w, a.trim()));

        let number = |what: &str| {
            arg.parse::<f64>()
                .map_err(|_| format!("{what} needs a number, got {arg:?}"))
        };

        match word {
            "open" if !arg.is_empty() => Ok(Self::Open(arg.to_string())),
            "open" => Err("open needs a path".to_string()),
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "toggle" | "p" => Ok(Self::Toggle),
            "stop" => Ok(Self::Stop),
            "seek" => number("seek").map(Self::Seek),
            "ff" => Ok(Self::FastForward),
            "rw" => Ok(Self::Rewind),
            "vol" => number("vol").map(Self::Volume),
            "mute" => Ok(Self::Mute),
            "status" | "" => Ok(Self::Status),
            "quit" | "q" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }

    /// Commands that work before any track is loaded.
    const fn always_available(&self) -> bool {
        matches!(self, Self::Open(_) | Self::Status | Self::Quit)
    }
}

/// Player service that owns the engine and the controls it drives.
pub struct PlayerService {
    engine: Arc<PlaybackEngine>,
    controls: Mutex<ControlsState>,
    settings: Settings,
}

impl PlayerService {
    /// Create a player service on the configured output device.
    pub fn new(settings: Settings) -> Self {
        let backend = CpalBackend::new(settings.output_device.clone());
        let engine = PlaybackEngine::with_backend(settings.engine.clone(), Arc::new(backend));
        info!("Playback engine initialized");
        Self::with_engine(Arc::new(engine), settings)
    }

    pub fn with_engine(engine: Arc<PlaybackEngine>, settings: Settings) -> Self {
        Self {
            engine,
            controls: Mutex::new(ControlsState::new()),
            settings,
        }
    }

    pub const fn engine(&self) -> &Arc<PlaybackEngine> {
        &self.engine
    }

    pub fn controls(&self) -> ControlsState {
        self.controls.lock().clone()
    }

    /// Load a file. The controls unlock once it succeeds.
    pub fn open(&self, path: &Path) -> bool {
        match self.engine.load(path) {
            Ok(track) => {
                info!("Opened {}", track.display_name());
                self.controls.lock().set_track(&track);
                true
            }
            Err(e) => {
                error!("Cannot open {}: {e}", path.display());
                false
            }
        }
    }

    /// Run one command. Returns false when the host should exit.
    pub async fn execute(&self, command: Command) -> bool {
        if self.controls.lock().locked && !command.always_available() {
            warn!("Nothing loaded; use `open <path>` first");
            return true;
        }

        let engine = &self.engine;
        match command {
            Command::Open(path) => {
                self.open(Path::new(&path));
            }
            Command::Play => {
                if !engine.play() {
                    warn!("Playback could not start");
                }
            }
            Command::Pause => {
                engine.pause();
            }
            Command::Toggle => {
                if engine.state().is_playing() {
                    engine.pause();
                } else if !engine.play() {
                    warn!("Playback could not start");
                }
            }
            Command::Stop => engine.stop(),
            Command::Seek(seconds) => {
                engine.seek(seconds);
            }
            Command::FastForward => {
                engine.skip(self.settings.skip_seconds);
            }
            Command::Rewind => {
                engine.skip(-self.settings.skip_seconds);
            }
            Command::Volume(percent) => {
                let level = engine.set_volume(slider_to_gain(percent));
                debug!("Volume set to {level:.3}");
            }
            Command::Mute => {
                let muted = engine.toggle_mute();
                info!("{}", if muted { "Muted" } else { "Unmuted" });
            }
            Command::Status => println!("{}", self.status_line()),
            Command::Quit => {
                if !engine.stop_and_wait_async().await {
                    warn!("Output device was not released cleanly");
                }
                return false;
            }
        }
        true
    }

    /// Drain engine events into the controls and the log.
    pub fn sync_events(&self) {
        while let Some(event) = self.engine.try_recv_event() {
            match event {
                EngineEvent::StateChanged(state) => debug!("Playback state changed: {state}"),
                EngineEvent::TrackLoaded(track) => self.controls.lock().set_track(&track),
                EngineEvent::Seeked(position) => debug!("Seeked to {position:.2}s"),
                EngineEvent::EndOfTrack => info!("Playback finished"),
                EngineEvent::DeviceLost => warn!("Output device lost; playback paused"),
                EngineEvent::Error(err) => error!("Playback error: {err}"),
            }
        }
    }

    /// One-line summary with a text progress bar.
    pub fn status_line(&self) -> String {
        let controls = self.controls.lock();
        if controls.locked {
            return "[no track]".to_string();
        }

        let width = self.settings.progress_width;
        let progress = self.engine.progress(width as f64);
        // Negative means nothing to show, or the track has ended
        let filled = if progress < 0.0 {
            width
        } else {
            (progress.round() as usize).min(width)
        };

        let name = if controls.artist.is_empty() {
            controls.title.clone()
        } else {
            format!("{} - {}", controls.artist, controls.title)
        };
        let volume = if self.engine.is_muted() {
            "muted".to_string()
        } else {
            format!("vol {:.0}", gain_to_slider(self.engine.volume()))
        };

        format!(
            "{:<7} [{}{}] {} / {} {volume} {name}",
            self.engine.state().as_str(),
            "#".repeat(filled),
            "-".repeat(width - filled),
            format_time(self.engine.position()),
            format_time(self.engine.duration()),
        )
    }
}

/// `m:ss`.
fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tonearm_audio::{EngineConfig, OutputSpec, VirtualBackend};
    use tonearm_core::TransportState;

    fn service() -> PlayerService {
        let backend = VirtualBackend::new(OutputSpec::new(8000, 2));
        let engine = PlaybackEngine::with_backend(EngineConfig::default(), Arc::new(backend));
        PlayerService::with_engine(Arc::new(engine), Settings::default())
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("open /tmp/a b.wav"), Ok(Command::Open("/tmp/a b.wav".into())));
        assert_eq!(Command::parse("  seek 12.5 "), Ok(Command::Seek(12.5)));
        assert_eq!(Command::parse("vol 40"), Ok(Command::Volume(40.0)));
        assert_eq!(Command::parse(""), Ok(Command::Status));
        assert_eq!(Command::parse("q"), Ok(Command::Quit));
        assert!(Command::parse("seek soon").is_err());
        assert!(Command::parse("open").is_err());
        assert!(Command::parse("dance").is_err());
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(61.9), "1:01");
        assert_eq!(format_time(-3.0), "0:00");
    }

    #[tokio::test]
    async fn test_controls_locked_until_open() {
        let service = service();
        assert!(service.controls().locked);
        assert!(service.execute(Command::Play).await);
        assert_eq!(service.engine().state(), TransportState::Stopped);

        assert!(!service.open(Path::new("/nonexistent/track.wav")));
        assert!(service.controls().locked);
        assert_eq!(service.status_line(), "[no track]");

        assert!(!service.execute(Command::Quit).await);
    }
}
