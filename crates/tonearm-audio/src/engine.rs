//! Audio playback engine coordinating load, transport, and output.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tonearm_core::{Error, Result, TrackMetadata, TransportState, VolumeControl};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::decode::TrackDecoder;
use crate::output::{CpalBackend, DeviceId, OutputBackend};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::transport::Transport;

/// Returned by [`PlaybackEngine::progress`] when there is nothing to show.
pub const NO_PROGRESS: f64 = -1.0;

/// Events queued for the host before new ones are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Events emitted by the playback engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Transport state changed.
    StateChanged(TransportState),
    /// A track was loaded and is ready to play.
    TrackLoaded(TrackMetadata),
    /// A seek took effect (position in seconds).
    Seeked(f64),
    /// The track played through to its end.
    EndOfTrack,
    /// The output device went away; playback was paused.
    DeviceLost,
    /// Error occurred.
    Error(String),
}

/// Everything behind the session lock.
struct Session {
    track: Option<TrackMetadata>,
    volume: VolumeControl,
    pipeline: Option<Pipeline>,
    /// Pipelines asked to shut down that have not confirmed yet.
    retiring: Vec<Pipeline>,
    closed: bool,
}

/// Plays one track at a time on one output device.
///
/// All methods take `&self` and are serialized internally, so an engine can
/// be shared behind an `Arc`.
pub struct PlaybackEngine {
    ctx: PipelineContext,
    session: Mutex<Session>,
    events: Receiver<EngineEvent>,
}

impl PlaybackEngine {
    /// Create an engine on the system's default output device.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_backend(config, Arc::new(CpalBackend::default()))
    }

    /// Create an engine on a specific output backend.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn OutputBackend>) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
        let volume = VolumeControl::new(config.initial_volume);
        let transport = Arc::new(Transport::new(volume.gain()));

        Self {
            ctx: PipelineContext {
                backend,
                transport,
                events: event_tx,
                config,
            },
            session: Mutex::new(Session {
                track: None,
                volume,
                pipeline: None,
                retiring: Vec::new(),
                closed: false,
            }),
            events: event_rx,
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Load a track, replacing the current one.
    ///
    /// The file is probed before anything is torn down, so a failed load
    /// leaves the current session as it was. On success the engine is
    /// Paused at 0 with the new track.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<TrackMetadata> {
        let path = path.as_ref();
        let mut session = self.session.lock();
        if session.closed {
            return Err(Error::EngineClosed);
        }

        let decoder = TrackDecoder::open(path)
            .inspect_err(|e| warn!("Failed to load {}: {e}", path.display()))?;

        self.stop_locked(&mut session);
        if !self.join_retiring(&mut session) {
            warn!("Previous output device still held, loading anyway");
        }

        let metadata = decoder.metadata().clone();
        self.ctx.transport.reset(metadata.duration);
        session.track = Some(metadata.clone());
        info!(
            "Loaded {} ({:.2}s)",
            metadata.display_name(),
            metadata.duration
        );

        // Take the device now if we can; play retries otherwise
        match Pipeline::spawn(decoder, &self.ctx) {
            Ok(pipeline) => session.pipeline = Some(pipeline),
            Err(e) => warn!("Output not ready, deferring to play: {e}"),
        }

        self.emit(EngineEvent::TrackLoaded(metadata.clone()));
        self.emit(EngineEvent::StateChanged(TransportState::Paused));
        Ok(metadata)
    }

    /// Start or resume playback. Returns false if nothing is loaded or the
    /// output device could not be opened.
    pub fn play(&self) -> bool {
        let mut session = self.session.lock();
        if session.closed {
            return false;
        }
        let Some(track) = session.track.clone() else {
            debug!("Play ignored: no track loaded");
            return false;
        };

        self.reap(&mut session);
        let transport = &self.ctx.transport;

        if transport.state() == TransportState::Playing && session.pipeline.is_some() {
            return true;
        }
        if transport.ended() {
            transport.set_position(0.0);
        }

        if session.pipeline.is_none() {
            if !self.join_retiring(&mut session) {
                warn!("Previous output device still held, opening a new one");
            }
            transport.settle_seek();
            match self.spawn_pipeline(&track, transport.position()) {
                Ok(pipeline) => session.pipeline = Some(pipeline),
                Err(e) => {
                    error!("Cannot start playback: {e}");
                    self.emit(EngineEvent::Error(e.to_string()));
                    return false;
                }
            }
        }

        if transport.set_state(TransportState::Playing) != TransportState::Playing {
            self.emit(EngineEvent::StateChanged(TransportState::Playing));
        }
        true
    }

    /// Pause playback. Returns false if not currently playing.
    pub fn pause(&self) -> bool {
        let _session = self.session.lock();
        let transport = &self.ctx.transport;
        if transport.state() != TransportState::Playing {
            return false;
        }
        transport.set_state(TransportState::Paused);
        self.emit(EngineEvent::StateChanged(TransportState::Paused));
        true
    }

    /// Stop and rewind. The device is released in the background.
    pub fn stop(&self) {
        let mut session = self.session.lock();
        self.stop_locked(&mut session);
    }

    /// Stop and wait until the output device has been released.
    ///
    /// Returns false if teardown did not finish within the configured
    /// timeout.
    pub fn stop_and_wait(&self) -> bool {
        let mut session = self.session.lock();
        self.stop_locked(&mut session);
        self.join_retiring(&mut session)
    }

    /// [`stop_and_wait`](Self::stop_and_wait) without blocking the calling
    /// task. The wait runs on tokio's blocking pool.
    pub async fn stop_and_wait_async(self: &Arc<Self>) -> bool {
        let engine = Arc::clone(self);
        match tokio::task::spawn_blocking(move || engine.stop_and_wait()).await {
            Ok(released) => released,
            Err(e) => {
                error!("Stop task failed: {e}");
                false
            }
        }
    }

    /// Seek to `seconds`, clamped to the track. Returns the new position.
    pub fn seek(&self, seconds: f64) -> f64 {
        let mut session = self.session.lock();
        self.seek_locked(&mut session, seconds)
    }

    /// Seek relative to the current position.
    pub fn skip(&self, delta: f64) -> f64 {
        let mut session = self.session.lock();
        let target = self.ctx.transport.position() + delta;
        self.seek_locked(&mut session, target)
    }

    /// Set the volume (0.0 to 1.0). Returns the level actually stored.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let mut session = self.session.lock();
        let level = session.volume.set_level(volume);
        self.ctx.transport.set_gain(session.volume.gain());
        level
    }

    /// The volume level, regardless of mute.
    pub fn volume(&self) -> f32 {
        self.session.lock().volume.level()
    }

    /// Silence output. Returns false if already muted.
    pub fn mute(&self) -> bool {
        self.update_volume(VolumeControl::mute)
    }

    /// Restore the volume from before muting. Returns false if not muted.
    pub fn unmute(&self) -> bool {
        self.update_volume(VolumeControl::unmute)
    }

    /// Flip mute. Returns the new mute flag.
    pub fn toggle_mute(&self) -> bool {
        self.update_volume(VolumeControl::toggle_mute)
    }

    pub fn is_muted(&self) -> bool {
        self.session.lock().volume.is_muted()
    }

    /// Position scaled to `width`, for progress bars.
    ///
    /// [`NO_PROGRESS`] when no track is loaded or the track has ended.
    pub fn progress(&self, width: f64) -> f64 {
        let session = self.session.lock();
        let transport = &self.ctx.transport;
        match &session.track {
            Some(track) if !transport.ended() => {
                if track.duration > 0.0 {
                    transport.position() / track.duration * width
                } else {
                    0.0
                }
            }
            _ => NO_PROGRESS,
        }
    }

    /// Release the device and unload. Safe to call more than once.
    pub fn close(&self) {
        let mut session = self.session.lock();
        if session.closed {
            return;
        }
        session.closed = true;

        self.stop_locked(&mut session);
        if !self.join_retiring(&mut session) {
            warn!("Closing with an output device still held");
        }
        session.track = None;
        self.ctx.transport.clear();
        info!("Playback engine closed");
    }

    pub fn state(&self) -> TransportState {
        self.ctx.transport.state()
    }

    pub fn position(&self) -> f64 {
        self.ctx.transport.position()
    }

    /// Duration of the loaded track; zero if none.
    pub fn duration(&self) -> f64 {
        self.session.lock().track.as_ref().map_or(0.0, |t| t.duration)
    }

    pub fn track(&self) -> Option<TrackMetadata> {
        self.session.lock().track.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.session.lock().track.as_ref().map(|t| t.title.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.session.lock().track.is_some()
    }

    /// True once the track has played to its end, until the next seek,
    /// play, stop, or load.
    pub fn has_ended(&self) -> bool {
        self.ctx.transport.ended()
    }

    /// The output device currently held, if any.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.session
            .lock()
            .pipeline
            .as_ref()
            .filter(|p| p.is_alive())
            .map(Pipeline::device_id)
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn emit(&self, event: EngineEvent) {
        if self.ctx.events.try_send(event).is_err() {
            debug!("Event queue full, dropping event");
        }
    }

    /// Reopen the loaded track at `start` and put a pipeline on it.
    ///
    /// If the decoder cannot reach `start` the track plays from 0 and the
    /// clock says so.
    fn spawn_pipeline(&self, track: &TrackMetadata, start: f64) -> Result<Pipeline> {
        let mut decoder = TrackDecoder::reopen(track)?;
        if start > 0.0 {
            if let Err(e) = decoder.seek(start) {
                warn!("Cannot resume at {start:.2}s, starting over: {e}");
                decoder = TrackDecoder::reopen(track)?;
                self.ctx.transport.set_position(0.0);
            }
        }
        Pipeline::spawn(decoder, &self.ctx)
    }

    fn update_volume(&self, change: impl FnOnce(&mut VolumeControl) -> bool) -> bool {
        let mut session = self.session.lock();
        let result = change(&mut session.volume);
        self.ctx.transport.set_gain(session.volume.gain());
        result
    }

    fn stop_locked(&self, session: &mut Session) {
        if self.ctx.transport.stop() != TransportState::Stopped {
            self.emit(EngineEvent::StateChanged(TransportState::Stopped));
        }
        if let Some(pipeline) = session.pipeline.take() {
            self.retire(session, pipeline);
        }
    }

    /// Cut `pipeline` off from the transport and queue it for teardown.
    fn retire(&self, session: &mut Session, pipeline: Pipeline) {
        self.ctx.transport.retire();
        pipeline.shutdown();
        session.retiring.push(pipeline);
    }

    /// Move a pipeline that exited on its own (end of track, device loss)
    /// out of the live slot.
    fn reap(&self, session: &mut Session) {
        if session.pipeline.as_ref().is_some_and(|p| !p.is_alive()) {
            if let Some(pipeline) = session.pipeline.take() {
                debug!("Reaping pipeline on {}", pipeline.device_id());
                self.retire(session, pipeline);
            }
            self.ctx.transport.settle_seek();
        }
    }

    /// Wait for every retiring pipeline to release its device.
    fn join_retiring(&self, session: &mut Session) -> bool {
        let timeout = self.ctx.config.teardown_timeout();
        std::mem::take(&mut session.retiring)
            .into_iter()
            .fold(true, |released, pipeline| pipeline.wait(timeout) && released)
    }

    fn seek_locked(&self, session: &mut Session, seconds: f64) -> f64 {
        let target = session
            .track
            .as_ref()
            .map_or(0.0, |t| t.clamp_position(seconds));
        let transport = &self.ctx.transport;

        self.reap(session);
        match &session.pipeline {
            Some(pipeline) => {
                let seq = transport.begin_seek(target);
                if !pipeline.seek(seq, target) {
                    transport.settle_seek();
                }
            }
            None => {
                transport.set_position(target);
                self.emit(EngineEvent::Seeked(target));
            }
        }
        debug!("Seek to {target:.2}s");
        target
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}
