//! End-to-end engine behaviour on a virtual output device.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use tonearm_audio::decode::TrackDecoder;
use tonearm_audio::output::Renderer;
use tonearm_audio::{
    DeviceId, EngineConfig, EngineEvent, OutputBackend, OutputSpec, OutputStream, PlaybackEngine,
    VirtualBackend, NO_PROGRESS,
};
use tonearm_core::{Error, TransportState};

const RATE: u32 = 8000;

/// Constant-valued 16-bit mono WAV.
fn write_wav(dir: &Path, name: &str, seconds: f64, value: f32) -> PathBuf {
    write_levels(dir, name, &[(seconds, value)])
}

/// 16-bit mono WAV made of constant-valued sections.
fn write_levels(dir: &Path, name: &str, sections: &[(f64, f32)]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &(seconds, value) in sections {
        let sample = (value * f32::from(i16::MAX)) as i16;
        for _ in 0..(seconds * f64::from(RATE)) as usize {
            writer.write_sample(sample).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

fn config() -> EngineConfig {
    EngineConfig {
        buffer_samples: 16384,
        poll_interval_ms: 1,
        initial_volume: 1.0,
        ..EngineConfig::default()
    }
}

fn setup() -> (Arc<PlaybackEngine>, VirtualBackend, TempDir) {
    let backend = VirtualBackend::new(OutputSpec::new(RATE, 2));
    let engine = PlaybackEngine::with_backend(config(), Arc::new(backend.clone()));
    (Arc::new(engine), backend, tempfile::tempdir().unwrap())
}

/// Hands out a fresh virtual device per open, and takes `release` to let
/// go of each one.
#[derive(Clone)]
struct SlowReleaseBackend {
    release: Duration,
    devices: Arc<Mutex<Vec<VirtualBackend>>>,
}

impl SlowReleaseBackend {
    fn new(release: Duration) -> Self {
        Self {
            release,
            devices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn device(&self, index: usize) -> VirtualBackend {
        self.devices.lock()[index].clone()
    }
}

impl OutputBackend for SlowReleaseBackend {
    fn open(&self, renderer: Arc<Renderer>) -> tonearm_core::Result<Box<dyn OutputStream>> {
        let device = VirtualBackend::new(OutputSpec::new(RATE, 2));
        let inner = device.open(renderer)?;
        self.devices.lock().push(device);
        Ok(Box::new(SlowStream {
            inner,
            release: self.release,
        }))
    }
}

struct SlowStream {
    inner: Box<dyn OutputStream>,
    release: Duration,
}

impl OutputStream for SlowStream {
    fn id(&self) -> DeviceId {
        self.inner.id()
    }

    fn spec(&self) -> OutputSpec {
        self.inner.spec()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl Drop for SlowStream {
    fn drop(&mut self) {
        // The inner stream keeps rendering until this returns
        std::thread::sleep(self.release);
    }
}

/// Pump the device until it produces non-silent output.
fn pump_audible(backend: &VirtualBackend, frames: usize) -> Vec<f32> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let out = backend.pump(frames);
        if out.iter().any(|s| *s != 0.0) {
            return out;
        }
        assert!(Instant::now() < deadline, "no audio reached the device");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn wait_for(engine: &PlaybackEngine, wanted: impl Fn(&EngineEvent) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(event) = engine.recv_event_timeout(Duration::from_millis(50)) {
            if wanted(&event) {
                return true;
            }
        }
    }
    false
}

fn close_to(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}

#[test]
fn load_then_play_reaches_playing_and_progress_never_decreases() {
    let (engine, backend, dir) = setup();
    let path = write_wav(dir.path(), "tone.wav", 10.0, 0.25);

    let track = engine.load(&path).unwrap();
    assert!((track.duration - 10.0).abs() < 0.01);
    assert_eq!(track.title, "tone");
    assert_eq!(engine.state(), TransportState::Paused);
    assert_eq!(engine.progress(100.0), 0.0);

    assert!(engine.play());
    assert_eq!(engine.state(), TransportState::Playing);

    pump_audible(&backend, 400);
    let mut last = engine.progress(100.0);
    for _ in 0..20 {
        backend.pump(400);
        let now = engine.progress(100.0);
        assert!(now >= last, "progress went from {last} to {now}");
        last = now;
    }
    assert!(last > 0.0);
}

#[test]
fn seek_twice_is_idempotent() {
    let (engine, _backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();

    assert_eq!(engine.seek(4.0), 4.0);
    assert_eq!(engine.position(), 4.0);
    assert_eq!(engine.seek(4.0), 4.0);
    assert_eq!(engine.position(), 4.0);

    assert_eq!(engine.seek(60.0), engine.duration());
    assert_eq!(engine.seek(-1.0), 0.0);
}

#[test]
fn volume_is_idempotent_and_commutes_with_seek() {
    let (first, _b1, dir) = setup();
    let (second, _b2, _dir2) = setup();
    let path = write_wav(dir.path(), "a.wav", 10.0, 0.25);
    first.load(&path).unwrap();
    second.load(&path).unwrap();

    first.set_volume(0.5);
    first.set_volume(0.5);
    first.seek(3.0);

    second.seek(3.0);
    second.set_volume(0.5);

    assert_eq!(first.volume(), second.volume());
    assert_eq!(first.position(), second.position());
}

#[test]
fn gain_is_applied_exactly() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    engine.set_volume(0.5);
    assert!(engine.play());

    let out = pump_audible(&backend, 200);
    let decoded = f32::from((0.25 * f32::from(i16::MAX)) as i16) / 32768.0;
    assert!(out
        .iter()
        .filter(|s| **s != 0.0)
        .all(|s| close_to(*s, decoded * 0.5)));
}

#[test]
fn mute_restores_previous_volume_and_records_changes() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    engine.set_volume(0.6);
    assert!(engine.play());
    pump_audible(&backend, 200);

    assert!(engine.mute());
    assert!(!engine.mute());
    assert!(backend.pump(400).iter().all(|s| *s == 0.0));

    engine.set_volume(0.3);
    assert!(backend.pump(400).iter().all(|s| *s == 0.0));
    assert_eq!(engine.volume(), 0.3);

    assert!(engine.unmute());
    assert!(!engine.is_muted());
    assert_eq!(engine.volume(), 0.3);
    let out = pump_audible(&backend, 200);
    assert!(out.iter().filter(|s| **s != 0.0).all(|s| close_to(*s, 0.25 * 0.3)));
}

#[test]
fn skip_back_clamps_to_start() {
    let (engine, _backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    engine.seek(2.0);
    assert_eq!(engine.skip(-5.0), 0.0);
    assert_eq!(engine.position(), 0.0);
    assert_eq!(engine.skip(4.0), 4.0);
}

#[test]
fn missing_file_is_an_io_error_and_leaves_engine_empty() {
    let (engine, backend, dir) = setup();
    let err = engine.load(dir.path().join("nope.wav")).unwrap_err();
    assert!(err.is_io(), "unexpected error: {err}");
    assert_eq!(engine.state(), TransportState::Stopped);
    assert!(!engine.is_loaded());
    assert_eq!(backend.open_count(), 0);
}

#[test]
fn garbage_is_unsupported_and_keeps_previous_track() {
    let (engine, _backend, dir) = setup();
    engine.load(write_wav(dir.path(), "good.wav", 10.0, 0.25)).unwrap();
    engine.seek(1.5);

    let junk = dir.path().join("junk.bin");
    std::fs::write(&junk, b"definitely not audio, just some bytes").unwrap();
    let err = engine.load(&junk).unwrap_err();
    assert!(err.is_unsupported_format(), "unexpected error: {err}");

    assert_eq!(engine.title().as_deref(), Some("good"));
    assert_eq!(engine.state(), TransportState::Paused);
    assert_eq!(engine.position(), 1.5);
}

#[test]
fn reload_after_stop_uses_a_new_device_without_cross_talk() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "low.wav", 10.0, -0.5)).unwrap();
    assert!(engine.play());
    pump_audible(&backend, 200);
    let first = engine.device_id().unwrap();

    assert!(engine.stop_and_wait());
    assert_eq!(engine.state(), TransportState::Stopped);
    assert_eq!(engine.position(), 0.0);
    assert_eq!(backend.active_device(), None);

    engine.load(write_wav(dir.path(), "high.wav", 10.0, 0.25)).unwrap();
    let second = engine.device_id().unwrap();
    assert_ne!(first, second);

    assert!(engine.play());
    pump_audible(&backend, 200);
    for _ in 0..10 {
        assert!(backend.pump(200).iter().all(|s| *s >= 0.0));
    }
}

#[test]
fn end_of_track_stops_and_reports() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "short.wav", 3.0, 0.25)).unwrap();
    assert!(engine.play());

    let deadline = Instant::now() + Duration::from_secs(10);
    while !engine.has_ended() {
        assert!(Instant::now() < deadline, "track never ended");
        backend.pump(800);
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(engine.state(), TransportState::Stopped);
    assert_eq!(engine.progress(100.0), NO_PROGRESS);
    assert!((engine.position() - 3.0).abs() < 1e-9);
    assert!(wait_for(&engine, |e| matches!(e, EngineEvent::EndOfTrack)));

    // Playing again starts over
    assert!(engine.play());
    assert!(!engine.has_ended());
    assert!(engine.position() < 1.0);
}

#[test]
fn unavailable_device_defers_failure_to_play() {
    let (engine, backend, dir) = setup();
    backend.fail_next_opens(2);

    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    assert!(engine.device_id().is_none());

    assert!(!engine.play());
    assert_eq!(engine.state(), TransportState::Paused);
    assert!(engine.is_loaded());

    assert!(engine.play());
    assert_eq!(engine.state(), TransportState::Playing);
    assert!(engine.device_id().is_some());
}

#[test]
fn device_loss_pauses_and_play_recovers() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    assert!(engine.play());
    pump_audible(&backend, 400);

    backend.disconnect();
    assert!(wait_for(&engine, |e| matches!(e, EngineEvent::DeviceLost)));
    assert_eq!(engine.state(), TransportState::Paused);
    let position = engine.position();
    assert!(position > 0.0);

    assert!(engine.play());
    assert!(engine.position() >= position);
    pump_audible(&backend, 400);
}

#[test]
fn close_is_idempotent_and_releases_the_device() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    assert!(engine.play());

    engine.close();
    engine.close();
    assert_eq!(backend.active_device(), None);
    assert!(!engine.is_loaded());
    assert!(!engine.play());
    assert!(matches!(
        engine.load(dir.path().join("a.wav")),
        Err(Error::EngineClosed)
    ));
}

#[tokio::test]
async fn async_stop_releases_device() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    assert!(engine.play());

    assert!(engine.stop_and_wait_async().await);
    assert_eq!(engine.state(), TransportState::Stopped);
    assert_eq!(backend.active_device(), None);
}

#[test]
fn seek_while_playing_never_plays_stale_audio() {
    let (engine, backend, dir) = setup();
    let path = write_levels(dir.path(), "steps.wav", &[(5.0, 0.25), (5.0, -0.5)]);
    engine.load(path).unwrap();
    assert!(engine.play());
    assert!(pump_audible(&backend, 200).iter().all(|s| *s >= 0.0));

    assert_eq!(engine.seek(7.0), 7.0);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let out = backend.pump(200);
        assert!(
            out.iter().all(|s| *s <= 0.0),
            "audio from before the seek reached the device"
        );
        if out.iter().any(|s| *s < 0.0) {
            break;
        }
        assert!(Instant::now() < deadline, "seek never took effect");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(engine.position() >= 7.0);
    assert!(wait_for(&engine, |e| matches!(e, EngineEvent::Seeked(p) if *p == 7.0)));
}

#[test]
fn stop_twice_is_the_same_as_once() {
    let (engine, backend, dir) = setup();
    engine.load(write_wav(dir.path(), "a.wav", 10.0, 0.25)).unwrap();
    assert!(engine.play());
    pump_audible(&backend, 200);

    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), TransportState::Stopped);
    assert_eq!(engine.position(), 0.0);

    assert!(engine.stop_and_wait());
    assert_eq!(backend.active_device(), None);
    assert!(backend.pump(200).is_empty());

    let mut stops = 0;
    while let Some(event) = engine.try_recv_event() {
        if matches!(event, EngineEvent::StateChanged(TransportState::Stopped)) {
            stops += 1;
        }
    }
    assert_eq!(stops, 1);
}

#[test]
fn device_held_past_teardown_timeout_cannot_touch_the_next_session() {
    let backend = SlowReleaseBackend::new(Duration::from_millis(1500));
    let config = EngineConfig {
        teardown_timeout_ms: 200,
        ..config()
    };
    let engine = PlaybackEngine::with_backend(config, Arc::new(backend.clone()));
    let dir = tempfile::tempdir().unwrap();

    engine.load(write_wav(dir.path(), "old.wav", 10.0, -0.5)).unwrap();
    assert!(engine.play());
    let old = backend.device(0);
    pump_audible(&old, 200);

    assert!(!engine.stop_and_wait());
    assert!(old.active_device().is_some());

    engine.load(write_wav(dir.path(), "new.wav", 10.0, 0.25)).unwrap();
    assert!(engine.play());
    let new = backend.device(1);

    // The old device is still open, but renders nothing and moves no clock
    let before = engine.position();
    for _ in 0..10 {
        assert!(old.pump(800).iter().all(|s| *s == 0.0));
    }
    assert_eq!(engine.position(), before);
    assert_eq!(engine.state(), TransportState::Playing);
    assert!(!engine.has_ended());

    assert!(pump_audible(&new, 200).iter().all(|s| *s >= 0.0));
    assert!(engine.position() > before);
}

#[test]
fn deferred_open_resumes_at_the_seek_target() {
    let (engine, backend, dir) = setup();
    let path = write_levels(dir.path(), "steps.wav", &[(5.0, 0.25), (5.0, -0.5)]);
    backend.fail_next_opens(1);
    engine.load(path).unwrap();
    assert!(engine.device_id().is_none());

    engine.seek(7.0);
    assert!(engine.play());
    assert!(pump_audible(&backend, 200).iter().all(|s| *s <= 0.0));
    assert!(engine.position() >= 7.0);
}

#[test]
fn reopen_keeps_loaded_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_wav(dir.path(), "a.wav", 2.0, 0.25);
    let mut track = TrackDecoder::open(&path).unwrap().metadata().clone();
    track.title = "Renamed".to_string();
    track.duration = 42.0;

    let decoder = TrackDecoder::reopen(&track).unwrap();
    assert_eq!(decoder.metadata().title, "Renamed");
    assert_eq!(decoder.metadata().duration, 42.0);
}
