//! Audio output devices.
//!
//! A backend opens a device and drives a [`Renderer`] from the device's own
//! callback. The stream handle owns the device; dropping it releases it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, Stream, StreamConfig,
};
use parking_lot::Mutex;
use tonearm_core::{Error, Result};
use tracing::{debug, error, info, warn};

use crate::buffer::SharedRingBuffer;
use crate::transport::Transport;

/// Identity of one device acquisition. Every `open` yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Sample layout the device consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputSpec {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

/// The output-context half of a playback session.
///
/// Device callbacks call [`Renderer::render`] to pull gain-scaled samples.
pub struct Renderer {
    ring: SharedRingBuffer,
    transport: Arc<Transport>,
    /// Transport generation this renderer belongs to. Once retired it only
    /// produces silence.
    generation: u64,
    device_lost: AtomicBool,
}

impl Renderer {
    pub(crate) fn new(ring: SharedRingBuffer, transport: Arc<Transport>, generation: u64) -> Self {
        Self {
            ring,
            transport,
            generation,
            device_lost: AtomicBool::new(false),
        }
    }

    /// Fill `out` (interleaved, `channels` wide). Silence when not playing.
    ///
    /// Returns the number of frames of track audio rendered.
    pub fn render(&self, out: &mut [f32], channels: usize) -> usize {
        self.transport
            .render(self.generation, &self.ring, out, channels)
    }

    /// Called by a backend when its device disappears.
    pub fn report_device_lost(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    pub(crate) fn device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }
}

/// An open device. Dropping it stops callbacks and releases the device.
pub trait OutputStream {
    fn id(&self) -> DeviceId;
    fn spec(&self) -> OutputSpec;
    fn name(&self) -> &str;
}

/// Source of output devices.
///
/// `open` is called on the pipeline thread, which also drops the stream, so
/// streams need not be `Send`.
pub trait OutputBackend: Send + Sync {
    fn open(&self, renderer: Arc<Renderer>) -> Result<Box<dyn OutputStream>>;
}

/// cpal-backed output on the system audio host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    /// Device name to use; `None` picks the host default.
    device_name: Option<String>,
}

impl CpalBackend {
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn find_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        match &self.device_name {
            Some(wanted) => host
                .output_devices()
                .map_err(|e| Error::DeviceUnavailable(format!("Failed to list devices: {e}")))?
                .find(|d| d.name().is_ok_and(|n| &n == wanted))
                .ok_or_else(|| Error::DeviceUnavailable(format!("No output device named {wanted}"))),
            None => host
                .default_output_device()
                .ok_or_else(|| Error::DeviceUnavailable("No output device found".to_string())),
        }
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &Device,
        config: &StreamConfig,
        renderer: Arc<Renderer>,
    ) -> Result<Stream> {
        let channels = usize::from(config.channels);
        let error_renderer = renderer.clone();
        let mut scratch: Vec<f32> = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let buf = &mut scratch[..data.len()];
                    renderer.render(buf, channels);
                    for (out, sample) in data.iter_mut().zip(buf.iter()) {
                        *out = T::from_sample(*sample);
                    }
                },
                move |err| {
                    error!("Audio stream error: {err}");
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        error_renderer.report_device_lost();
                    }
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to build stream: {e}")))
    }
}

impl OutputBackend for CpalBackend {
    fn open(&self, renderer: Arc<Renderer>) -> Result<Box<dyn OutputStream>> {
        let device = self.find_device()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to get output config: {e}")))?;
        debug!("Supported output config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match sample_format {
            cpal::SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, renderer)?,
            cpal::SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, renderer)?,
            cpal::SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, renderer)?,
            other => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {other:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to start stream: {e}")))?;

        let spec = OutputSpec::new(config.sample_rate.0, config.channels);
        let id = DeviceId::allocate();
        info!(
            "Using audio output device: {name} ({} Hz, {} channels, {id})",
            spec.sample_rate, spec.channels
        );

        Ok(Box::new(CpalStream {
            _stream: stream,
            id,
            spec,
            name,
        }))
    }
}

struct CpalStream {
    _stream: Stream,
    id: DeviceId,
    spec: OutputSpec,
    name: String,
}

impl OutputStream for CpalStream {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}

#[derive(Default)]
struct VirtualState {
    active: Option<(DeviceId, Arc<Renderer>)>,
    opened: u64,
    fail_opens: usize,
}

/// A device with no hardware behind it. Time only passes when [`pump`] is
/// called, which makes playback deterministic for headless hosts and tests.
///
/// [`pump`]: VirtualBackend::pump
#[derive(Clone)]
pub struct VirtualBackend {
    spec: OutputSpec,
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualBackend {
    pub fn new(spec: OutputSpec) -> Self {
        Self {
            spec,
            state: Arc::new(Mutex::new(VirtualState::default())),
        }
    }

    pub const fn spec(&self) -> OutputSpec {
        self.spec
    }

    /// Make the next `count` opens fail as if the device were busy.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }

    /// Run the device callback for `frames` frames and return what it
    /// produced. Empty when no stream is open.
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        let state = self.state.lock();
        let Some((_, renderer)) = &state.active else {
            return Vec::new();
        };
        let channels = usize::from(self.spec.channels);
        let mut out = vec![0.0; frames * channels];
        renderer.render(&mut out, channels);
        out
    }

    /// Simulate the device being unplugged.
    pub fn disconnect(&self) {
        if let Some((id, renderer)) = &self.state.lock().active {
            warn!("Virtual output {id} disconnected");
            renderer.report_device_lost();
        }
    }

    /// Id of the currently open stream.
    pub fn active_device(&self) -> Option<DeviceId> {
        self.state.lock().active.as_ref().map(|(id, _)| *id)
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u64 {
        self.state.lock().opened
    }
}

impl OutputBackend for VirtualBackend {
    fn open(&self, renderer: Arc<Renderer>) -> Result<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(Error::DeviceUnavailable("virtual device busy".to_string()));
        }
        if let Some((id, _)) = &state.active {
            return Err(Error::DeviceUnavailable(format!("virtual device held by {id}")));
        }

        let id = DeviceId::allocate();
        state.active = Some((id, renderer));
        state.opened += 1;
        debug!("Virtual output opened ({id})");

        Ok(Box::new(VirtualStream {
            id,
            spec: self.spec,
            state: self.state.clone(),
        }))
    }
}

struct VirtualStream {
    id: DeviceId,
    spec: OutputSpec,
    state: Arc<Mutex<VirtualState>>,
}

impl OutputStream for VirtualStream {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn name(&self) -> &str {
        "virtual"
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|(id, _)| *id == self.id) {
            state.active = None;
            debug!("Virtual output released ({})", self.id);
        }
    }
}
